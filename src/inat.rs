use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;

use crate::credentials::{ClientIdentity, Credential, TokenGrant, TokenRefresher};
use crate::error::HarvestError;
use crate::query::ObservationQuery;

pub const API_BASE_URL: &str = "https://api.inaturalist.org/v1";
pub const TOKEN_URL: &str = "https://www.inaturalist.org/oauth/token";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObservationPage {
    #[serde(default)]
    pub total_results: Option<u64>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub per_page: Option<u32>,
    pub results: Vec<Value>,
}

impl ObservationPage {
    pub fn with_results(results: Vec<Value>) -> Self {
        Self {
            results,
            ..Self::default()
        }
    }
}

pub trait ObservationApi: Send + Sync {
    fn fetch_page(
        &self,
        query: &ObservationQuery,
        credential: &Credential,
    ) -> Result<ObservationPage, HarvestError>;
}

pub(crate) fn user_agent_headers() -> Result<HeaderMap, HarvestError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("inat-harvest/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| HarvestError::Http(err.to_string()))?,
    );
    Ok(headers)
}

pub(crate) fn classify_send_error(err: reqwest::Error) -> HarvestError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        HarvestError::TransientRemote(err.to_string())
    } else {
        HarvestError::Http(err.to_string())
    }
}

pub(crate) fn check_status(response: Response) -> Result<Response, HarvestError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = status.as_u16();
    let message = response
        .text()
        .unwrap_or_else(|_| "iNaturalist request failed".to_string());
    if is_retryable_status(code) {
        return Err(HarvestError::TransientRemote(format!("HTTP {code}: {message}")));
    }
    Err(HarvestError::RemoteStatus {
        status: code,
        message,
    })
}

pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

#[derive(Clone)]
pub struct InatHttpClient {
    client: Client,
    base_url: String,
}

impl InatHttpClient {
    pub fn new() -> Result<Self, HarvestError> {
        Self::with_base_url(API_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, HarvestError> {
        let client = Client::builder()
            .default_headers(user_agent_headers()?)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| HarvestError::Http(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn authorize(request: RequestBuilder, credential: &Credential) -> RequestBuilder {
        match credential.authorization_header() {
            Some(header) => request.header(AUTHORIZATION, header),
            None => request,
        }
    }
}

impl ObservationApi for InatHttpClient {
    fn fetch_page(
        &self,
        query: &ObservationQuery,
        credential: &Credential,
    ) -> Result<ObservationPage, HarvestError> {
        let url = format!("{}/observations", self.base_url);
        let request = Self::authorize(self.client.get(&url).query(query.params()), credential);
        let response = request.send().map_err(classify_send_error)?;
        let response = check_status(response)?;
        let text = response.text().map_err(classify_send_error)?;
        serde_json::from_str(&text).map_err(|err| HarvestError::MalformedResponse(err.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    created_at: Option<i64>,
}

impl TokenResponse {
    fn into_grant(self, now: DateTime<Utc>) -> TokenGrant {
        let issued_at = self
            .created_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or(now);
        let expires_at = self
            .expires_in
            .and_then(TimeDelta::try_seconds)
            .map(|lifetime| issued_at + lifetime);
        TokenGrant {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
        }
    }
}

#[derive(Clone)]
pub struct OAuthHttpClient {
    client: Client,
    token_url: String,
}

impl OAuthHttpClient {
    pub fn new() -> Result<Self, HarvestError> {
        Self::with_token_url(TOKEN_URL)
    }

    pub fn with_token_url(token_url: &str) -> Result<Self, HarvestError> {
        let client = Client::builder()
            .default_headers(user_agent_headers()?)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| HarvestError::Http(err.to_string()))?;
        Ok(Self {
            client,
            token_url: token_url.to_string(),
        })
    }
}

impl TokenRefresher for OAuthHttpClient {
    fn refresh(
        &self,
        client: &ClientIdentity,
        refresh_token: &str,
    ) -> Result<TokenGrant, HarvestError> {
        let form = [
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .map_err(classify_send_error)?;
        let response = check_status(response)?;
        let token: TokenResponse = response
            .json()
            .map_err(|err| HarvestError::MalformedResponse(err.to_string()))?;
        Ok(token.into_grant(Utc::now()))
    }
}
