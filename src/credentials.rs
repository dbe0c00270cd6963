use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::Serialize;

use crate::error::HarvestError;
use crate::rate::RateGovernor;
use crate::store::write_bytes_atomic;

pub const CLIENT_ID_KEY: &str = "INATURALIST_CLIENT_ID";
pub const CLIENT_SECRET_KEY: &str = "INATURALIST_CLIENT_SECRET";
pub const ACCESS_TOKEN_KEY: &str = "INATURALIST_ACCESS_TOKEN";
pub const REFRESH_TOKEN_KEY: &str = "INATURALIST_REFRESH_TOKEN";
pub const EXPIRES_AT_KEY: &str = "INATURALIST_TOKEN_EXPIRES_AT";

const STORE_KEYS: [&str; 5] = [
    CLIENT_ID_KEY,
    CLIENT_SECRET_KEY,
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    EXPIRES_AT_KEY,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialMode {
    Unauthenticated,
    Bearer,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    mode: CredentialMode,
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn unauthenticated() -> Self {
        Self {
            mode: CredentialMode::Unauthenticated,
            access_token: None,
            refresh_token: None,
            expires_at: None,
        }
    }

    pub fn bearer(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Self, HarvestError> {
        let access_token = access_token.into().trim().to_string();
        if access_token.is_empty() {
            return Err(HarvestError::CredentialStore(
                "bearer credential requires a non-empty access token".to_string(),
            ));
        }
        Ok(Self {
            mode: CredentialMode::Bearer,
            access_token: Some(access_token),
            refresh_token: refresh_token.filter(|token| !token.trim().is_empty()),
            expires_at,
        })
    }

    pub fn mode(&self) -> CredentialMode {
        self.mode
    }

    pub fn is_authenticated(&self) -> bool {
        self.mode == CredentialMode::Bearer
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }

    pub fn authorization_header(&self) -> Option<String> {
        self.access_token
            .as_ref()
            .map(|token| format!("Bearer {token}"))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("mode", &self.mode)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub trait TokenRefresher: Send + Sync {
    fn refresh(
        &self,
        client: &ClientIdentity,
        refresh_token: &str,
    ) -> Result<TokenGrant, HarvestError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredCredentials {
    pub fn client_identity(&self) -> Option<ClientIdentity> {
        match (&self.client_id, &self.client_secret) {
            (Some(client_id), Some(client_secret)) => Some(ClientIdentity {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            }),
            _ => None,
        }
    }

    fn from_entries(entries: &BTreeMap<String, String>) -> Result<Self, HarvestError> {
        let get = |key: &str| {
            entries
                .get(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let expires_at = match get(EXPIRES_AT_KEY) {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map_err(|err| {
                        HarvestError::CredentialStore(format!("{EXPIRES_AT_KEY}={raw}: {err}"))
                    })?
                    .with_timezone(&Utc),
            ),
            None => None,
        };
        Ok(Self {
            client_id: get(CLIENT_ID_KEY),
            client_secret: get(CLIENT_SECRET_KEY),
            access_token: get(ACCESS_TOKEN_KEY),
            refresh_token: get(REFRESH_TOKEN_KEY),
            expires_at,
        })
    }

    fn entries(&self) -> Vec<(&'static str, Option<String>)> {
        vec![
            (CLIENT_ID_KEY, self.client_id.clone()),
            (CLIENT_SECRET_KEY, self.client_secret.clone()),
            (ACCESS_TOKEN_KEY, self.access_token.clone()),
            (REFRESH_TOKEN_KEY, self.refresh_token.clone()),
            (EXPIRES_AT_KEY, self.expires_at.map(|expiry| expiry.to_rfc3339())),
        ]
    }
}

pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<StoredCredentials, HarvestError>;
    fn save(&self, credentials: &StoredCredentials) -> Result<(), HarvestError>;
}

#[derive(Debug, Clone)]
pub struct EnvFileStore {
    path: Utf8PathBuf,
    overlay_env: bool,
}

impl EnvFileStore {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            overlay_env: true,
        }
    }

    pub fn file_only(path: Utf8PathBuf) -> Self {
        Self {
            path,
            overlay_env: false,
        }
    }

    pub fn default_path() -> Utf8PathBuf {
        let local = Utf8PathBuf::from(".env");
        if local.as_std_path().exists() {
            return local;
        }
        ProjectDirs::from("org", "inaturalist", "inat-harvest")
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.config_dir().join("credentials.env")).ok()
            })
            .unwrap_or(local)
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn read_lines(&self) -> Result<Vec<String>, HarvestError> {
        if !self.path.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(self.path.as_std_path())
            .map_err(|err| HarvestError::CredentialStore(format!("read {}: {err}", self.path)))?;
        Ok(content.lines().map(str::to_string).collect())
    }
}

impl CredentialStore for EnvFileStore {
    fn load(&self) -> Result<StoredCredentials, HarvestError> {
        let mut entries = BTreeMap::new();
        for line in self.read_lines()? {
            if let Some((key, value)) = parse_env_line(&line) {
                entries.insert(key, value);
            }
        }
        if self.overlay_env {
            for key in STORE_KEYS {
                if let Ok(value) = std::env::var(key) {
                    entries.insert(key.to_string(), value);
                }
            }
        }
        StoredCredentials::from_entries(&entries)
    }

    fn save(&self, credentials: &StoredCredentials) -> Result<(), HarvestError> {
        let mut pending: BTreeMap<&str, Option<String>> =
            credentials.entries().into_iter().collect();
        let mut output = Vec::new();
        for line in self.read_lines()? {
            let Some((key, _)) = parse_env_line(&line) else {
                output.push(line);
                continue;
            };
            match pending.remove(key.as_str()) {
                Some(Some(value)) => output.push(format!("{key}={value}")),
                Some(None) => {}
                None => output.push(line),
            }
        }
        for (key, value) in pending {
            if let Some(value) = value {
                output.push(format!("{key}={value}"));
            }
        }
        let mut content = output.join("\n");
        content.push('\n');
        write_bytes_atomic(&self.path, content.as_bytes())
            .map_err(|err| HarvestError::CredentialStore(err.to_string()))
    }
}

fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value);
    Some((key.trim().to_string(), value.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialState {
    Anonymous,
    Valid(Credential),
    Expired(Credential),
    Refreshing,
    Degraded { reason: String },
}

impl CredentialState {
    pub fn mode(&self) -> CredentialMode {
        match self {
            CredentialState::Valid(_) | CredentialState::Expired(_) => CredentialMode::Bearer,
            _ => CredentialMode::Unauthenticated,
        }
    }
}

pub struct CredentialProvider {
    state: Mutex<CredentialState>,
    client: Option<ClientIdentity>,
    refresher: Option<Box<dyn TokenRefresher>>,
    store: Option<Box<dyn CredentialStore>>,
    governor: Arc<RateGovernor>,
    refresh_attempts: AtomicU32,
}

impl CredentialProvider {
    pub fn new(credential: Credential, governor: Arc<RateGovernor>) -> Self {
        let state = if credential.is_authenticated() {
            CredentialState::Valid(credential)
        } else {
            CredentialState::Anonymous
        };
        Self {
            state: Mutex::new(state),
            client: None,
            refresher: None,
            store: None,
            governor,
            refresh_attempts: AtomicU32::new(0),
        }
    }

    pub fn unauthenticated(governor: Arc<RateGovernor>) -> Self {
        Self::new(Credential::unauthenticated(), governor)
    }

    pub fn from_store(
        store: Box<dyn CredentialStore>,
        refresher: Box<dyn TokenRefresher>,
        governor: Arc<RateGovernor>,
    ) -> Result<Self, HarvestError> {
        let stored = store.load()?;
        let credential = match &stored.access_token {
            Some(token) => Credential::bearer(
                token.clone(),
                stored.refresh_token.clone(),
                stored.expires_at,
            )?,
            None => Credential::unauthenticated(),
        };
        let mut provider = Self::new(credential, governor).with_store(store);
        if let Some(client) = stored.client_identity() {
            provider = provider.with_refresh(client, refresher);
        }
        Ok(provider)
    }

    pub fn with_refresh(mut self, client: ClientIdentity, refresher: Box<dyn TokenRefresher>) -> Self {
        self.client = Some(client);
        self.refresher = Some(refresher);
        self
    }

    pub fn with_store(mut self, store: Box<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn state(&self) -> CredentialState {
        self.lock_state().clone()
    }

    pub fn mode(&self) -> CredentialMode {
        self.lock_state().mode()
    }

    pub fn refresh_attempts(&self) -> u32 {
        self.refresh_attempts.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Credential {
        self.current_at(Utc::now())
    }

    pub fn current_at(&self, now: DateTime<Utc>) -> Credential {
        let mut state = self.lock_state();
        if let CredentialState::Valid(credential) = &*state
            && credential.is_expired_at(now)
        {
            let expired = credential.clone();
            *state = CredentialState::Expired(expired);
        }

        let expired = match &*state {
            CredentialState::Valid(credential) => return credential.clone(),
            CredentialState::Expired(credential) => credential.clone(),
            CredentialState::Anonymous
            | CredentialState::Refreshing
            | CredentialState::Degraded { .. } => return Credential::unauthenticated(),
        };

        tracing::info!("access token expired, attempting refresh");
        *state = CredentialState::Refreshing;
        *state = self.refresh(&expired);
        match &*state {
            CredentialState::Valid(credential) => credential.clone(),
            _ => Credential::unauthenticated(),
        }
    }

    fn refresh(&self, expired: &Credential) -> CredentialState {
        let (Some(client), Some(refresher)) = (&self.client, &self.refresher) else {
            return self.degrade("no client identity available to refresh the access token");
        };
        let Some(refresh_token) = expired.refresh_token() else {
            return self.degrade("access token expired and no refresh token is available");
        };

        self.governor.acquire(CredentialMode::Unauthenticated);
        self.refresh_attempts.fetch_add(1, Ordering::SeqCst);
        let grant = match refresher.refresh(client, refresh_token) {
            Ok(grant) => grant,
            Err(err) => {
                let err = HarvestError::AuthUnavailable(err.to_string());
                return self.degrade(&err.to_string());
            }
        };

        let refresh_token = grant
            .refresh_token
            .clone()
            .or_else(|| Some(refresh_token.to_string()));
        let credential =
            match Credential::bearer(grant.access_token.clone(), refresh_token, grant.expires_at) {
                Ok(credential) => credential,
                Err(err) => return self.degrade(&err.to_string()),
            };
        tracing::info!(expires_at = ?credential.expires_at(), "access token refreshed");
        self.persist(client, &credential);
        CredentialState::Valid(credential)
    }

    fn persist(&self, client: &ClientIdentity, credential: &Credential) {
        let Some(store) = &self.store else {
            return;
        };
        let stored = StoredCredentials {
            client_id: Some(client.client_id.clone()),
            client_secret: Some(client.client_secret.clone()),
            access_token: credential.access_token().map(str::to_string),
            refresh_token: credential.refresh_token().map(str::to_string),
            expires_at: credential.expires_at(),
        };
        if let Err(err) = store.save(&stored) {
            tracing::warn!(error = %err, "refreshed token could not be written back");
        }
    }

    fn degrade(&self, reason: &str) -> CredentialState {
        tracing::warn!(reason, "continuing unauthenticated for the rest of the run");
        CredentialState::Degraded {
            reason: reason.to_string(),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CredentialState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
