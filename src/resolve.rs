use serde::Serialize;

use crate::credentials::Credential;
use crate::domain::PhotoTier;
use crate::error::HarvestError;
use crate::normalize::Photo;

pub const OPEN_DATA_BASE_URL: &str = "https://inaturalist-open-data.s3.amazonaws.com/photos";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlSource {
    Direct,
    Constructed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedAsset {
    pub url: String,
    pub requested: PhotoTier,
    pub delivered: PhotoTier,
    pub source: UrlSource,
}

impl ResolvedAsset {
    pub fn is_fallback(&self) -> bool {
        self.requested != self.delivered
    }
}

#[derive(Debug, Clone)]
pub struct AssetResolver {
    open_data_base: String,
}

impl Default for AssetResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetResolver {
    pub fn new() -> Self {
        Self::with_base_url(OPEN_DATA_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            open_data_base: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn constructed_url(&self, photo: &Photo, tier: PhotoTier) -> Option<String> {
        let id = photo.id?;
        Some(format!(
            "{}/{id}/{}.{}",
            self.open_data_base,
            tier.as_str(),
            extension_hint(photo)
        ))
    }

    pub fn candidates(
        &self,
        photo: &Photo,
        requested: PhotoTier,
        credential: &Credential,
    ) -> Vec<ResolvedAsset> {
        if photo.hidden {
            return Vec::new();
        }

        let tiers = std::iter::once(requested).chain(
            PhotoTier::FALLBACK_ORDER
                .into_iter()
                .filter(move |tier| *tier != requested),
        );

        let mut candidates: Vec<ResolvedAsset> = Vec::new();
        for tier in tiers {
            let direct = photo
                .urls
                .get(tier)
                .map(|url| (url.to_string(), UrlSource::Direct));
            let constructed = self
                .constructed_url(photo, tier)
                .map(|url| (url, UrlSource::Constructed));
            let ordered = if credential.is_authenticated() {
                [direct, constructed]
            } else {
                [constructed, direct]
            };
            for (url, source) in ordered.into_iter().flatten() {
                if candidates.iter().any(|existing| existing.url == url) {
                    continue;
                }
                candidates.push(ResolvedAsset {
                    url,
                    requested,
                    delivered: tier,
                    source,
                });
            }
        }
        candidates
    }

    pub fn resolve(
        &self,
        photo: &Photo,
        requested: PhotoTier,
        credential: &Credential,
    ) -> Result<ResolvedAsset, HarvestError> {
        self.candidates(photo, requested, credential)
            .into_iter()
            .next()
            .ok_or(HarvestError::NoAssetAvailable {
                observation: photo.observation_id,
                index: photo.index,
            })
    }
}

fn extension_hint(photo: &Photo) -> &'static str {
    let Some(url) = photo.urls.any() else {
        return "jpg";
    };
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".jpeg") {
        "jpeg"
    } else if path.ends_with(".png") {
        "png"
    } else if path.ends_with(".gif") {
        "gif"
    } else {
        "jpg"
    }
}
