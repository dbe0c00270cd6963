use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid date (expected YYYY-MM-DD): {0}")]
    InvalidDate(String),

    #[error("missing config file at {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("credential store error: {0}")]
    CredentialStore(String),

    #[error("credential refresh failed: {0}")]
    AuthUnavailable(String),

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("transient remote failure: {0}")]
    TransientRemote(String),

    #[error("iNaturalist returned status {status}: {message}")]
    RemoteStatus { status: u16, message: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("malformed observation record: {0}")]
    MalformedRecord(String),

    #[error("no downloadable asset for photo {index} of observation {observation}")]
    NoAssetAvailable { observation: u64, index: usize },

    #[error("harvest failed on page {page} after {attempts} attempts: {message}")]
    HarvestFailed {
        page: u32,
        attempts: u32,
        message: String,
    },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl HarvestError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HarvestError::TransientRemote(_))
    }

    pub fn is_asset_missing(&self) -> bool {
        matches!(
            self,
            HarvestError::RemoteStatus {
                status: 403 | 404 | 410,
                ..
            }
        )
    }
}
