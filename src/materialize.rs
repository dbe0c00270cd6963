use std::fs::File;
use std::io::{self, Read, Seek, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;
use serde::Serialize;

use crate::credentials::CredentialMode;
use crate::domain::PhotoTier;
use crate::error::HarvestError;
use crate::harvest::{CancelFlag, RetryPolicy};
use crate::inat::{check_status, classify_send_error, user_agent_headers};
use crate::normalize::Photo;
use crate::rate::RateGovernor;
use crate::resolve::ResolvedAsset;
use crate::store::temp_file_beside;

pub trait AssetClient: Send + Sync {
    fn fetch_to(&self, url: &str, sink: &mut dyn Write) -> Result<u64, HarvestError>;
}

#[derive(Clone)]
pub struct AssetHttpClient {
    client: Client,
}

impl AssetHttpClient {
    pub fn new() -> Result<Self, HarvestError> {
        let client = Client::builder()
            .default_headers(user_agent_headers()?)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| HarvestError::Http(err.to_string()))?;
        Ok(Self { client })
    }
}

impl AssetClient for AssetHttpClient {
    fn fetch_to(&self, url: &str, sink: &mut dyn Write) -> Result<u64, HarvestError> {
        let response = self.client.get(url).send().map_err(classify_send_error)?;
        let mut response = check_status(response)?;
        let mut buffer = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let read = match response.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(HarvestError::TransientRemote(format!(
                        "body of {url} cut short after {total} bytes: {err}"
                    )));
                }
            };
            sink.write_all(&buffer[..read])
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            total += read as u64;
        }
        Ok(total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoAsset,
    AssetMissing,
    Remote,
    Filesystem,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MaterializationOutcome {
    Downloaded { bytes: u64 },
    SkippedAlreadyPresent,
    Failed { kind: FailureKind, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterializationResult {
    pub observation_id: u64,
    pub photo_index: usize,
    pub photo_id: Option<u64>,
    pub requested_tier: PhotoTier,
    pub delivered_tier: Option<PhotoTier>,
    pub url: Option<String>,
    pub local_path: Utf8PathBuf,
    #[serde(flatten)]
    pub outcome: MaterializationOutcome,
}

impl MaterializationResult {
    pub fn is_downloaded(&self) -> bool {
        matches!(self.outcome, MaterializationOutcome::Downloaded { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, MaterializationOutcome::SkippedAlreadyPresent)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, MaterializationOutcome::Failed { .. })
    }

    pub fn is_present(&self) -> bool {
        !self.is_failed()
    }

    fn asset_missing(&self) -> bool {
        matches!(
            self.outcome,
            MaterializationOutcome::Failed {
                kind: FailureKind::AssetMissing,
                ..
            }
        )
    }
}

#[derive(Debug, Clone)]
pub struct PhotoJob {
    pub observation_id: u64,
    pub photo_index: usize,
    pub photo_id: Option<u64>,
    pub requested: PhotoTier,
    pub candidates: Vec<ResolvedAsset>,
    pub destination: Utf8PathBuf,
}

impl PhotoJob {
    pub fn new(
        photo: &Photo,
        requested: PhotoTier,
        candidates: Vec<ResolvedAsset>,
        destination: Utf8PathBuf,
    ) -> Self {
        Self {
            observation_id: photo.observation_id,
            photo_index: photo.index,
            photo_id: photo.id,
            requested,
            candidates,
            destination,
        }
    }

    fn result(
        &self,
        asset: Option<&ResolvedAsset>,
        outcome: MaterializationOutcome,
    ) -> MaterializationResult {
        MaterializationResult {
            observation_id: self.observation_id,
            photo_index: self.photo_index,
            photo_id: self.photo_id,
            requested_tier: self.requested,
            delivered_tier: asset.map(|asset| asset.delivered),
            url: asset.map(|asset| asset.url.clone()),
            local_path: self.destination.clone(),
            outcome,
        }
    }
}

pub struct Materializer<'a, C: AssetClient> {
    client: &'a C,
    governor: &'a RateGovernor,
    retry: RetryPolicy,
    mode: CredentialMode,
}

impl<'a, C: AssetClient> Materializer<'a, C> {
    pub fn new(client: &'a C, governor: &'a RateGovernor) -> Self {
        Self {
            client,
            governor,
            retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_secs(5),
            },
            mode: CredentialMode::Unauthenticated,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_mode(mut self, mode: CredentialMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn materialize(&self, job: &PhotoJob, asset: &ResolvedAsset) -> MaterializationResult {
        let destination = job.destination.as_path();
        if is_present(destination) {
            tracing::debug!(path = %destination, "skipping existing file");
            return job.result(Some(asset), MaterializationOutcome::SkippedAlreadyPresent);
        }

        match self.download(&asset.url, destination) {
            Ok(bytes) => {
                tracing::info!(
                    path = %destination,
                    bytes,
                    tier = %asset.delivered,
                    "downloaded photo"
                );
                job.result(Some(asset), MaterializationOutcome::Downloaded { bytes })
            }
            Err(err) => {
                let kind = if err.is_asset_missing() {
                    FailureKind::AssetMissing
                } else if matches!(err, HarvestError::Filesystem(_)) {
                    FailureKind::Filesystem
                } else {
                    FailureKind::Remote
                };
                tracing::debug!(url = %asset.url, error = %err, "photo download failed");
                job.result(
                    Some(asset),
                    MaterializationOutcome::Failed {
                        kind,
                        reason: err.to_string(),
                    },
                )
            }
        }
    }

    pub fn materialize_job(&self, job: &PhotoJob) -> MaterializationResult {
        if is_present(&job.destination) {
            tracing::debug!(path = %job.destination, "skipping existing file");
            return job.result(None, MaterializationOutcome::SkippedAlreadyPresent);
        }

        let mut last = None;
        for asset in &job.candidates {
            let result = self.materialize(job, asset);
            if !result.asset_missing() {
                return result;
            }
            tracing::debug!(url = %asset.url, "asset missing, trying next tier");
            last = Some(result);
        }

        match last {
            Some(result) => {
                tracing::warn!(
                    observation = job.observation_id,
                    photo = job.photo_index,
                    "photo not found at any tier, it may have been deleted"
                );
                result
            }
            None => {
                let err = HarvestError::NoAssetAvailable {
                    observation: job.observation_id,
                    index: job.photo_index,
                };
                job.result(
                    None,
                    MaterializationOutcome::Failed {
                        kind: FailureKind::NoAsset,
                        reason: err.to_string(),
                    },
                )
            }
        }
    }

    pub fn materialize_all(
        &self,
        jobs: &[PhotoJob],
        workers: usize,
        cancel: &CancelFlag,
    ) -> Vec<(usize, MaterializationResult)> {
        let workers = workers.clamp(1, jobs.len().max(1));
        if workers == 1 {
            let mut results = Vec::with_capacity(jobs.len());
            for (position, job) in jobs.iter().enumerate() {
                if cancel.is_cancelled() {
                    break;
                }
                results.push((position, self.materialize_job(job)));
            }
            return results;
        }

        let next = AtomicUsize::new(0);
        let results = Mutex::new(Vec::with_capacity(jobs.len()));
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let position = next.fetch_add(1, Ordering::SeqCst);
                        let Some(job) = jobs.get(position) else {
                            break;
                        };
                        let result = self.materialize_job(job);
                        results
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push((position, result));
                    }
                });
            }
        });
        let mut results = results.into_inner().unwrap_or_else(PoisonError::into_inner);
        results.sort_by_key(|(position, _)| *position);
        results
    }

    fn download(&self, url: &str, destination: &Utf8Path) -> Result<u64, HarvestError> {
        let mut temp = temp_file_beside(destination)?;
        let mut attempt = 0u32;
        let bytes = loop {
            self.governor.acquire(self.mode);
            let file = temp.as_file_mut();
            reset(file).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            match self.client.fetch_to(url, file) {
                Ok(bytes) => break bytes,
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(url, attempt, error = %err, "retrying download in {delay:?}");
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        };

        if bytes == 0 {
            return Err(HarvestError::MalformedResponse(format!(
                "empty response body from {url}"
            )));
        }
        temp.as_file()
            .sync_all()
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        temp.persist(destination.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        Ok(bytes)
    }
}

fn reset(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.rewind()
}

fn is_present(path: &Utf8Path) -> bool {
    path.as_std_path().is_file()
}
