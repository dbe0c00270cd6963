use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::credentials::CredentialProvider;
use crate::domain::PhotoTier;
use crate::error::HarvestError;
use crate::harvest::{CancelFlag, Harvester, RetryPolicy, StopReason};
use crate::inat::ObservationApi;
use crate::materialize::{AssetClient, MaterializationResult, Materializer, PhotoJob};
use crate::normalize::{Normalizer, Observation};
use crate::query::QueryBuilder;
use crate::rate::RateGovernor;
use crate::resolve::AssetResolver;
use crate::store::ImageStore;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_results: Option<usize>,
    pub tier: PhotoTier,
    pub download: bool,
    pub workers: usize,
    pub cancel: CancelFlag,
    pub page_retry: RetryPolicy,
    pub download_retry: RetryPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_results: None,
            tier: PhotoTier::Original,
            download: true,
            workers: 1,
            cancel: CancelFlag::new(),
            page_retry: RetryPolicy::default(),
            download_retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_secs(5),
            },
        }
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub observations: Vec<Observation>,
    pub materializations: Vec<MaterializationResult>,
    pub species_count: usize,
    pub records_dropped: usize,
    pub authenticated: bool,
    pub stop_reason: Option<StopReason>,
    pub error: Option<HarvestError>,
    pub elapsed: Duration,
}

impl RunOutcome {
    pub fn images_downloaded(&self) -> usize {
        self.materializations
            .iter()
            .filter(|result| result.is_downloaded())
            .count()
    }

    pub fn images_skipped(&self) -> usize {
        self.materializations
            .iter()
            .filter(|result| result.is_skipped())
            .count()
    }

    pub fn images_failed(&self) -> usize {
        self.materializations
            .iter()
            .filter(|result| result.is_failed())
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

struct PendingBatch {
    jobs: Vec<PhotoJob>,
    targets: Vec<(usize, usize)>,
}

impl PendingBatch {
    fn new() -> Self {
        Self {
            jobs: Vec::new(),
            targets: Vec::new(),
        }
    }

    fn push(&mut self, job: PhotoJob, observation: usize, photo: usize) {
        self.jobs.push(job);
        self.targets.push((observation, photo));
    }

    fn len(&self) -> usize {
        self.jobs.len()
    }

    fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

pub struct App<A: ObservationApi, C: AssetClient> {
    api: A,
    assets: C,
    credentials: CredentialProvider,
    governor: Arc<RateGovernor>,
    resolver: AssetResolver,
    store: ImageStore,
}

impl<A: ObservationApi, C: AssetClient> App<A, C> {
    pub fn new(
        api: A,
        assets: C,
        credentials: CredentialProvider,
        governor: Arc<RateGovernor>,
        store: ImageStore,
    ) -> Self {
        Self {
            api,
            assets,
            credentials,
            governor,
            resolver: AssetResolver::new(),
            store,
        }
    }

    pub fn with_resolver(mut self, resolver: AssetResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn credentials(&self) -> &CredentialProvider {
        &self.credentials
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub fn run(
        &self,
        builder: QueryBuilder,
        options: RunOptions,
        sink: &dyn ProgressSink,
    ) -> RunOutcome {
        let start = Instant::now();
        let authenticated = self.credentials.current().is_authenticated();
        let mut outcome = RunOutcome {
            observations: Vec::new(),
            materializations: Vec::new(),
            species_count: 0,
            records_dropped: 0,
            authenticated,
            stop_reason: None,
            error: None,
            elapsed: Duration::ZERO,
        };

        let filter = builder.filter();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Harvest; center=({}, {}) radius={} mi ({:.2} km) mode={}",
                filter.center.latitude,
                filter.center.longitude,
                filter.radius_miles,
                filter.radius_km,
                if authenticated { "bearer" } else { "anonymous" }
            ),
            elapsed: None,
        });

        if options.download
            && let Err(err) = self.store.ensure_root()
        {
            outcome.error = Some(err);
            outcome.elapsed = start.elapsed();
            return outcome;
        }

        let harvester = Harvester::new(&self.api, &self.credentials, &self.governor)
            .with_retry(options.page_retry)
            .with_cancel(options.cancel.clone());
        let mut harvest = harvester.harvest(builder, options.max_results);
        let mut normalizer = Normalizer::new();
        let mut pending = PendingBatch::new();
        let batch_size = options.workers.max(1) * 8;

        for record in harvest.by_ref() {
            let raw = match record {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::error!(error = %err, "harvest stopped");
                    outcome.error = Some(err);
                    break;
                }
            };
            let observation = match normalizer.normalize(&raw) {
                Ok(observation) => observation,
                Err(err) => {
                    tracing::warn!(error = %err, "dropping record");
                    outcome.records_dropped += 1;
                    continue;
                }
            };

            let position = outcome.observations.len();
            if options.download {
                self.queue_photos(&observation, position, options.tier, &mut pending);
            }
            tracing::info!(
                observation = observation.id,
                photos = observation.photos.len(),
                species = observation
                    .species
                    .as_ref()
                    .and_then(|species| species.name.as_deref())
                    .unwrap_or("unknown"),
                "normalized observation"
            );
            outcome.observations.push(observation);

            if pending.len() >= batch_size {
                self.flush(&mut pending, &options, &mut outcome, sink, start);
            }
        }
        outcome.stop_reason = harvest.state().stop_reason();

        if !pending.is_empty() {
            self.flush(&mut pending, &options, &mut outcome, sink, start);
        }

        outcome.species_count = normalizer.registry().len();
        outcome.elapsed = start.elapsed();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; observations={} species={} downloaded={} skipped={} failed={}",
                outcome.observations.len(),
                outcome.species_count,
                outcome.images_downloaded(),
                outcome.images_skipped(),
                outcome.images_failed()
            ),
            elapsed: Some(outcome.elapsed),
        });
        outcome
    }

    fn queue_photos(
        &self,
        observation: &Observation,
        position: usize,
        tier: PhotoTier,
        pending: &mut PendingBatch,
    ) {
        let credential = self.credentials.current();
        for (photo_position, photo) in observation.photos.iter().enumerate() {
            let candidates = self.resolver.candidates(photo, tier, &credential);
            if let Some(best) = candidates.first()
                && best.is_fallback()
            {
                tracing::debug!(
                    observation = observation.id,
                    photo = photo.index,
                    requested = %tier,
                    delivered = %best.delivered,
                    "requested tier unavailable, using fallback"
                );
            }
            let destination = self.store.photo_path(observation.id, photo.index);
            pending.push(
                PhotoJob::new(photo, tier, candidates, destination),
                position,
                photo_position,
            );
        }
    }

    fn flush(
        &self,
        pending: &mut PendingBatch,
        options: &RunOptions,
        outcome: &mut RunOutcome,
        sink: &dyn ProgressSink,
        start: Instant,
    ) {
        let materializer = Materializer::new(&self.assets, &self.governor)
            .with_retry(options.download_retry)
            .with_mode(self.credentials.mode());
        let batch = std::mem::replace(pending, PendingBatch::new());
        let results = materializer.materialize_all(&batch.jobs, options.workers, &options.cancel);

        for (position, result) in results {
            let (observation, photo) = batch.targets[position];
            if let Some(photo) = outcome
                .observations
                .get_mut(observation)
                .and_then(|observation| observation.photos.get_mut(photo))
                && result.is_present()
            {
                photo.local_path = Some(result.local_path.to_string());
                photo.delivered_tier = result.delivered_tier;
            }
            outcome.materializations.push(result);
        }

        sink.event(ProgressEvent {
            message: format!(
                "phase=Materialize; downloaded={} skipped={} failed={}",
                outcome.images_downloaded(),
                outcome.images_skipped(),
                outcome.images_failed()
            ),
            elapsed: Some(start.elapsed()),
        });
    }
}
