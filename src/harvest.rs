use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::credentials::CredentialProvider;
use crate::error::HarvestError;
use crate::inat::{ObservationApi, ObservationPage};
use crate::normalize::record_id;
use crate::query::{PageCursor, QueryBuilder};
use crate::rate::RateGovernor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Exhausted,
    LimitReached,
    PageBound,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct HarvestState {
    cursor: PageCursor,
    emitted: HashSet<u64>,
    emitted_count: usize,
    pages_fetched: u32,
    duplicates_dropped: usize,
    stopped: Option<StopReason>,
}

impl Default for HarvestState {
    fn default() -> Self {
        Self::new()
    }
}

impl HarvestState {
    pub fn new() -> Self {
        Self {
            cursor: PageCursor::first(),
            emitted: HashSet::new(),
            emitted_count: 0,
            pages_fetched: 0,
            duplicates_dropped: 0,
            stopped: None,
        }
    }

    pub fn cursor(&self) -> PageCursor {
        self.cursor
    }

    pub fn emitted_count(&self) -> usize {
        self.emitted_count
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    pub fn duplicates_dropped(&self) -> usize {
        self.duplicates_dropped
    }

    pub fn has_emitted(&self, id: u64) -> bool {
        self.emitted.contains(&id)
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stopped
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_some()
    }

    pub fn stop(&mut self, reason: StopReason) {
        self.stopped.get_or_insert(reason);
    }

    fn limit_reached(&self, max_results: Option<usize>) -> bool {
        max_results.is_some_and(|limit| self.emitted_count >= limit)
    }

    pub fn accept_page(&mut self, records: Vec<Value>, max_results: Option<usize>) -> Vec<Value> {
        self.pages_fetched += 1;
        if records.is_empty() {
            self.stop(StopReason::Exhausted);
            return Vec::new();
        }

        let mut accepted = Vec::with_capacity(records.len());
        for record in records {
            if self.limit_reached(max_results) {
                break;
            }
            let Some(id) = record_id(&record) else {
                accepted.push(record);
                continue;
            };
            if !self.emitted.insert(id) {
                self.duplicates_dropped += 1;
                tracing::debug!(id, "dropping observation already emitted by an earlier page");
                continue;
            }
            self.emitted_count += 1;
            accepted.push(record);
        }

        if self.limit_reached(max_results) {
            self.stop(StopReason::LimitReached);
        }
        self.cursor = self.cursor.next();
        accepted
    }
}

pub struct Harvester<'a, A: ObservationApi> {
    api: &'a A,
    credentials: &'a CredentialProvider,
    governor: &'a RateGovernor,
    retry: RetryPolicy,
    cancel: CancelFlag,
    max_pages: Option<u32>,
}

impl<'a, A: ObservationApi> Harvester<'a, A> {
    pub fn new(
        api: &'a A,
        credentials: &'a CredentialProvider,
        governor: &'a RateGovernor,
    ) -> Self {
        Self {
            api,
            credentials,
            governor,
            retry: RetryPolicy::default(),
            cancel: CancelFlag::new(),
            max_pages: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    pub fn harvest(&self, builder: QueryBuilder, max_results: Option<usize>) -> Harvest<'a, A> {
        let max_pages = match self.max_pages {
            Some(limit) => limit.min(builder.max_pages()),
            None => builder.max_pages(),
        };
        let mut state = HarvestState::new();
        if max_results == Some(0) {
            state.stop(StopReason::LimitReached);
        }
        Harvest {
            api: self.api,
            credentials: self.credentials,
            governor: self.governor,
            retry: self.retry,
            cancel: self.cancel.clone(),
            builder,
            max_results,
            max_pages,
            state,
            buffer: VecDeque::new(),
        }
    }
}

pub struct Harvest<'a, A: ObservationApi> {
    api: &'a A,
    credentials: &'a CredentialProvider,
    governor: &'a RateGovernor,
    retry: RetryPolicy,
    cancel: CancelFlag,
    builder: QueryBuilder,
    max_results: Option<usize>,
    max_pages: u32,
    state: HarvestState,
    buffer: VecDeque<Value>,
}

impl<A: ObservationApi> Harvest<'_, A> {
    pub fn state(&self) -> &HarvestState {
        &self.state
    }

    fn fetch_current_page(&self) -> Result<ObservationPage, HarvestError> {
        let query = self.builder.build(self.state.cursor());
        let page = query.page();
        let mut attempt = 0u32;
        loop {
            let credential = self.credentials.current();
            self.governor.acquire(credential.mode());
            tracing::debug!(page, mode = ?credential.mode(), "requesting observation page");
            match self.api.fetch_page(&query, &credential) {
                Ok(result) => return Ok(result),
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        page,
                        attempt,
                        max_retries = self.retry.max_retries,
                        error = %err,
                        "transient failure, retrying page in {delay:?}"
                    );
                    thread::sleep(delay);
                }
                Err(err) if err.is_transient() => {
                    return Err(HarvestError::HarvestFailed {
                        page,
                        attempts: attempt + 1,
                        message: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl<A: ObservationApi> Iterator for Harvest<'_, A> {
    type Item = Result<Value, HarvestError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(Ok(record));
            }
            if self.state.is_stopped() {
                return None;
            }
            if self.cancel.is_cancelled() {
                tracing::info!(page = self.state.cursor().page(), "harvest cancelled");
                self.state.stop(StopReason::Cancelled);
                return None;
            }
            if self.state.cursor().page() > self.max_pages {
                tracing::info!(
                    max_pages = self.max_pages,
                    "page guard reached, treating collection as exhausted"
                );
                self.state.stop(StopReason::PageBound);
                return None;
            }

            let page_number = self.state.cursor().page();
            match self.fetch_current_page() {
                Ok(page) => {
                    let received = page.results.len();
                    let accepted = self.state.accept_page(page.results, self.max_results);
                    tracing::info!(
                        page = page_number,
                        received,
                        emitted = accepted.len(),
                        total = self.state.emitted_count(),
                        "fetched observation page"
                    );
                    self.buffer.extend(accepted);
                }
                Err(err) => {
                    self.state.stop(StopReason::Failed);
                    return Some(Err(err));
                }
            }
        }
    }
}
