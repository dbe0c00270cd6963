use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use serde_json::{Value, json};

use inat_harvest::credentials::{Credential, CredentialMode, CredentialProvider};
use inat_harvest::domain::GeoFilter;
use inat_harvest::error::HarvestError;
use inat_harvest::harvest::{CancelFlag, Harvester, RetryPolicy, StopReason};
use inat_harvest::inat::{ObservationApi, ObservationPage};
use inat_harvest::query::{ObservationQuery, QueryBuilder};
use inat_harvest::rate::{RateBudget, RateGovernor};

struct CollectionApi {
    ids: Vec<u64>,
    overlap: usize,
    calls: AtomicUsize,
    modes: Mutex<Vec<CredentialMode>>,
}

impl CollectionApi {
    fn new(ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            overlap: 0,
            calls: AtomicUsize::new(0),
            modes: Mutex::new(Vec::new()),
        }
    }

    fn with_overlap(mut self, overlap: usize) -> Self {
        self.overlap = overlap;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ObservationApi for CollectionApi {
    fn fetch_page(
        &self,
        query: &ObservationQuery,
        credential: &Credential,
    ) -> Result<ObservationPage, HarvestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.modes.lock().unwrap().push(credential.mode());
        let per_page = query.per_page() as usize;
        let start = (query.page() as usize - 1) * per_page;
        if start >= self.ids.len() {
            return Ok(ObservationPage::with_results(Vec::new()));
        }
        let from = if query.page() > 1 {
            start.saturating_sub(self.overlap)
        } else {
            start
        };
        let end = (start + per_page).min(self.ids.len());
        Ok(ObservationPage::with_results(records(&self.ids[from..end])))
    }
}

#[derive(Default)]
struct ScriptedApi {
    responses: Mutex<VecDeque<Result<ObservationPage, HarvestError>>>,
    pages: Mutex<Vec<u32>>,
}

impl ScriptedApi {
    fn new(responses: Vec<Result<ObservationPage, HarvestError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            pages: Mutex::new(Vec::new()),
        }
    }

    fn pages(&self) -> Vec<u32> {
        self.pages.lock().unwrap().clone()
    }
}

impl ObservationApi for ScriptedApi {
    fn fetch_page(
        &self,
        query: &ObservationQuery,
        _credential: &Credential,
    ) -> Result<ObservationPage, HarvestError> {
        self.pages.lock().unwrap().push(query.page());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ObservationPage::with_results(Vec::new())))
    }
}

#[derive(Default)]
struct EndlessApi {
    calls: AtomicUsize,
}

impl ObservationApi for EndlessApi {
    fn fetch_page(
        &self,
        query: &ObservationQuery,
        _credential: &Credential,
    ) -> Result<ObservationPage, HarvestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ObservationPage::with_results(records(&[u64::from(
            query.page(),
        )])))
    }
}

fn records(ids: &[u64]) -> Vec<Value> {
    ids.iter().map(|id| json!({ "id": id })).collect()
}

fn ids(values: &[Value]) -> Vec<u64> {
    values
        .iter()
        .map(|value| value["id"].as_u64().unwrap())
        .collect()
}

fn builder(per_page: u32) -> QueryBuilder {
    let filter = GeoFilter::new(-8.1325, 115.3639, 5.0).unwrap();
    QueryBuilder::new(filter, per_page).unwrap()
}

fn unthrottled() -> Arc<RateGovernor> {
    Arc::new(RateGovernor::new(RateBudget::unthrottled()))
}

#[test]
fn yields_every_identity_once_in_page_order() {
    let api = CollectionApi::new(1..=10);
    let governor = unthrottled();
    let credentials = CredentialProvider::unauthenticated(Arc::clone(&governor));
    let harvester = Harvester::new(&api, &credentials, &governor);

    let mut harvest = harvester.harvest(builder(3), None);
    let emitted: Vec<Value> = harvest.by_ref().collect::<Result<_, _>>().unwrap();

    assert_eq!(ids(&emitted), (1..=10).collect::<Vec<_>>());
    assert_eq!(api.calls(), 5);
    assert_eq!(harvest.state().stop_reason(), Some(StopReason::Exhausted));
    assert_eq!(harvest.state().pages_fetched(), 5);
}

#[test]
fn overlapping_pages_are_deduplicated() {
    let api = CollectionApi::new(1..=10).with_overlap(1);
    let governor = unthrottled();
    let credentials = CredentialProvider::unauthenticated(Arc::clone(&governor));
    let harvester = Harvester::new(&api, &credentials, &governor);

    let mut harvest = harvester.harvest(builder(3), None);
    let emitted: Vec<Value> = harvest.by_ref().collect::<Result<_, _>>().unwrap();

    assert_eq!(ids(&emitted), (1..=10).collect::<Vec<_>>());
    assert_eq!(harvest.state().duplicates_dropped(), 3);
}

#[test]
fn max_results_truncates_with_minimal_calls() {
    let api = CollectionApi::new(1..=10);
    let governor = unthrottled();
    let credentials = CredentialProvider::unauthenticated(Arc::clone(&governor));
    let harvester = Harvester::new(&api, &credentials, &governor);

    let mut harvest = harvester.harvest(builder(3), Some(4));
    let emitted: Vec<Value> = harvest.by_ref().collect::<Result<_, _>>().unwrap();

    assert_eq!(ids(&emitted), vec![1, 2, 3, 4]);
    assert_eq!(api.calls(), 2);
    assert_eq!(harvest.state().stop_reason(), Some(StopReason::LimitReached));
}

#[test]
fn zero_max_results_makes_no_calls() {
    let api = CollectionApi::new(1..=10);
    let governor = unthrottled();
    let credentials = CredentialProvider::unauthenticated(Arc::clone(&governor));
    let harvester = Harvester::new(&api, &credentials, &governor);

    assert_eq!(harvester.harvest(builder(3), Some(0)).count(), 0);
    assert_eq!(api.calls(), 0);
}

#[test]
fn nothing_is_fetched_until_polled() {
    let api = CollectionApi::new(1..=10);
    let governor = unthrottled();
    let credentials = CredentialProvider::unauthenticated(Arc::clone(&governor));
    let harvester = Harvester::new(&api, &credentials, &governor);

    let mut harvest = harvester.harvest(builder(3), None);
    assert_eq!(api.calls(), 0);
    harvest.next();
    assert_eq!(api.calls(), 1);
}

#[test]
fn transient_failure_retries_same_page() {
    let api = ScriptedApi::new(vec![
        Err(HarvestError::TransientRemote("HTTP 429".to_string())),
        Ok(ObservationPage::with_results(records(&[1, 2]))),
    ]);
    let governor = unthrottled();
    let credentials = CredentialProvider::unauthenticated(Arc::clone(&governor));
    let harvester =
        Harvester::new(&api, &credentials, &governor).with_retry(RetryPolicy::immediate(3));

    let emitted: Vec<Value> = harvester
        .harvest(builder(2), None)
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(ids(&emitted), vec![1, 2]);
    assert_eq!(api.pages(), vec![1, 1, 2]);
}

#[test]
fn exhausted_retries_surface_harvest_failed() {
    let api = ScriptedApi::new(vec![
        Ok(ObservationPage::with_results(records(&[1, 2]))),
        Err(HarvestError::TransientRemote("timeout".to_string())),
        Err(HarvestError::TransientRemote("timeout".to_string())),
        Err(HarvestError::TransientRemote("timeout".to_string())),
    ]);
    let governor = unthrottled();
    let credentials = CredentialProvider::unauthenticated(Arc::clone(&governor));
    let harvester =
        Harvester::new(&api, &credentials, &governor).with_retry(RetryPolicy::immediate(2));

    let mut harvest = harvester.harvest(builder(2), None);
    assert_eq!(harvest.next().unwrap().unwrap()["id"], 1);
    assert_eq!(harvest.next().unwrap().unwrap()["id"], 2);
    assert_matches!(
        harvest.next(),
        Some(Err(HarvestError::HarvestFailed {
            page: 2,
            attempts: 3,
            ..
        }))
    );
    assert!(harvest.next().is_none());
    assert_eq!(harvest.state().stop_reason(), Some(StopReason::Failed));
    assert_eq!(api.pages(), vec![1, 2, 2, 2]);
}

#[test]
fn non_transient_failure_is_not_retried() {
    let api = ScriptedApi::new(vec![Err(HarvestError::MalformedResponse(
        "expected value".to_string(),
    ))]);
    let governor = unthrottled();
    let credentials = CredentialProvider::unauthenticated(Arc::clone(&governor));
    let harvester =
        Harvester::new(&api, &credentials, &governor).with_retry(RetryPolicy::immediate(5));

    let mut harvest = harvester.harvest(builder(2), None);
    assert_matches!(harvest.next(), Some(Err(HarvestError::MalformedResponse(_))));
    assert_eq!(api.pages(), vec![1]);
}

#[test]
fn page_guard_treats_endless_collection_as_exhausted() {
    let api = EndlessApi::default();
    let governor = unthrottled();
    let credentials = CredentialProvider::unauthenticated(Arc::clone(&governor));
    let harvester = Harvester::new(&api, &credentials, &governor).with_max_pages(3);

    let mut harvest = harvester.harvest(builder(200), None);
    let emitted: Vec<Value> = harvest.by_ref().collect::<Result<_, _>>().unwrap();

    assert_eq!(ids(&emitted), vec![1, 2, 3]);
    assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    assert_eq!(harvest.state().stop_reason(), Some(StopReason::PageBound));
}

#[test]
fn result_window_bounds_pages() {
    assert_eq!(builder(200).max_pages(), 50);
    assert_eq!(builder(3).max_pages(), 3334);
}

#[test]
fn cancellation_is_checked_between_pages() {
    let api = CollectionApi::new(1..=10);
    let governor = unthrottled();
    let credentials = CredentialProvider::unauthenticated(Arc::clone(&governor));
    let cancel = CancelFlag::new();
    let harvester = Harvester::new(&api, &credentials, &governor).with_cancel(cancel.clone());

    let mut harvest = harvester.harvest(builder(3), None);
    let mut emitted = Vec::new();
    for record in harvest.by_ref() {
        emitted.push(record.unwrap());
        cancel.cancel();
    }

    assert_eq!(ids(&emitted), vec![1, 2, 3]);
    assert_eq!(api.calls(), 1);
    assert_eq!(harvest.state().stop_reason(), Some(StopReason::Cancelled));
}

#[test]
fn bearer_credential_reaches_the_api() {
    let api = CollectionApi::new(1..=2);
    let governor = unthrottled();
    let credentials = CredentialProvider::new(
        Credential::bearer("token", None, None).unwrap(),
        Arc::clone(&governor),
    );
    let harvester = Harvester::new(&api, &credentials, &governor);

    assert_eq!(harvester.harvest(builder(2), None).count(), 2);
    assert!(
        api.modes
            .lock()
            .unwrap()
            .iter()
            .all(|mode| *mode == CredentialMode::Bearer)
    );
}

#[test]
fn calls_are_spaced_by_the_governor() {
    let api = CollectionApi::new(1..=4);
    let governor = Arc::new(RateGovernor::new(RateBudget {
        anonymous: Duration::from_millis(30),
        authenticated: Duration::from_millis(10),
    }));
    let credentials = CredentialProvider::unauthenticated(Arc::clone(&governor));
    let harvester = Harvester::new(&api, &credentials, &governor);

    let start = Instant::now();
    assert_eq!(harvester.harvest(builder(2), None).count(), 4);
    assert_eq!(api.calls(), 3);
    assert!(start.elapsed() >= Duration::from_millis(60));
}
