#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cohort_adapters::{AdapterError, FetchOutcome, Listing, ResultSource, SourcePage};
use cohort_core::{CandidateRecord, EnrichedRecord};
use cohort_storage::{
    MemoryRecordStore, MemoryRunHistory, RecordStore, RetryPolicy, StoreError, UpsertReport,
};
use cohort_sync::{
    AnalysisCache, EnrichmentClient, EnrichmentError, EnrichmentResult, EnrichmentRow,
    JobController, PullPipeline, Standardizer, UpsertEngine,
};
use tokio::sync::Semaphore;

pub const BASE: &str = "https://survey.test";

pub fn result_url(id: u64) -> String {
    format!("{BASE}/result/{id}")
}

pub fn result_html(id: u64) -> String {
    format!(
        "<html><body><dl>\
         <dt>Institution</dt><dd>University {id}</dd>\
         <dt>Program</dt><dd>Program {id}</dd>\
         <dt>Decision</dt><dd>Accepted on 17 Jan</dd>\
         <dt>Undergrad GPA</dt><dd>3.50</dd>\
         </dl></body></html>"
    )
}

/// Listing service double. Pages default to a valid result page per ID.
pub struct FakeSource {
    latest_id: Option<u64>,
    overrides: HashMap<u64, FetchOutcome>,
    gate: Option<Arc<Semaphore>>,
    fetched: Mutex<Vec<u64>>,
}

impl FakeSource {
    pub fn new(latest_id: u64) -> Self {
        Self {
            latest_id: Some(latest_id),
            overrides: HashMap::new(),
            gate: None,
            fetched: Mutex::new(Vec::new()),
        }
    }

    /// A listing that cannot be read.
    pub fn unavailable() -> Self {
        Self {
            latest_id: None,
            ..Self::new(0)
        }
    }

    pub fn with_outcome(mut self, id: u64, outcome: FetchOutcome) -> Self {
        self.overrides.insert(id, outcome);
        self
    }

    /// Every fetch waits for one permit from `gate` after being recorded.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn fetched(&self) -> Vec<u64> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSource for FakeSource {
    async fn listing(&self) -> Result<Listing, AdapterError> {
        match self.latest_id {
            Some(latest_id) => Ok(Listing {
                latest_id,
                added_on: HashMap::new(),
            }),
            None => Err(AdapterError::UpstreamUnavailable("listing returned 503".into())),
        }
    }

    async fn fetch(&self, entry_id: u64) -> FetchOutcome {
        self.fetched.lock().unwrap().push(entry_id);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.overrides.get(&entry_id).cloned().unwrap_or_else(|| {
            FetchOutcome::Valid(SourcePage {
                entry_id,
                url: result_url(entry_id),
                html: result_html(entry_id),
            })
        })
    }

    fn result_url(&self, entry_id: u64) -> String {
        result_url(entry_id)
    }
}

pub struct EchoEnricher;

#[async_trait]
impl EnrichmentClient for EchoEnricher {
    async fn standardize(
        &self,
        rows: &[EnrichmentRow],
    ) -> Result<Vec<EnrichmentResult>, EnrichmentError> {
        Ok(rows
            .iter()
            .map(|r| EnrichmentResult {
                llm_generated_program: Some(r.program.clone()),
                llm_generated_university: Some(r.university.clone()),
            })
            .collect())
    }
}

/// Never answers within any realistic timeout.
pub struct HangingEnricher;

#[async_trait]
impl EnrichmentClient for HangingEnricher {
    async fn standardize(
        &self,
        _rows: &[EnrichmentRow],
    ) -> Result<Vec<EnrichmentResult>, EnrichmentError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }
}

/// Memory store with switchable failure modes.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryRecordStore,
    /// Remaining insert calls that fail with a query error.
    pub failing_inserts: AtomicUsize,
    pub outage: AtomicBool,
    /// Report no frontier so every run rescans the same range.
    pub hide_frontier: AtomicBool,
    /// Skip the pre-enrichment lookup so duplicates reach the insert.
    pub blind_lookup: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, ids: impl IntoIterator<Item = u64>) {
        let batch = ids
            .into_iter()
            .map(|id| {
                EnrichedRecord::new(
                    CandidateRecord {
                        source_url: result_url(id),
                        ..Default::default()
                    },
                    "Seeded",
                    "Seeded",
                )
            })
            .collect::<Vec<_>>();
        self.inner.insert_batch(&batch).await.unwrap();
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn max_entry_id(&self) -> Result<Option<u64>, StoreError> {
        if self.hide_frontier.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.max_entry_id().await
    }

    async fn contains(&self, source_url: &str) -> Result<bool, StoreError> {
        if self.blind_lookup.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.contains(source_url).await
    }

    async fn insert_batch(&self, batch: &[EnrichedRecord]) -> Result<UpsertReport, StoreError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        let failing = self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StoreError::Query("serialization failure".into()));
        }
        self.inner.insert_batch(batch).await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.inner.count().await
    }
}

pub struct Options {
    pub batch_size: usize,
    pub enrichment_timeout: Duration,
    pub max_run_time: Duration,
    pub target: u32,
    pub floor: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            batch_size: 2,
            enrichment_timeout: Duration::from_secs(5),
            max_run_time: Duration::from_secs(600),
            target: 100,
            floor: 0,
        }
    }
}

pub struct Harness {
    pub controller: JobController,
    pub source: Arc<FakeSource>,
    pub store: Arc<FlakyStore>,
    pub history: Arc<MemoryRunHistory>,
    pub cache: Arc<AnalysisCache>,
}

pub fn harness(
    source: FakeSource,
    store: Arc<FlakyStore>,
    enricher: Arc<dyn EnrichmentClient>,
    options: Options,
) -> Harness {
    let source = Arc::new(source);
    let history = Arc::new(MemoryRunHistory::new());
    let cache = Arc::new(AnalysisCache::in_memory());
    let standardizer = Standardizer::new(enricher, options.batch_size, options.enrichment_timeout);
    let upsert = UpsertEngine::new(store.clone()).with_retry(RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
    });
    let pipeline = PullPipeline::new(
        source.clone(),
        store.clone(),
        standardizer,
        options.floor,
        options.max_run_time,
    )
    .with_upsert_engine(upsert);
    let controller = JobController::new(pipeline, history.clone(), cache.clone(), options.target);
    Harness {
        controller,
        source,
        store,
        history,
        cache,
    }
}

pub fn simple(latest_id: u64) -> Harness {
    harness(
        FakeSource::new(latest_id),
        Arc::new(FlakyStore::new()),
        Arc::new(EchoEnricher),
        Options::default(),
    )
}

/// Poll until `source` has recorded `n` fetches.
pub async fn wait_for_fetches(source: &FakeSource, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while source.fetched().len() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("fetches did not start in time");
}
