//! One pull run: fetch, extract, enrich and persist IDs across the planned range.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cohort_adapters::{extract_candidate, FetchOutcome, ResultSource};
use cohort_core::{CandidateRecord, RunState, RunStatus};
use cohort_storage::{RecordStore, RunHistory};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::frontier::FrontierTracker;
use crate::standardize::Standardizer;
use crate::upsert::{UpsertEngine, UpsertOutcome};
use crate::PullError;

/// Handle a running pull uses to publish progress and observe cancellation.
pub struct RunContext {
    progress: Arc<watch::Sender<RunState>>,
    cancel: CancellationToken,
    history: Arc<dyn RunHistory>,
    started: Instant,
}

impl RunContext {
    pub fn new(
        progress: Arc<watch::Sender<RunState>>,
        cancel: CancellationToken,
        history: Arc<dyn RunHistory>,
    ) -> Self {
        Self {
            progress,
            cancel,
            history,
            started: Instant::now(),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut RunState)) {
        self.progress.send_modify(|state| {
            f(state);
            state.updated_at = Utc::now();
        });
    }

    pub fn snapshot(&self) -> RunState {
        self.progress.borrow().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Best effort; a history write failure never stops the run.
    pub async fn checkpoint(&self) {
        let snapshot = self.snapshot();
        if let Err(err) = self.history.record(&snapshot).await {
            warn!(error = %err, "failed to checkpoint pull history");
        }
    }
}

pub struct PullPipeline {
    frontier: FrontierTracker,
    source: Arc<dyn ResultSource>,
    store: Arc<dyn RecordStore>,
    standardizer: Standardizer,
    upsert: UpsertEngine,
    max_run_time: Duration,
}

impl PullPipeline {
    pub fn new(
        source: Arc<dyn ResultSource>,
        store: Arc<dyn RecordStore>,
        standardizer: Standardizer,
        frontier_floor: u64,
        max_run_time: Duration,
    ) -> Self {
        Self {
            frontier: FrontierTracker::new(store.clone(), source.clone(), frontier_floor),
            upsert: UpsertEngine::new(store.clone()),
            source,
            store,
            standardizer,
            max_run_time,
        }
    }

    pub fn with_upsert_engine(mut self, upsert: UpsertEngine) -> Self {
        self.upsert = upsert;
        self
    }

    pub fn frontier(&self) -> &FrontierTracker {
        &self.frontier
    }

    /// Run to a terminal status. `Err` means the run failed.
    pub async fn execute(&self, target: u32, ctx: &RunContext) -> Result<RunStatus, PullError> {
        let plan = self.frontier.plan(target).await?;
        ctx.update(|s| {
            s.range_start = plan.range.map(|r| r.start);
            s.range_end = plan.range.map(|r| r.end);
        });
        ctx.checkpoint().await;

        let Some(range) = plan.range else {
            info!(current_max = plan.current_max, "no new entries upstream");
            return Ok(RunStatus::Completed);
        };
        if ctx.is_cancelled() {
            return Ok(RunStatus::Cancelled);
        }

        let batch_size = self.standardizer.batch_size();
        let mut pending: Vec<CandidateRecord> = Vec::with_capacity(batch_size);
        for entry_id in range.ids() {
            ctx.update(|s| s.last_attempted = Some(entry_id));
            let added_on = plan.added_on.get(&entry_id).map(String::as_str);
            self.process_entry(entry_id, added_on, &mut pending, ctx).await?;

            if ctx.is_cancelled() {
                info!(entry_id, discarded = pending.len(), "pull cancelled");
                return Ok(RunStatus::Cancelled);
            }
            if ctx.elapsed() >= self.max_run_time {
                info!(entry_id, "pull time budget exhausted");
                self.flush(&mut pending, ctx).await?;
                return Ok(RunStatus::TimedOut);
            }
            if pending.len() >= batch_size {
                self.flush(&mut pending, ctx).await?;
            }
        }
        self.flush(&mut pending, ctx).await?;
        Ok(RunStatus::Completed)
    }

    async fn process_entry(
        &self,
        entry_id: u64,
        added_on: Option<&str>,
        pending: &mut Vec<CandidateRecord>,
        ctx: &RunContext,
    ) -> Result<(), PullError> {
        let outcome = self.source.fetch(entry_id).await;
        ctx.update(|s| s.counters.processed += 1);
        let page = match outcome {
            FetchOutcome::Valid(page) => page,
            FetchOutcome::Placeholder => {
                debug!(entry_id, "placeholder page skipped");
                ctx.update(|s| s.counters.placeholders += 1);
                return Ok(());
            }
            FetchOutcome::NotFound => {
                ctx.update(|s| s.counters.not_found += 1);
                return Ok(());
            }
            FetchOutcome::TransientError(error) => {
                warn!(entry_id, error = %error, "entry skipped after fetch retries");
                ctx.update(|s| s.counters.fetch_failures += 1);
                return Ok(());
            }
        };

        let Some(candidate) = extract_candidate(&page.html, &page.url, added_on) else {
            debug!(entry_id, "result page missing required fields");
            ctx.update(|s| s.counters.dropped += 1);
            return Ok(());
        };

        if pending.iter().any(|p| p.source_url == candidate.source_url) {
            ctx.update(|s| s.counters.duplicates += 1);
            return Ok(());
        }
        match self.store.contains(&candidate.source_url).await {
            Ok(true) => {
                ctx.update(|s| s.counters.duplicates += 1);
                return Ok(());
            }
            Ok(false) => {}
            Err(err) if err.is_outage() => return Err(PullError::PersistenceOutage(err.to_string())),
            Err(err) => warn!(entry_id, error = %err, "duplicate pre-check failed; deferring to upsert"),
        }
        pending.push(candidate);
        Ok(())
    }

    async fn flush(
        &self,
        pending: &mut Vec<CandidateRecord>,
        ctx: &RunContext,
    ) -> Result<(), PullError> {
        if pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(pending);
        let enriched = self.standardizer.standardize(batch).await;
        match self.upsert.upsert(&enriched).await? {
            UpsertOutcome::Committed(report) => {
                info!(
                    inserted = report.inserted,
                    duplicates = report.duplicates,
                    "batch committed"
                );
                ctx.update(|s| {
                    s.counters.inserted += report.inserted;
                    s.counters.duplicates += report.duplicates;
                });
            }
            UpsertOutcome::Skipped { error } => {
                ctx.update(|s| {
                    s.counters.failed_batches += 1;
                    s.last_batch_error = Some(error);
                });
            }
        }
        ctx.checkpoint().await;
        Ok(())
    }
}
