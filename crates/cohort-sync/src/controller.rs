//! Single-flight owner of the pull run.

use std::sync::Arc;

use chrono::Utc;
use cohort_core::{RunState, RunStatus};
use cohort_storage::RunHistory;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::analysis::AnalysisCache;
use crate::pipeline::{PullPipeline, RunContext};

pub const INTERRUPTED_BY_RESTART: &str = "interrupted by process restart";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControllerError {
    #[error("a pull is already running")]
    AlreadyRunning,
}

struct ActiveRun {
    run_id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    pipeline: PullPipeline,
    history: Arc<dyn RunHistory>,
    cache: Arc<AnalysisCache>,
    default_target: u32,
    state: Arc<watch::Sender<RunState>>,
    active: Mutex<Option<ActiveRun>>,
}

/// Cheap to clone; every clone drives the same controller.
#[derive(Clone)]
pub struct JobController {
    inner: Arc<Inner>,
}

impl JobController {
    pub fn new(
        pipeline: PullPipeline,
        history: Arc<dyn RunHistory>,
        cache: Arc<AnalysisCache>,
        default_target: u32,
    ) -> Self {
        let (state, _) = watch::channel(RunState::idle());
        Self {
            inner: Arc::new(Inner {
                pipeline,
                history,
                cache,
                default_target,
                state: Arc::new(state),
                active: Mutex::new(None),
            }),
        }
    }

    pub fn default_target(&self) -> u32 {
        self.inner.default_target
    }

    pub fn status(&self) -> RunState {
        self.inner.state.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.borrow().status == RunStatus::Running
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.inner.state.subscribe()
    }

    /// Start a run in the background and return its initial snapshot.
    ///
    /// A rejected call leaves the current snapshot untouched.
    pub async fn start(&self, target: Option<u32>) -> Result<RunState, ControllerError> {
        let mut active = self.inner.active.lock().await;
        if let Some(run) = active.as_ref() {
            if self.is_running() {
                if !run.handle.is_finished() {
                    return Err(ControllerError::AlreadyRunning);
                }
                warn!(run_id = %run.run_id, "previous pull task ended without finishing its run");
                self.inner.state.send_modify(|s| {
                    let now = Utc::now();
                    s.status = RunStatus::Failed;
                    s.error = Some("pull task ended unexpectedly".to_string());
                    s.finished_at = Some(now);
                    s.updated_at = now;
                });
            }
        }

        let run_id = Uuid::new_v4();
        let target = target.unwrap_or(self.inner.default_target);
        let fresh = RunState::started(run_id, target, Utc::now());
        self.inner.state.send_replace(fresh.clone());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(drive(self.inner.clone(), run_id, target, cancel.clone()));
        *active = Some(ActiveRun {
            run_id,
            cancel,
            handle,
        });
        Ok(fresh)
    }

    /// Request a graceful stop. Returns whether a running pull was signalled.
    pub async fn cancel(&self) -> bool {
        let active = self.inner.active.lock().await;
        match active.as_ref() {
            Some(run) if self.is_running() => {
                info!(run_id = %run.run_id, "pull cancellation requested");
                run.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Resolve once the current run (if any) reaches a terminal status.
    pub async fn wait(&self) -> RunState {
        let mut rx = self.subscribe();
        let state = match rx.wait_for(|s| s.status != RunStatus::Running).await {
            Ok(state) => state.clone(),
            Err(_) => self.status(),
        };
        state
    }

    /// Adopt the most recent recorded run as the current snapshot.
    ///
    /// A run still marked running was owned by a dead process and is closed out as failed.
    pub async fn restore_from_history(&self) {
        if self.is_running() {
            return;
        }
        let latest = match self.inner.history.latest().await {
            Ok(Some(latest)) => latest,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "could not read pull history");
                return;
            }
        };
        let mut restored = latest;
        if restored.status == RunStatus::Running {
            let now = Utc::now();
            restored.status = RunStatus::Failed;
            restored.error = Some(INTERRUPTED_BY_RESTART.to_string());
            restored.finished_at = Some(now);
            restored.updated_at = now;
            if let Err(err) = self.inner.history.record(&restored).await {
                warn!(error = %err, "could not close out interrupted pull");
            }
        }
        info!(run_id = ?restored.run_id, status = restored.status.as_str(), "restored last pull");
        self.inner.state.send_replace(restored);
    }
}

async fn drive(inner: Arc<Inner>, run_id: Uuid, target: u32, cancel: CancellationToken) {
    info!(%run_id, target, "pull_started");
    let ctx = RunContext::new(inner.state.clone(), cancel, inner.history.clone());
    ctx.checkpoint().await;

    let result = inner.pipeline.execute(target, &ctx).await;

    let now = Utc::now();
    let mut finished = ctx.snapshot();
    finished.finished_at = Some(now);
    finished.updated_at = now;
    match &result {
        Ok(status) => finished.status = *status,
        Err(err) => {
            finished.status = RunStatus::Failed;
            finished.error = Some(err.to_string());
        }
    }

    if finished.counters.inserted > 0 {
        inner.cache.invalidate().await;
    }
    if let Err(err) = inner.history.record(&finished).await {
        warn!(%run_id, error = %err, "could not record finished pull");
    }

    let c = finished.counters;
    match &result {
        Ok(_) => info!(
            %run_id,
            status = finished.status.as_str(),
            processed = c.processed,
            inserted = c.inserted,
            duplicates = c.duplicates,
            failed_batches = c.failed_batches,
            elapsed_secs = finished.elapsed_seconds(),
            "pull_finished"
        ),
        Err(err) => error!(
            %run_id,
            error = %err,
            processed = c.processed,
            inserted = c.inserted,
            "pull_failed"
        ),
    }
    inner.state.send_replace(finished);
}
