//! Pull orchestration: frontier planning, enrichment, persistence and the
//! single-flight job controller.

use std::sync::Arc;

use anyhow::{Context, Result};
use cohort_adapters::SurveySiteSource;
use cohort_core::RunState;
use cohort_storage::{
    HttpFetcher, PgAnalysisSource, PgRecordStore, PgRunHistory, RetryPolicy, StoreError,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

pub mod analysis;
pub mod config;
pub mod controller;
pub mod fixups;
pub mod frontier;
pub mod pipeline;
pub mod schedule;
pub mod standardize;
pub mod upsert;

pub use analysis::{AnalysisCache, AnalysisService, CachedAnalysis};
pub use config::PullConfig;
pub use controller::{ControllerError, JobController};
pub use fixups::CanonicalFixups;
pub use frontier::{FrontierPlan, FrontierTracker, ScanRange};
pub use pipeline::{PullPipeline, RunContext};
pub use schedule::maybe_build_scheduler;
pub use standardize::{
    EnrichmentClient, EnrichmentError, EnrichmentResult, EnrichmentRow, HttpEnrichmentClient,
    Standardizer,
};
pub use upsert::{UpsertEngine, UpsertOutcome};

pub const CRATE_NAME: &str = "cohort-sync";

/// Conditions that end a run as `Failed`.
#[derive(Debug, Error)]
pub enum PullError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("persistence outage: {0}")]
    PersistenceOutage(String),
}

impl From<StoreError> for PullError {
    fn from(err: StoreError) -> Self {
        Self::PersistenceOutage(err.to_string())
    }
}

/// Everything a process needs to drive pulls and serve analysis.
#[derive(Clone)]
pub struct SyncRuntime {
    pub config: PullConfig,
    pub pool: PgPool,
    pub records: PgRecordStore,
    pub controller: JobController,
    pub analysis: AnalysisService,
}

pub async fn connect(config: &PullConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")
}

pub async fn bootstrap(config: PullConfig) -> Result<SyncRuntime> {
    let pool = connect(&config).await?;
    cohort_storage::migrate(&pool).await?;

    let records = PgRecordStore::new(pool.clone());
    let history = Arc::new(PgRunHistory::new(pool.clone()));
    let http = HttpFetcher::new(config.http_client())?;
    let source = Arc::new(SurveySiteSource::new(http, config.source_base_url.clone()));
    let client = Arc::new(HttpEnrichmentClient::new(
        config.enrichment_url.clone(),
        RetryPolicy::default(),
    )?);
    let fixups = CanonicalFixups::load(&config.canonical_rules_path)?;
    let standardizer = Standardizer::new(client, config.batch_size, config.enrichment_timeout)
        .with_fixups(fixups);
    let pipeline = PullPipeline::new(
        source,
        Arc::new(records.clone()),
        standardizer,
        config.frontier_floor,
        config.max_run_time,
    );

    let cache = Arc::new(AnalysisCache::load(config.analysis_cache_path.clone()).await?);
    let controller = JobController::new(pipeline, history, cache.clone(), config.target_records);
    controller.restore_from_history().await;
    let analysis = AnalysisService::new(Arc::new(PgAnalysisSource::new(pool.clone())), cache);

    info!(
        source = %config.source_base_url,
        enrichment = %config.enrichment_url,
        batch_size = config.batch_size,
        "sync runtime ready"
    );
    Ok(SyncRuntime {
        config,
        pool,
        records,
        controller,
        analysis,
    })
}

/// Run one pull in the foreground and return its terminal snapshot.
pub async fn run_pull_once_from_env(target: Option<u32>) -> Result<RunState> {
    let runtime = bootstrap(PullConfig::from_env()).await?;
    runtime
        .controller
        .start(target)
        .await
        .context("starting pull")?;
    Ok(runtime.controller.wait().await)
}
