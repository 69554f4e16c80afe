//! Persistence and outbound HTTP plumbing for the cohort ingest pipeline.

use anyhow::Context;
use sqlx::PgPool;

pub mod analysis;
pub mod history;
pub mod http;
pub mod records;

pub use analysis::{AnalysisSource, PgAnalysisSource};
pub use history::{MemoryRunHistory, PgRunHistory, RunHistory};
pub use http::{
    classify_reqwest_error, classify_status, FetchError, FetchedPage, HttpClientConfig,
    HttpFetcher, RetryDisposition, RetryPolicy,
};
pub use records::{MemoryRecordStore, PgRecordStore, RecordStore, StoreError, UpsertReport};

pub const CRATE_NAME: &str = "cohort-storage";

/// Apply the bundled SQL migrations.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("running database migrations")?;
    Ok(())
}
