//! Pull run history, so run outcomes survive a process restart.

use async_trait::async_trait;
use cohort_core::{RunCounters, RunState, RunStatus};
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::StoreError;

#[async_trait]
pub trait RunHistory: Send + Sync {
    /// Insert or update the row for `state.run_id`.
    async fn record(&self, state: &RunState) -> Result<(), StoreError>;

    async fn latest(&self) -> Result<Option<RunState>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgRunHistory {
    pool: PgPool,
}

impl PgRunHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunHistory for PgRunHistory {
    async fn record(&self, state: &RunState) -> Result<(), StoreError> {
        let Some(run_id) = state.run_id else {
            return Ok(());
        };
        let counters = serde_json::to_value(state.counters)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO pull_jobs (
                id, status, target, processed, inserted, duplicates, counters_json,
                range_start, range_end, last_attempted, error, last_batch_error,
                started_at, updated_at, finished_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE
               SET status = EXCLUDED.status,
                   target = EXCLUDED.target,
                   processed = EXCLUDED.processed,
                   inserted = EXCLUDED.inserted,
                   duplicates = EXCLUDED.duplicates,
                   counters_json = EXCLUDED.counters_json,
                   range_start = EXCLUDED.range_start,
                   range_end = EXCLUDED.range_end,
                   last_attempted = EXCLUDED.last_attempted,
                   error = EXCLUDED.error,
                   last_batch_error = EXCLUDED.last_batch_error,
                   updated_at = EXCLUDED.updated_at,
                   finished_at = EXCLUDED.finished_at
            "#,
        )
        .bind(run_id)
        .bind(state.status.as_str())
        .bind(state.target as i32)
        .bind(state.counters.processed as i64)
        .bind(state.counters.inserted as i64)
        .bind(state.counters.duplicates as i64)
        .bind(counters)
        .bind(state.range_start.map(|v| v as i64))
        .bind(state.range_end.map(|v| v as i64))
        .bind(state.last_attempted.map(|v| v as i64))
        .bind(&state.error)
        .bind(&state.last_batch_error)
        .bind(state.started_at)
        .bind(state.updated_at)
        .bind(state.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest(&self) -> Result<Option<RunState>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, status, target, counters_json, range_start, range_end, last_attempted,
                   error, last_batch_error, started_at, updated_at, finished_at
              FROM pull_jobs
             ORDER BY updated_at DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.try_get("status")?;
        let counters_json: serde_json::Value = row.try_get("counters_json")?;
        let target: i32 = row.try_get("target")?;
        let to_u64 = |v: Option<i64>| v.and_then(|v| u64::try_from(v).ok());
        Ok(Some(RunState {
            run_id: Some(row.try_get::<Uuid, _>("id")?),
            status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
            finished_at: row.try_get("finished_at")?,
            target: target.max(0) as u32,
            range_start: to_u64(row.try_get("range_start")?),
            range_end: to_u64(row.try_get("range_end")?),
            last_attempted: to_u64(row.try_get("last_attempted")?),
            counters: serde_json::from_value::<RunCounters>(counters_json).unwrap_or_default(),
            error: row.try_get("error")?,
            last_batch_error: row.try_get("last_batch_error")?,
        }))
    }
}

#[derive(Debug, Default)]
pub struct MemoryRunHistory {
    runs: Mutex<Vec<RunState>>,
}

impl MemoryRunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn runs(&self) -> Vec<RunState> {
        self.runs.lock().await.clone()
    }
}

#[async_trait]
impl RunHistory for MemoryRunHistory {
    async fn record(&self, state: &RunState) -> Result<(), StoreError> {
        if state.run_id.is_none() {
            return Ok(());
        }
        let mut runs = self.runs.lock().await;
        match runs.iter_mut().find(|r| r.run_id == state.run_id) {
            Some(existing) => *existing = state.clone(),
            None => runs.push(state.clone()),
        }
        Ok(())
    }

    async fn latest(&self) -> Result<Option<RunState>, StoreError> {
        let runs = self.runs.lock().await;
        Ok(runs.iter().max_by_key(|r| r.updated_at).cloned())
    }
}
