//! Durable applicant records keyed by source URL.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use cohort_core::{entry_id_from_url, CandidateRecord, DecisionStatus, EnrichedRecord, StoredRecord};
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store itself cannot be reached (pool, connection, I/O).
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("record store query failed: {0}")]
    Query(String),
    #[error("record rejected: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_outage(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Unavailable(err.to_string()),
            other => Self::Query(other.to_string()),
        }
    }
}

/// Outcome of persisting one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpsertReport {
    pub inserted: u64,
    pub duplicates: u64,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Highest numeric result ID among stored source URLs, if any.
    async fn max_entry_id(&self) -> Result<Option<u64>, StoreError>;

    async fn contains(&self, source_url: &str) -> Result<bool, StoreError>;

    /// Insert a batch atomically; rows whose identity key already exists are skipped.
    async fn insert_batch(&self, batch: &[EnrichedRecord]) -> Result<UpsertReport, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

fn validate_batch(batch: &[EnrichedRecord]) -> Result<(), StoreError> {
    match batch.iter().find(|r| r.identity_key().trim().is_empty()) {
        Some(_) => Err(StoreError::Invalid("empty source_url".to_string())),
        None => Ok(()),
    }
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_one(
        tx: &mut Transaction<'_, Postgres>,
        record: &EnrichedRecord,
    ) -> Result<bool, sqlx::Error> {
        let c = &record.candidate;
        let row = sqlx::query(
            r#"
            INSERT INTO applicants (
                source_url, program, university, comments, date_added, decision_date,
                status, term, us_or_international, gre, gre_v, gre_aw, gpa, degree,
                llm_generated_program, llm_generated_university
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (source_url) DO NOTHING
            RETURNING p_id
            "#,
        )
        .bind(&c.source_url)
        .bind(&c.program)
        .bind(&c.university)
        .bind(&c.comments)
        .bind(c.date_added)
        .bind(c.decision_date)
        .bind(c.status.as_str())
        .bind(&c.term)
        .bind(&c.citizenship)
        .bind(c.gre_total)
        .bind(c.gre_verbal)
        .bind(c.gre_aw)
        .bind(c.gpa)
        .bind(&c.degree)
        .bind(&record.canonical_program)
        .bind(&record.canonical_university)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.is_some())
    }

    /// Most recently stored rows, newest first.
    pub async fn latest(&self, limit: i64) -> Result<Vec<StoredRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT p_id, created_at, source_url, program, university, comments, date_added,
                   decision_date, status, term, us_or_international, gre, gre_v, gre_aw, gpa,
                   degree, llm_generated_program, llm_generated_university
              FROM applicants
             ORDER BY p_id DESC
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let candidate = CandidateRecord {
                source_url: row.try_get("source_url")?,
                program: row.try_get("program")?,
                university: row.try_get("university")?,
                comments: row.try_get("comments")?,
                date_added: row.try_get("date_added")?,
                decision_date: row.try_get("decision_date")?,
                status: DecisionStatus::parse(&status),
                term: row.try_get("term")?,
                citizenship: row.try_get("us_or_international")?,
                gre_total: row.try_get("gre")?,
                gre_verbal: row.try_get("gre_v")?,
                gre_aw: row.try_get("gre_aw")?,
                gpa: row.try_get("gpa")?,
                degree: row.try_get("degree")?,
            };
            let program: Option<String> = row.try_get("llm_generated_program")?;
            let university: Option<String> = row.try_get("llm_generated_university")?;
            out.push(StoredRecord {
                id: row.try_get("p_id")?,
                created_at: row.try_get("created_at")?,
                record: EnrichedRecord::new(
                    candidate,
                    program.unwrap_or_else(|| cohort_core::UNKNOWN_CANONICAL.to_string()),
                    university.unwrap_or_else(|| cohort_core::UNKNOWN_CANONICAL.to_string()),
                ),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn max_entry_id(&self) -> Result<Option<u64>, StoreError> {
        let value: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(SUBSTRING(source_url FROM '/(\d+)/?$')::bigint)
              FROM applicants
             WHERE source_url ~ '/\d+/?$'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(value.and_then(|v| u64::try_from(v).ok()))
    }

    async fn contains(&self, source_url: &str) -> Result<bool, StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM applicants WHERE source_url = $1)")
                .bind(source_url)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn insert_batch(&self, batch: &[EnrichedRecord]) -> Result<UpsertReport, StoreError> {
        validate_batch(batch)?;
        let mut tx = self.pool.begin().await?;
        let mut report = UpsertReport::default();
        for record in batch {
            if Self::insert_one(&mut tx, record).await? {
                report.inserted += 1;
            } else {
                report.duplicates += 1;
            }
        }
        tx.commit().await?;
        debug!(
            inserted = report.inserted,
            duplicates = report.duplicates,
            "committed applicant batch"
        );
        Ok(report)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM applicants")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }
}

/// In-process store with the same uniqueness and batch semantics as the Postgres one.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    inner: Mutex<MemoryRecords>,
}

#[derive(Debug, Default)]
struct MemoryRecords {
    rows: Vec<StoredRecord>,
    keys: HashSet<String>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<StoredRecord> {
        self.inner.lock().await.rows.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn max_entry_id(&self) -> Result<Option<u64>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows
            .iter()
            .filter_map(|r| entry_id_from_url(r.record.identity_key()))
            .max())
    }

    async fn contains(&self, source_url: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.keys.contains(source_url))
    }

    async fn insert_batch(&self, batch: &[EnrichedRecord]) -> Result<UpsertReport, StoreError> {
        validate_batch(batch)?;
        let mut inner = self.inner.lock().await;
        let mut report = UpsertReport::default();
        for record in batch {
            if !inner.keys.insert(record.identity_key().to_string()) {
                report.duplicates += 1;
                continue;
            }
            let id = inner.rows.len() as i64 + 1;
            inner.rows.push(StoredRecord {
                id,
                created_at: Utc::now(),
                record: record.clone(),
            });
            report.inserted += 1;
        }
        Ok(report)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.inner.lock().await.rows.len() as u64)
    }
}
