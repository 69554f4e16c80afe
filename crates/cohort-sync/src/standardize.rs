//! Batch enrichment through the external standardization service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cohort_core::{CandidateRecord, EnrichedRecord};
use cohort_storage::{classify_reqwest_error, classify_status, RetryDisposition, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::fixups::CanonicalFixups;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentRow {
    pub program: String,
    pub university: String,
}

impl From<&CandidateRecord> for EnrichmentRow {
    fn from(record: &CandidateRecord) -> Self {
        Self {
            program: record.program.clone().unwrap_or_default(),
            university: record.university.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    #[serde(default)]
    pub llm_generated_program: Option<String>,
    #[serde(default)]
    pub llm_generated_university: Option<String>,
}

#[derive(Debug, Serialize)]
struct EnrichmentRequest<'a> {
    rows: &'a [EnrichmentRow],
}

#[derive(Debug, Deserialize)]
struct EnrichmentResponse {
    #[serde(default)]
    rows: Vec<EnrichmentResult>,
}

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("enrichment request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("enrichment service returned http {0}")]
    Status(u16),
    #[error("enrichment returned {got} rows for {expected} inputs")]
    Misaligned { expected: usize, got: usize },
    #[error("enrichment timed out after {0:?}")]
    TimedOut(Duration),
}

impl EnrichmentError {
    fn is_retryable(&self) -> bool {
        let disposition = match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::Status(status) => reqwest::StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Misaligned { .. } | Self::TimedOut(_) => RetryDisposition::NonRetryable,
        };
        disposition == RetryDisposition::Retryable
    }
}

/// Black-box batch standardization. Results align positionally with `rows`.
#[async_trait]
pub trait EnrichmentClient: Send + Sync {
    async fn standardize(&self, rows: &[EnrichmentRow]) -> Result<Vec<EnrichmentResult>, EnrichmentError>;
}

pub struct HttpEnrichmentClient {
    client: reqwest::Client,
    url: String,
    retry: RetryPolicy,
}

impl HttpEnrichmentClient {
    pub fn new(url: impl Into<String>, retry: RetryPolicy) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("building enrichment client")?;
        Ok(Self {
            client,
            url: url.into(),
            retry,
        })
    }

    async fn post_once(&self, rows: &[EnrichmentRow]) -> Result<Vec<EnrichmentResult>, EnrichmentError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&EnrichmentRequest { rows })
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(EnrichmentError::Status(status.as_u16()));
        }
        let body: EnrichmentResponse = resp.json().await?;
        if body.rows.len() != rows.len() {
            return Err(EnrichmentError::Misaligned {
                expected: rows.len(),
                got: body.rows.len(),
            });
        }
        Ok(body.rows)
    }
}

#[async_trait]
impl EnrichmentClient for HttpEnrichmentClient {
    async fn standardize(&self, rows: &[EnrichmentRow]) -> Result<Vec<EnrichmentResult>, EnrichmentError> {
        self.retry
            .run(|_attempt| self.post_once(rows), EnrichmentError::is_retryable)
            .await
    }
}

/// Splits candidates into batches and enriches each one, degrading to
/// `"Unknown"` canonical names when a batch cannot be enriched.
pub struct Standardizer {
    client: Arc<dyn EnrichmentClient>,
    batch_size: usize,
    timeout: Duration,
    fixups: CanonicalFixups,
}

impl Standardizer {
    pub fn new(client: Arc<dyn EnrichmentClient>, batch_size: usize, timeout: Duration) -> Self {
        Self {
            client,
            batch_size: batch_size.max(1),
            timeout,
            fixups: CanonicalFixups::default(),
        }
    }

    pub fn with_fixups(mut self, fixups: CanonicalFixups) -> Self {
        self.fixups = fixups;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Output order matches input order; the output is never shorter than the input.
    pub async fn standardize(&self, records: Vec<CandidateRecord>) -> Vec<EnrichedRecord> {
        let mut out = Vec::with_capacity(records.len());
        for chunk in records.chunks(self.batch_size) {
            out.extend(self.enrich_batch(chunk).await);
        }
        out
    }

    async fn call(&self, rows: &[EnrichmentRow]) -> Result<Vec<EnrichmentResult>, EnrichmentError> {
        let results = tokio::time::timeout(self.timeout, self.client.standardize(rows))
            .await
            .map_err(|_| EnrichmentError::TimedOut(self.timeout))??;
        if results.len() != rows.len() {
            return Err(EnrichmentError::Misaligned {
                expected: rows.len(),
                got: results.len(),
            });
        }
        Ok(results)
    }

    async fn enrich_batch(&self, batch: &[CandidateRecord]) -> Vec<EnrichedRecord> {
        let rows = batch.iter().map(EnrichmentRow::from).collect::<Vec<_>>();
        match self.call(&rows).await {
            Ok(results) => {
                debug!(rows = batch.len(), "enriched batch");
                batch
                    .iter()
                    .zip(results)
                    .map(|(record, result)| {
                        let program = self
                            .fixups
                            .program(result.llm_generated_program.as_deref().unwrap_or_default());
                        let university = self
                            .fixups
                            .university(result.llm_generated_university.as_deref().unwrap_or_default());
                        EnrichedRecord::new(record.clone(), program, university)
                    })
                    .collect()
            }
            Err(err) => {
                warn!(rows = batch.len(), error = %err, "enrichment degraded; using Unknown");
                batch.iter().cloned().map(EnrichedRecord::unresolved).collect()
            }
        }
    }
}
