//! Core domain model for the cohort ingest pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cohort-core";

/// Canonical value used when enrichment cannot resolve a name.
pub const UNKNOWN_CANONICAL: &str = "Unknown";

/// Decision reported on a result page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Accepted,
    Rejected,
    Waitlisted,
    #[default]
    Unknown,
}

impl DecisionStatus {
    /// Map free-form decision text ("Accepted on 17 Jan", "Wait listed") to a status.
    pub fn from_decision_text(text: &str) -> Self {
        let lower = text.to_ascii_lowercase();
        if lower.contains("accept") {
            Self::Accepted
        } else if lower.contains("reject") {
            Self::Rejected
        } else if lower.contains("wait") {
            Self::Waitlisted
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Waitlisted => "waitlisted",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "accepted" => Self::Accepted,
            "rejected" => Self::Rejected,
            "waitlisted" => Self::Waitlisted,
            _ => Self::Unknown,
        }
    }
}

/// Structured record extracted from one result page, before enrichment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Identity key: the result page URL.
    pub source_url: String,
    pub program: Option<String>,
    pub university: Option<String>,
    pub comments: Option<String>,
    pub date_added: Option<NaiveDate>,
    pub decision_date: Option<NaiveDate>,
    pub status: DecisionStatus,
    pub term: Option<String>,
    pub citizenship: Option<String>,
    pub gre_total: Option<i32>,
    pub gre_verbal: Option<i32>,
    pub gre_aw: Option<f64>,
    pub gpa: Option<f64>,
    pub degree: Option<String>,
}

impl CandidateRecord {
    pub fn entry_id(&self) -> Option<u64> {
        entry_id_from_url(&self.source_url)
    }
}

/// Candidate plus the canonical names produced by the standardization service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub candidate: CandidateRecord,
    pub canonical_program: String,
    pub canonical_university: String,
}

impl EnrichedRecord {
    pub fn new(
        candidate: CandidateRecord,
        canonical_program: impl Into<String>,
        canonical_university: impl Into<String>,
    ) -> Self {
        Self {
            candidate,
            canonical_program: canonical_program.into(),
            canonical_university: canonical_university.into(),
        }
    }

    /// Both canonical names fall back to [`UNKNOWN_CANONICAL`].
    pub fn unresolved(candidate: CandidateRecord) -> Self {
        Self::new(candidate, UNKNOWN_CANONICAL, UNKNOWN_CANONICAL)
    }

    pub fn identity_key(&self) -> &str {
        &self.candidate.source_url
    }
}

/// Durable row as kept by a record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub record: EnrichedRecord,
}

/// Parse the trailing numeric result ID from a result URL.
pub fn entry_id_from_url(url: &str) -> Option<u64> {
    url.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Failed | Self::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "idle" => Self::Idle,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            "failed" => Self::Failed,
            "timed_out" => Self::TimedOut,
            _ => return None,
        })
    }
}

/// Per-run counters. Every field only ever grows during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub processed: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub placeholders: u64,
    pub not_found: u64,
    pub fetch_failures: u64,
    pub dropped: u64,
    pub failed_batches: u64,
}

impl RunCounters {
    /// True when no counter of `self` is below the matching counter of `earlier`.
    pub fn dominates(&self, earlier: &RunCounters) -> bool {
        self.processed >= earlier.processed
            && self.inserted >= earlier.inserted
            && self.duplicates >= earlier.duplicates
            && self.placeholders >= earlier.placeholders
            && self.not_found >= earlier.not_found
            && self.fetch_failures >= earlier.fetch_failures
            && self.dropped >= earlier.dropped
            && self.failed_batches >= earlier.failed_batches
    }
}

/// Snapshot of the single pull run a process may own at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Option<Uuid>,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub target: u32,
    pub range_start: Option<u64>,
    pub range_end: Option<u64>,
    pub last_attempted: Option<u64>,
    #[serde(flatten)]
    pub counters: RunCounters,
    pub error: Option<String>,
    pub last_batch_error: Option<String>,
}

impl RunState {
    pub fn idle() -> Self {
        Self {
            run_id: None,
            status: RunStatus::Idle,
            started_at: None,
            updated_at: Utc::now(),
            finished_at: None,
            target: 0,
            range_start: None,
            range_end: None,
            last_attempted: None,
            counters: RunCounters::default(),
            error: None,
            last_batch_error: None,
        }
    }

    pub fn started(run_id: Uuid, target: u32, now: DateTime<Utc>) -> Self {
        Self {
            run_id: Some(run_id),
            status: RunStatus::Running,
            started_at: Some(now),
            updated_at: now,
            target,
            ..Self::idle()
        }
    }

    pub fn elapsed_seconds(&self) -> i64 {
        let end = self.finished_at.unwrap_or(self.updated_at);
        self.started_at
            .map(|start| (end - start).num_seconds().max(0))
            .unwrap_or(0)
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::idle()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCount {
    pub name: String,
    pub count: i64,
}

/// Aggregates computed over every stored record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnalysisResults {
    pub total_records: i64,
    pub percent_international: f64,
    pub avg_gpa: Option<f64>,
    pub avg_gre: Option<f64>,
    pub avg_gre_verbal: Option<f64>,
    pub avg_gre_aw: Option<f64>,
    /// Accepted share of records with a known decision, in percent.
    pub acceptance_rate: f64,
    pub status_breakdown: BTreeMap<String, i64>,
    pub top_universities: Vec<NamedCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSnapshot {
    pub computed_at: DateTime<Utc>,
    pub results: AnalysisResults,
}

/// Round to two decimals, as reported on the dashboard.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
