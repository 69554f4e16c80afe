//! Aggregate queries behind the analysis dashboard.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use cohort_core::{round2, AnalysisResults, DecisionStatus, NamedCount, UNKNOWN_CANONICAL};
use sqlx::{PgPool, Row};

use crate::{MemoryRecordStore, StoreError};

pub const TOP_UNIVERSITIES: usize = 10;

#[async_trait]
pub trait AnalysisSource: Send + Sync {
    async fn compute(&self) -> Result<AnalysisResults, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgAnalysisSource {
    pool: PgPool,
}

impl PgAnalysisSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AnalysisSource for PgAnalysisSource {
    async fn compute(&self) -> Result<AnalysisResults, StoreError> {
        let totals = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (
                       WHERE us_or_international IS NOT NULL
                         AND us_or_international NOT IN ('American', 'Other')
                   ) AS international,
                   AVG(gpa) AS avg_gpa,
                   AVG(gre)::float8 AS avg_gre,
                   AVG(gre_v)::float8 AS avg_gre_v,
                   AVG(gre_aw) AS avg_gre_aw
              FROM applicants
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let status_rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM applicants GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut status_breakdown = BTreeMap::new();
        for row in status_rows {
            status_breakdown.insert(row.try_get::<String, _>("status")?, row.try_get::<i64, _>("n")?);
        }

        let top_rows = sqlx::query(
            r#"
            SELECT llm_generated_university AS name, COUNT(*) AS n
              FROM applicants
             WHERE llm_generated_university IS NOT NULL
               AND llm_generated_university <> $1
             GROUP BY llm_generated_university
             ORDER BY n DESC, name ASC
             LIMIT $2
            "#,
        )
        .bind(UNKNOWN_CANONICAL)
        .bind(TOP_UNIVERSITIES as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut top_universities = Vec::with_capacity(top_rows.len());
        for row in top_rows {
            top_universities.push(NamedCount {
                name: row.try_get("name")?,
                count: row.try_get("n")?,
            });
        }

        let total: i64 = totals.try_get("total")?;
        let international: i64 = totals.try_get("international")?;
        Ok(AnalysisResults {
            total_records: total,
            percent_international: percent(international, total),
            avg_gpa: totals.try_get::<Option<f64>, _>("avg_gpa")?.map(round2),
            avg_gre: totals.try_get::<Option<f64>, _>("avg_gre")?.map(round2),
            avg_gre_verbal: totals.try_get::<Option<f64>, _>("avg_gre_v")?.map(round2),
            avg_gre_aw: totals.try_get::<Option<f64>, _>("avg_gre_aw")?.map(round2),
            acceptance_rate: acceptance_rate(&status_breakdown),
            status_breakdown,
            top_universities,
        })
    }
}

fn percent(part: i64, whole: i64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        round2(part as f64 / whole as f64 * 100.0)
    }
}

fn acceptance_rate(breakdown: &BTreeMap<String, i64>) -> f64 {
    let decided: i64 = breakdown
        .iter()
        .filter(|(status, _)| status.as_str() != DecisionStatus::Unknown.as_str())
        .map(|(_, n)| *n)
        .sum();
    let accepted = breakdown
        .get(DecisionStatus::Accepted.as_str())
        .copied()
        .unwrap_or(0);
    percent(accepted, decided)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| round2(sum / n as f64))
}

#[async_trait]
impl AnalysisSource for MemoryRecordStore {
    async fn compute(&self) -> Result<AnalysisResults, StoreError> {
        let rows = self.records().await;
        let candidates = rows.iter().map(|r| &r.record.candidate).collect::<Vec<_>>();
        let total = candidates.len() as i64;
        let international = candidates
            .iter()
            .filter(|c| {
                c.citizenship
                    .as_deref()
                    .is_some_and(|v| v != "American" && v != "Other")
            })
            .count() as i64;

        let mut status_breakdown = BTreeMap::new();
        for c in &candidates {
            *status_breakdown.entry(c.status.as_str().to_string()).or_insert(0) += 1;
        }

        let mut by_university: HashMap<&str, i64> = HashMap::new();
        for row in &rows {
            let name = row.record.canonical_university.as_str();
            if name != UNKNOWN_CANONICAL {
                *by_university.entry(name).or_insert(0) += 1;
            }
        }
        let mut top_universities = by_university
            .into_iter()
            .map(|(name, count)| NamedCount {
                name: name.to_string(),
                count,
            })
            .collect::<Vec<_>>();
        top_universities.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        top_universities.truncate(TOP_UNIVERSITIES);

        Ok(AnalysisResults {
            total_records: total,
            percent_international: percent(international, total),
            avg_gpa: mean(candidates.iter().filter_map(|c| c.gpa)),
            avg_gre: mean(candidates.iter().filter_map(|c| c.gre_total.map(f64::from))),
            avg_gre_verbal: mean(candidates.iter().filter_map(|c| c.gre_verbal.map(f64::from))),
            avg_gre_aw: mean(candidates.iter().filter_map(|c| c.gre_aw)),
            acceptance_rate: acceptance_rate(&status_breakdown),
            status_breakdown,
            top_universities,
        })
    }
}
