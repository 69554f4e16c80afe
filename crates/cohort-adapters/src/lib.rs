//! Listing-service adapters: result page fetching, survey listing parsing and
//! field extraction.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use cohort_storage::HttpFetcher;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub mod extract;

pub use extract::{extract_candidate, is_placeholder_text, page_lines, parse_date, PLACEHOLDER_DATE};

pub const CRATE_NAME: &str = "cohort-adapters";

pub const DEFAULT_BASE_URL: &str = "https://www.thegradcafe.com";

static RESULT_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/result/(\d+)").expect("result link regex"));

#[derive(Debug, Error)]
pub enum AdapterError {
    /// The listing could not be read or carried no result links.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("{0}")]
    Message(String),
}

/// Raw result page for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePage {
    pub entry_id: u64,
    pub url: String,
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Valid(SourcePage),
    /// Page exists but still carries the unfilled sentinel date.
    Placeholder,
    NotFound,
    /// Retries were exhausted.
    TransientError(String),
}

/// What the survey listing tells us about the newest entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub latest_id: u64,
    /// Entry ID to the listing's "Added On" text.
    pub added_on: HashMap<u64, String>,
}

#[async_trait]
pub trait ResultSource: Send + Sync {
    async fn listing(&self) -> Result<Listing, AdapterError>;

    async fn fetch(&self, entry_id: u64) -> FetchOutcome;

    fn result_url(&self, entry_id: u64) -> String;
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn cell_text(cell: scraper::ElementRef<'_>) -> String {
    cell.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse the survey listing: the newest result ID and the "Added On" column.
pub fn parse_listing(html: &str) -> Result<Listing, AdapterError> {
    let latest_id = RESULT_LINK_RE
        .captures_iter(html)
        .filter_map(|c| c[1].parse::<u64>().ok())
        .max()
        .ok_or_else(|| AdapterError::UpstreamUnavailable("listing has no result links".into()))?;

    let document = Html::parse_document(html);
    let table_sel = selector("table")?;
    let th_sel = selector("th")?;
    let tr_sel = selector("tr")?;
    let cell_sel = selector("td, th")?;
    let link_sel = selector("a[href]")?;

    let mut added_on = HashMap::new();
    for table in document.select(&table_sel) {
        let Some(column) = table
            .select(&th_sel)
            .position(|th| cell_text(th).eq_ignore_ascii_case("added on"))
        else {
            continue;
        };
        for row in table.select(&tr_sel) {
            let Some(entry_id) = row
                .select(&link_sel)
                .filter_map(|a| a.value().attr("href"))
                .find_map(|href| RESULT_LINK_RE.captures(href)?[1].parse::<u64>().ok())
            else {
                continue;
            };
            let Some(cell) = row.select(&cell_sel).nth(column) else {
                continue;
            };
            let text = cell_text(cell);
            if !text.is_empty() {
                added_on.insert(entry_id, text);
            }
        }
        break;
    }

    Ok(Listing { latest_id, added_on })
}

/// Live adapter for the public admissions survey site.
#[derive(Debug)]
pub struct SurveySiteSource {
    http: HttpFetcher,
    base_url: String,
}

impl SurveySiteSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn listing_url(&self) -> String {
        format!("{}/survey/", self.base_url)
    }
}

#[async_trait]
impl ResultSource for SurveySiteSource {
    async fn listing(&self) -> Result<Listing, AdapterError> {
        let url = self.listing_url();
        let page = self
            .http
            .fetch_page(&url)
            .await
            .map_err(|e| AdapterError::UpstreamUnavailable(format!("{url}: {e}")))?;
        let listing = parse_listing(&page.body)?;
        debug!(
            latest_id = listing.latest_id,
            added_on = listing.added_on.len(),
            "parsed survey listing"
        );
        Ok(listing)
    }

    async fn fetch(&self, entry_id: u64) -> FetchOutcome {
        let url = self.result_url(entry_id);
        match self.http.fetch_page(&url).await {
            Ok(page) if is_placeholder_text(&page.body) => FetchOutcome::Placeholder,
            Ok(page) => FetchOutcome::Valid(SourcePage {
                entry_id,
                url,
                html: page.body,
            }),
            Err(err) if err.is_not_found() => FetchOutcome::NotFound,
            Err(err) => {
                warn!(entry_id, error = %err, "result fetch failed after retries");
                FetchOutcome::TransientError(err.to_string())
            }
        }
    }

    fn result_url(&self, entry_id: u64) -> String {
        format!("{}/result/{entry_id}", self.base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use cohort_core::DecisionStatus;

    const RESULT_PAGE: &str = include_str!("../../../fixtures/survey/result_page.html");
    const PLACEHOLDER_PAGE: &str = include_str!("../../../fixtures/survey/placeholder_page.html");
    const LISTING_PAGE: &str = include_str!("../../../fixtures/survey/survey_listing.html");

    #[test]
    fn listing_yields_latest_id_and_added_on_column() {
        let listing = parse_listing(LISTING_PAGE).unwrap();
        assert_eq!(listing.latest_id, 986530);
        assert_eq!(
            listing.added_on.get(&986512).map(String::as_str),
            Some("January 17, 2025")
        );
        assert_eq!(
            listing.added_on.get(&986529).map(String::as_str),
            Some("January 18, 2025")
        );
        assert!(!listing.added_on.contains_key(&986530));
    }

    #[test]
    fn listing_without_links_is_upstream_unavailable() {
        let err = parse_listing("<html><body><p>maintenance</p></body></html>").unwrap_err();
        assert!(matches!(err, AdapterError::UpstreamUnavailable(_)));
    }

    #[test]
    fn result_page_extracts_every_field_as_plain_text() {
        let url = "https://www.thegradcafe.com/result/986512";
        let record = extract_candidate(RESULT_PAGE, url, Some("January 17, 2025")).unwrap();

        assert_eq!(record.source_url, url);
        assert_eq!(record.entry_id(), Some(986512));
        assert_eq!(record.university.as_deref(), Some("Johns Hopkins University"));
        assert_eq!(record.program.as_deref(), Some("Computer Science"));
        assert_eq!(record.degree.as_deref(), Some("Masters"));
        assert_eq!(record.citizenship.as_deref(), Some("International"));
        assert_eq!(record.status, DecisionStatus::Accepted);
        assert_eq!(record.date_added, NaiveDate::from_ymd_opt(2025, 1, 17));
        assert_eq!(record.decision_date, NaiveDate::from_ymd_opt(2025, 1, 17));
        assert_eq!(record.term.as_deref(), Some("Fall 2025"));
        assert_eq!(record.gpa, Some(3.85));
        assert_eq!(record.gre_total, Some(325));
        assert_eq!(record.gre_verbal, Some(160));
        assert_eq!(record.gre_aw, Some(4.5));
        assert_eq!(
            record.comments.as_deref(),
            Some("Funded offer with a research assistantship Reached out to the PI in November.")
        );
        for text in [&record.comments, &record.program, &record.university]
            .into_iter()
            .flatten()
        {
            assert!(!text.contains('<') && !text.contains('>'));
        }
    }

    #[test]
    fn placeholder_pages_are_detected_before_extraction() {
        assert!(is_placeholder_text(PLACEHOLDER_PAGE));
        assert!(!is_placeholder_text(RESULT_PAGE));
    }
}
