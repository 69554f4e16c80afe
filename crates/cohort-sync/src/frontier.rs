//! Scan range planning between the stored frontier and the upstream listing.

use std::collections::HashMap;
use std::sync::Arc;

use cohort_adapters::{Listing, ResultSource};
use cohort_storage::RecordStore;
use tracing::info;

use crate::PullError;

/// Inclusive ID range scanned by one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRange {
    pub start: u64,
    pub end: u64,
}

impl ScanRange {
    /// `[current + 1, min(current + target, upstream)]`, or `None` when nothing is new.
    pub fn plan(current: u64, upstream: u64, target: u32) -> Option<Self> {
        if target == 0 || current >= upstream {
            return None;
        }
        let end = current.saturating_add(u64::from(target)).min(upstream);
        Some(Self {
            start: current + 1,
            end,
        })
    }

    pub fn len(&self) -> u64 {
        (self.end + 1).saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> {
        self.start..=self.end
    }
}

/// Range plus what the listing said about the entries in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontierPlan {
    pub current_max: u64,
    pub upstream_max: u64,
    pub range: Option<ScanRange>,
    pub added_on: HashMap<u64, String>,
}

pub struct FrontierTracker {
    store: Arc<dyn RecordStore>,
    source: Arc<dyn ResultSource>,
    floor: u64,
}

impl FrontierTracker {
    pub fn new(store: Arc<dyn RecordStore>, source: Arc<dyn ResultSource>, floor: u64) -> Self {
        Self {
            store,
            source,
            floor,
        }
    }

    /// Highest stored entry ID, never below the configured floor; 0 when empty.
    pub async fn current_max(&self) -> Result<u64, PullError> {
        let stored = self.store.max_entry_id().await?.unwrap_or(0);
        Ok(stored.max(self.floor))
    }

    pub async fn upstream_listing(&self) -> Result<Listing, PullError> {
        self.source
            .listing()
            .await
            .map_err(|e| PullError::UpstreamUnavailable(e.to_string()))
    }

    pub async fn upstream_max(&self) -> Result<u64, PullError> {
        Ok(self.upstream_listing().await?.latest_id)
    }

    pub async fn plan(&self, target: u32) -> Result<FrontierPlan, PullError> {
        let current_max = self.current_max().await?;
        let listing = self.upstream_listing().await?;
        let range = ScanRange::plan(current_max, listing.latest_id, target);
        info!(
            current_max,
            upstream_max = listing.latest_id,
            range_start = range.map(|r| r.start),
            range_end = range.map(|r| r.end),
            "planned scan range"
        );
        Ok(FrontierPlan {
            current_max,
            upstream_max: listing.latest_id,
            range,
            added_on: listing.added_on,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_caps_at_target_and_upstream() {
        assert_eq!(
            ScanRange::plan(10, 15, 3),
            Some(ScanRange { start: 11, end: 13 })
        );
        assert_eq!(
            ScanRange::plan(10, 12, 100),
            Some(ScanRange { start: 11, end: 12 })
        );
        assert_eq!(ScanRange::plan(0, 5, 2).map(|r| r.len()), Some(2));
    }

    #[test]
    fn plan_is_empty_when_caught_up() {
        assert_eq!(ScanRange::plan(15, 15, 3), None);
        assert_eq!(ScanRange::plan(20, 15, 3), None);
        assert_eq!(ScanRange::plan(10, 15, 0), None);
    }

    #[test]
    fn ids_cover_the_range_in_order() {
        let range = ScanRange { start: 11, end: 13 };
        assert_eq!(range.ids().collect::<Vec<_>>(), vec![11, 12, 13]);
    }
}
