use std::sync::Arc;
use std::time::Duration;

use cohort_core::EnrichedRecord;
use cohort_storage::{RecordStore, RetryPolicy, StoreError, UpsertReport};
use tracing::warn;

use crate::PullError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Committed(UpsertReport),
    /// The batch failed twice and was left out; the run continues.
    Skipped { error: String },
}

/// Idempotent batch persistence on top of a [`RecordStore`].
pub struct UpsertEngine {
    store: Arc<dyn RecordStore>,
    retry: RetryPolicy,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(100),
            },
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Persist one batch. Only a store outage is returned as an error.
    pub async fn upsert(&self, batch: &[EnrichedRecord]) -> Result<UpsertOutcome, PullError> {
        if batch.is_empty() {
            return Ok(UpsertOutcome::Committed(UpsertReport::default()));
        }
        let result = self
            .retry
            .run(
                |_attempt| self.store.insert_batch(batch),
                |err: &StoreError| !err.is_outage(),
            )
            .await;
        match result {
            Ok(report) => Ok(UpsertOutcome::Committed(report)),
            Err(err) if err.is_outage() => Err(PullError::PersistenceOutage(err.to_string())),
            Err(err) => {
                warn!(rows = batch.len(), error = %err, "batch persistence skipped");
                Ok(UpsertOutcome::Skipped {
                    error: err.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use cohort_core::CandidateRecord;
    use cohort_storage::MemoryRecordStore;

    /// Fails the first `failures` inserts with the given error.
    struct FailingStore {
        inner: MemoryRecordStore,
        failures: usize,
        outage: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for FailingStore {
        async fn max_entry_id(&self) -> Result<Option<u64>, StoreError> {
            self.inner.max_entry_id().await
        }

        async fn contains(&self, source_url: &str) -> Result<bool, StoreError> {
            self.inner.contains(source_url).await
        }

        async fn insert_batch(&self, batch: &[EnrichedRecord]) -> Result<UpsertReport, StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(if self.outage {
                    StoreError::Unavailable("connection refused".into())
                } else {
                    StoreError::Query("deadlock detected".into())
                });
            }
            self.inner.insert_batch(batch).await
        }

        async fn count(&self) -> Result<u64, StoreError> {
            self.inner.count().await
        }
    }

    fn store(failures: usize, outage: bool) -> Arc<FailingStore> {
        Arc::new(FailingStore {
            inner: MemoryRecordStore::new(),
            failures,
            outage,
            calls: AtomicUsize::new(0),
        })
    }

    fn batch() -> Vec<EnrichedRecord> {
        vec![EnrichedRecord::unresolved(CandidateRecord {
            source_url: "https://example.test/result/3".into(),
            ..Default::default()
        })]
    }

    fn engine(store: Arc<FailingStore>) -> UpsertEngine {
        UpsertEngine::new(store).with_retry(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        })
    }

    #[tokio::test]
    async fn one_failure_is_retried() {
        let store = store(1, false);
        let outcome = engine(store.clone()).upsert(&batch()).await.unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome::Committed(UpsertReport {
                inserted: 1,
                duplicates: 0
            })
        );
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_failure_skips_the_batch() {
        let store = store(2, false);
        let outcome = engine(store.clone()).upsert(&batch()).await.unwrap();
        assert!(matches!(outcome, UpsertOutcome::Skipped { .. }));
        assert_eq!(store.inner.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn outage_is_fatal_and_not_retried() {
        let store = store(1, true);
        let err = engine(store.clone()).upsert(&batch()).await.unwrap_err();
        assert!(matches!(err, PullError::PersistenceOutage(_)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }
}
