//! Memoised analysis results, persisted next to the application.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use chrono::{DateTime, Utc};
use cohort_core::AnalysisSnapshot;
use cohort_storage::{AnalysisSource, StoreError};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum CachedAnalysis {
    Absent,
    Stale(Arc<AnalysisSnapshot>),
    Valid(Arc<AnalysisSnapshot>),
}

impl CachedAnalysis {
    pub fn state(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Stale(_) => "stale",
            Self::Valid(_) => "valid",
        }
    }

    pub fn snapshot(&self) -> Option<&AnalysisSnapshot> {
        match self {
            Self::Absent => None,
            Self::Stale(s) | Self::Valid(s) => Some(s),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    snapshot: Option<Arc<AnalysisSnapshot>>,
    stale: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    updated_at: DateTime<Utc>,
    stale: bool,
    snapshot: AnalysisSnapshot,
}

pub struct AnalysisCache {
    slot: RwLock<Slot>,
    path: Option<PathBuf>,
    persist_lock: Mutex<()>,
}

impl AnalysisCache {
    pub fn in_memory() -> Self {
        Self {
            slot: RwLock::new(Slot::default()),
            path: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Open the cache file at `path`; a missing or unreadable file starts empty.
    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut slot = Slot::default();
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<CacheFile>(&raw) {
                Ok(file) => {
                    slot.snapshot = Some(Arc::new(file.snapshot));
                    slot.stale = file.stale;
                }
                Err(err) => warn!(path = %path.display(), error = %err, "ignoring corrupt analysis cache"),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        }
        Ok(Self {
            slot: RwLock::new(slot),
            path: Some(path),
            persist_lock: Mutex::new(()),
        })
    }

    pub fn get(&self) -> CachedAnalysis {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        match (&slot.snapshot, slot.stale) {
            (None, _) => CachedAnalysis::Absent,
            (Some(s), true) => CachedAnalysis::Stale(s.clone()),
            (Some(s), false) => CachedAnalysis::Valid(s.clone()),
        }
    }

    pub async fn put(&self, snapshot: AnalysisSnapshot) {
        {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            *slot = Slot {
                snapshot: Some(Arc::new(snapshot)),
                stale: false,
            };
        }
        self.persist().await;
    }

    /// Mark the current snapshot stale without recomputing it.
    pub async fn invalidate(&self) {
        {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            if slot.snapshot.is_none() || slot.stale {
                return;
            }
            slot.stale = true;
        }
        info!("analysis cache invalidated");
        self.persist().await;
    }

    async fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        let slot = self
            .slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(snapshot) = slot.snapshot else {
            return;
        };
        let file = CacheFile {
            updated_at: Utc::now(),
            stale: slot.stale,
            snapshot: (*snapshot).clone(),
        };
        if let Err(err) = write_atomically(path, &file).await {
            warn!(path = %path.display(), error = %err, "could not persist analysis cache");
        }
    }
}

async fn write_atomically(path: &Path, file: &CacheFile) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let body = serde_json::to_vec_pretty(file).context("serializing analysis cache")?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Recomputes aggregates on request and stores them in the cache.
#[derive(Clone)]
pub struct AnalysisService {
    source: Arc<dyn AnalysisSource>,
    cache: Arc<AnalysisCache>,
}

impl AnalysisService {
    pub fn new(source: Arc<dyn AnalysisSource>, cache: Arc<AnalysisCache>) -> Self {
        Self { source, cache }
    }

    pub fn cache(&self) -> &Arc<AnalysisCache> {
        &self.cache
    }

    pub fn current(&self) -> CachedAnalysis {
        self.cache.get()
    }

    pub async fn refresh(&self) -> Result<Arc<AnalysisSnapshot>, StoreError> {
        let results = self.source.compute().await?;
        let snapshot = AnalysisSnapshot {
            computed_at: Utc::now(),
            results,
        };
        self.cache.put(snapshot).await;
        match self.cache.get() {
            CachedAnalysis::Valid(s) | CachedAnalysis::Stale(s) => Ok(s),
            CachedAnalysis::Absent => Err(StoreError::Invalid("analysis cache rejected snapshot".into())),
        }
    }
}
