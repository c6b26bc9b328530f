//! Persistence handoff: a plain serializable bundle of cache entries,
//! configuration and metric counters. No I/O happens here.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_core::QueueConfig;
use tracing::info;

use super::QueueManager;
use crate::cache::CacheRecord;
use crate::error::QueueError;
use crate::metrics::MetricsSnapshot;

/// Format version written by [`QueueManager::export_data`].
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub config: QueueConfig,
    #[serde(default)]
    pub cache: Vec<CacheRecord>,
    #[serde(default)]
    pub metrics: MetricsSnapshot,
}

/// What [`QueueManager::import_data`] restored.
#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub cache_entries: usize,
    /// Records dropped because their TTL had run out.
    pub skipped: usize,
    /// The exported configuration. Informational; it is not applied.
    pub config: QueueConfig,
}

impl QueueManager {
    pub fn export_data(&self) -> QueueSnapshot {
        let state = self.inner.state();
        let now = Instant::now();
        let snapshot = QueueSnapshot {
            version: SNAPSHOT_VERSION,
            exported_at: Utc::now(),
            config: state.config.clone(),
            cache: state.cache.export_at(now),
            metrics: state.metrics.export(),
        };
        info!(cache_entries = snapshot.cache.len(), "queue data exported");
        snapshot
    }

    /// Restore live cache entries and metric counters from `snapshot`.
    pub fn import_data(&self, snapshot: QueueSnapshot) -> Result<ImportSummary, QueueError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(QueueError::Import(format!(
                "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
                snapshot.version
            )));
        }
        let total = snapshot.cache.len();
        let mut state = self.inner.state();
        let imported = state.cache.import_at(snapshot.cache, Instant::now());
        state.metrics.restore(snapshot.metrics);
        info!(imported, skipped = total - imported, "queue data imported");
        Ok(ImportSummary {
            cache_entries: imported,
            skipped: total - imported,
            config: snapshot.config,
        })
    }
}
