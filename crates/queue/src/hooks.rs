//! Push-style observer callbacks for progress, errors and metrics.
//!
//! Callbacks are invoked from the coordinator task after its state lock is
//! released. A panicking callback is logged and does not affect the others.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use sluice_core::RequestId;
use tracing::warn;

use crate::error::QueueError;
use crate::metrics::QueueMetrics;
use crate::scheduler::RequestInfo;

pub type ProgressCallback = Arc<dyn Fn(RequestId, f64) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&QueueError, Option<&RequestInfo>) + Send + Sync>;
pub type MetricsCallback = Arc<dyn Fn(&QueueMetrics) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

#[derive(Default)]
struct Registry {
    progress: BTreeMap<SubscriptionId, ProgressCallback>,
    error: BTreeMap<SubscriptionId, ErrorCallback>,
    metrics: BTreeMap<SubscriptionId, MetricsCallback>,
}

#[derive(Default)]
pub struct Hooks {
    next_id: AtomicU64,
    registry: RwLock<Registry>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn on_progress<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(RequestId, f64) + Send + Sync + 'static,
    {
        let id = self.next();
        self.write().progress.insert(id, Arc::new(f));
        id
    }

    pub fn on_error<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&QueueError, Option<&RequestInfo>) + Send + Sync + 'static,
    {
        let id = self.next();
        self.write().error.insert(id, Arc::new(f));
        id
    }

    pub fn on_metrics<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&QueueMetrics) + Send + Sync + 'static,
    {
        let id = self.next();
        self.write().metrics.insert(id, Arc::new(f));
        id
    }

    /// Remove a subscription of any kind. Returns false if unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut reg = self.write();
        reg.progress.remove(&id).is_some() || reg.error.remove(&id).is_some() || reg.metrics.remove(&id).is_some()
    }

    pub fn emit_progress(&self, request_id: RequestId, percent: f64) {
        let callbacks: Vec<ProgressCallback> = self.read().progress.values().cloned().collect();
        for cb in callbacks {
            isolate("progress", || cb(request_id, percent));
        }
    }

    pub fn emit_error(&self, error: &QueueError, request: Option<&RequestInfo>) {
        let callbacks: Vec<ErrorCallback> = self.read().error.values().cloned().collect();
        for cb in callbacks {
            isolate("error", || cb(error, request));
        }
    }

    pub fn emit_metrics(&self, metrics: &QueueMetrics) {
        let callbacks: Vec<MetricsCallback> = self.read().metrics.values().cloned().collect();
        for cb in callbacks {
            isolate("metrics", || cb(metrics));
        }
    }

    pub fn has_progress_listeners(&self) -> bool {
        !self.read().progress.is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn isolate(kind: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(hook = kind, "observer callback panicked");
    }
}
