//! Queue manager: the public façade over the scheduler, cache, resource
//! model, metrics, worker pools and scaler.
//!
//! All coordinator state lives behind one mutex (see `coordinator`). A single
//! background task ticks the dispatch loop and drains execution-unit
//! events; submission and cancellation take the same lock briefly from
//! caller threads. Observer hooks always run after the lock is released.

mod coordinator;
mod dispatch;
mod snapshot;
mod submission;


use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sluice_core::{Priority, QueueConfig, RequestId, ResourceSnapshot};
use tokio::sync::oneshot;
use tracing::info;

use crate::cache::CacheStats;
use crate::error::QueueError;
use crate::handler::SharedHandler;
use crate::hooks::SubscriptionId;
use crate::metrics::{Alert, Metric, MetricSummary, QueueHealth, QueueMetrics, Trend};
use crate::pool::PoolStats;
use crate::resources::ResourceProbe;
use crate::scaler::{ScalerStats, ScalingEvent};
use crate::scheduler::RequestInfo;

use self::coordinator::Inner;

pub use self::snapshot::{ImportSummary, QueueSnapshot, SNAPSHOT_VERSION};

// ── Request handle ────────────────────────────────────────────

/// How a submission was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Queued for execution.
    Queued,
    /// Answered from the result cache without queueing.
    Cached,
    /// Attached to an identical request already in flight; `id` is the
    /// original's.
    Joined,
}

enum Settlement {
    Ready(Result<Value, QueueError>),
    Pending(oneshot::Receiver<Result<Value, QueueError>>),
}

/// Returned by [`QueueManager::submit_request`].
pub struct RequestHandle {
    id: RequestId,
    origin: Origin,
    settlement: Settlement,
}

impl RequestHandle {
    pub(crate) fn ready(id: RequestId, origin: Origin, value: Value) -> Self {
        Self {
            id,
            origin,
            settlement: Settlement::Ready(Ok(value)),
        }
    }

    pub(crate) fn pending(id: RequestId, origin: Origin, rx: oneshot::Receiver<Result<Value, QueueError>>) -> Self {
        Self {
            id,
            origin,
            settlement: Settlement::Pending(rx),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Wait for the request to settle. Resolves with `Shutdown` if the
    /// manager goes away first.
    pub async fn wait(self) -> Result<Value, QueueError> {
        match self.settlement {
            Settlement::Ready(result) => result,
            Settlement::Pending(rx) => rx.await.unwrap_or(Err(QueueError::Shutdown)),
        }
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Aggregate view returned by [`QueueManager::queue_status`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub pending_by_priority: BTreeMap<Priority, usize>,
    pub pending: usize,
    pub retrying: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub health: QueueHealth,
    pub pools: Vec<PoolStats>,
    pub cache: CacheStats,
    pub resources: Option<ResourceSnapshot>,
}

// ── Manager ───────────────────────────────────────────────────

/// Cheap to clone; every clone drives the same queue.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

impl QueueManager {
    /// Validate `config`, start the worker pools and the dispatch loop.
    /// Must be called from within a tokio runtime.
    pub fn new(config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let inner = Inner::start(config, None);
        Ok(Self { inner })
    }

    /// Like [`new`](Self::new) with a custom resource probe.
    pub fn with_probe(config: QueueConfig, probe: Box<dyn ResourceProbe>) -> Result<Self, QueueError> {
        config.validate()?;
        let inner = Inner::start(config, Some(probe));
        Ok(Self { inner })
    }

    /// Register (or replace) the handler for a request type.
    pub fn register_handler(&self, request_type: impl Into<String>, handler: SharedHandler) {
        let request_type = request_type.into();
        info!(request_type = %request_type, "handler registered");
        self.inner.handlers_mut().insert(request_type, handler);
    }

    pub fn unregister_handler(&self, request_type: &str) -> bool {
        self.inner.handlers_mut().remove(request_type).is_some()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> QueueConfig {
        self.inner.state().config.clone()
    }

    // ── Status ────────────────────────────────────────────────

    pub fn get_request_status(&self, id: RequestId) -> Result<RequestInfo, QueueError> {
        self.inner.state().scheduler.info(&id).ok_or(QueueError::NotFound(id))
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.inner.state().status()
    }

    // ── Metrics ───────────────────────────────────────────────

    pub fn metrics(&self) -> QueueMetrics {
        self.inner.state().metrics.snapshot()
    }

    pub fn metrics_history(&self) -> Vec<QueueMetrics> {
        self.inner.state().metrics.history().cloned().collect()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.inner.state().metrics.alerts()
    }

    pub fn acknowledge_alert(&self, name: &str) -> bool {
        self.inner.state().metrics.acknowledge(name)
    }

    /// Health recommendations followed by scaling advice.
    pub fn recommendations(&self) -> Vec<String> {
        let state = self.inner.state();
        let mut out = state.metrics.recommendations();
        out.extend(state.scaler.recommendations());
        out
    }

    pub fn metric_percentile(&self, metric: Metric, p: f64) -> Option<f64> {
        self.inner.state().metrics.percentile(metric, p)
    }

    pub fn metric_trend(&self, metric: Metric) -> Option<Trend> {
        self.inner.state().metrics.trend(metric)
    }

    pub fn metric_summary(&self) -> BTreeMap<Metric, MetricSummary> {
        self.inner.state().metrics.summary()
    }

    pub fn scaling_events(&self) -> Vec<ScalingEvent> {
        self.inner.state().scaler.events()
    }

    pub fn scaler_stats(&self) -> ScalerStats {
        self.inner.state().scaler.stats()
    }

    /// Resize a pool by hand. Returns the size reached.
    pub fn scale_pool(&self, pool: &str, target: usize) -> Result<usize, QueueError> {
        let mut state = self.inner.state();
        let pool = state
            .pools
            .iter_mut()
            .find(|p| p.name() == pool)
            .ok_or_else(|| QueueError::Config(sluice_core::CoreError::Config(format!("unknown pool '{pool}'"))))?;
        Ok(pool.scale_to_size(target))
    }

    // ── Hooks ─────────────────────────────────────────────────

    pub fn on_progress<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(RequestId, f64) + Send + Sync + 'static,
    {
        self.inner.hooks.on_progress(f)
    }

    pub fn on_error<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&QueueError, Option<&RequestInfo>) + Send + Sync + 'static,
    {
        self.inner.hooks.on_error(f)
    }

    pub fn on_metrics<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&QueueMetrics) + Send + Sync + 'static,
    {
        self.inner.hooks.on_metrics(f)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.hooks.unsubscribe(id)
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Stop the dispatch loop, fail every waiting or running request with
    /// `Shutdown` and stop all pools. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.notify_one();
        let driver = self.inner.take_driver();
        if let Some(handle) = driver {
            let _ = handle.await;
        }
        self.inner.state().shutdown();
        info!("queue manager stopped");
    }
}
