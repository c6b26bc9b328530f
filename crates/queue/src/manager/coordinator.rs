//! Coordinator state and the background dispatch loop.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use sluice_core::{QueueConfig, RequestId};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::QueueStatus;
use crate::balancer::LoadBalancer;
use crate::cache::RequestCache;
use crate::error::QueueError;
use crate::handler::SharedHandler;
use crate::hooks::Hooks;
use crate::metrics::{QueueMetrics, QueueMetricsCollector};
use crate::pool::{UnitEvent, WorkerPool};
use crate::resources::{ResourceManager, ResourceProbe};
use crate::scaler::DynamicScaler;
use crate::scheduler::{PriorityScheduler, RequestInfo};

pub(super) type Waiter = oneshot::Sender<Result<Value, QueueError>>;
pub(super) type HandlerMap = HashMap<String, SharedHandler>;

/// Something observers should hear about once the state lock is released.
pub(super) enum Notice {
    Progress(RequestId, f64),
    Error(QueueError, Option<RequestInfo>),
    Metrics(QueueMetrics),
}

// ── Shared handle ─────────────────────────────────────────────

pub(super) struct Inner {
    state: Mutex<Coordinator>,
    handlers: RwLock<HandlerMap>,
    pub(super) hooks: Hooks,
    pub(super) shutdown: Notify,
    pub(super) closed: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    /// Build all components, spawn the pools and the dispatch loop.
    pub(super) fn start(config: QueueConfig, probe: Option<Box<dyn ResourceProbe>>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let interval = config.queue.dispatch_interval();
        let coordinator = Coordinator::new(config, probe, events_tx);
        let inner = Arc::new(Self {
            state: Mutex::new(coordinator),
            handlers: RwLock::new(HashMap::new()),
            hooks: Hooks::new(),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
            driver: Mutex::new(None),
        });
        let handle = tokio::spawn(drive(Arc::downgrade(&inner), events_rx, interval));
        *inner.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(interval_ms = interval.as_millis() as u64, "queue manager started");
        inner
    }

    pub(super) fn state(&self) -> MutexGuard<'_, Coordinator> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn handlers_mut(&self) -> RwLockWriteGuard<'_, HandlerMap> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers_snapshot(&self) -> HandlerMap {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(super) fn take_driver(&self) -> Option<JoinHandle<()>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// One dispatch tick. A panic inside is contained and reported.
    fn run_tick(&self) -> Vec<Notice> {
        let handlers = self.handlers_snapshot();
        let now = Instant::now();
        let mut state = self.state();
        match catch_unwind(AssertUnwindSafe(|| state.tick(&handlers, now))) {
            Ok(notices) => notices,
            Err(_) => {
                error!("dispatch tick panicked");
                vec![Notice::Error(
                    QueueError::Execution("dispatch tick panicked".into()),
                    None,
                )]
            }
        }
    }

    fn on_unit_event(&self, event: UnitEvent) -> Vec<Notice> {
        match event {
            UnitEvent::Progress { request_id, percent } => vec![Notice::Progress(request_id, percent)],
            UnitEvent::Finished {
                pool,
                unit,
                request_id,
                outcome,
                ..
            } => {
                let handlers = self.handlers_snapshot();
                let now = Instant::now();
                let mut state = self.state();
                let mut notices = state.on_finished(&pool, unit, request_id, outcome, now);
                // A slot just freed up; use it without waiting for the tick.
                notices.extend(state.dispatch(&handlers, now));
                notices
            }
            UnitEvent::Exited { pool, unit, fault } => self.state().on_exited(&pool, unit, fault, Instant::now()),
        }
    }

    pub(super) fn fire(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::Progress(id, pct) => self.hooks.emit_progress(id, pct),
                Notice::Error(err, info) => self.hooks.emit_error(&err, info.as_ref()),
                Notice::Metrics(m) => self.hooks.emit_metrics(&m),
            }
        }
    }
}

/// Background loop. Holds only a weak reference so dropping every
/// [`QueueManager`](super::QueueManager) stops it.
async fn drive(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<UnitEvent>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let Some(inner) = inner.upgrade() else {
            debug!("queue manager dropped, dispatch loop exiting");
            break;
        };
        let notices = tokio::select! {
            _ = inner.shutdown.notified() => break,
            _ = ticker.tick() => inner.run_tick(),
            Some(event) = events.recv() => inner.on_unit_event(event),
        };
        inner.fire(notices);
    }
}

// ── Coordinator state ─────────────────────────────────────────

pub(super) struct Coordinator {
    pub(super) config: QueueConfig,
    pub(super) scheduler: PriorityScheduler,
    pub(super) resources: ResourceManager,
    pub(super) cache: RequestCache,
    pub(super) metrics: QueueMetricsCollector,
    pub(super) pools: Vec<WorkerPool>,
    pub(super) balancer: LoadBalancer,
    pub(super) scaler: DynamicScaler,
    /// Callers awaiting each request's settlement.
    pub(super) waiters: HashMap<RequestId, Vec<Waiter>>,
    /// Dedup key of every in-flight cacheable request, both directions.
    pub(super) inflight_keys: HashMap<String, RequestId>,
    pub(super) request_keys: HashMap<RequestId, String>,
    /// Processing requests whose cancellation has been sent to a unit.
    pub(super) cancel_requested: HashSet<RequestId>,
    pub(super) last_metrics_update: Instant,
    pub(super) last_emit: Instant,
    pub(super) last_sweep: Instant,
}

impl Coordinator {
    fn new(
        config: QueueConfig,
        probe: Option<Box<dyn ResourceProbe>>,
        events: mpsc::UnboundedSender<UnitEvent>,
    ) -> Self {
        let resources = match probe {
            Some(probe) => ResourceManager::new(config.resources.clone(), probe),
            None => ResourceManager::from_config(config.resources.clone()),
        };
        let pools = config
            .pools
            .iter()
            .cloned()
            .map(|p| WorkerPool::new(p, events.clone()))
            .collect();
        let now = Instant::now();
        Self {
            scheduler: PriorityScheduler::new(config.queue.retry_backoff_base(), config.queue.completed_history),
            resources,
            cache: RequestCache::new(&config.cache),
            metrics: QueueMetricsCollector::new(config.metrics.clone()),
            pools,
            balancer: LoadBalancer::new(config.balancer.strategy),
            scaler: DynamicScaler::new(config.scaling.clone()),
            config,
            waiters: HashMap::new(),
            inflight_keys: HashMap::new(),
            request_keys: HashMap::new(),
            cancel_requested: HashSet::new(),
            last_metrics_update: now,
            last_emit: now,
            last_sweep: now,
        }
    }

    /// Resolve every waiter of `id`.
    pub(super) fn resolve(&mut self, id: &RequestId, result: Result<Value, QueueError>) {
        for tx in self.waiters.remove(id).unwrap_or_default() {
            let _ = tx.send(result.clone());
        }
    }

    /// Drop the dedup key of a request that is no longer in flight.
    pub(super) fn forget_key(&mut self, id: &RequestId) {
        if let Some(key) = self.request_keys.remove(id) {
            if self.inflight_keys.get(&key) == Some(id) {
                self.inflight_keys.remove(&key);
            }
        }
    }

    pub(super) fn status(&self) -> QueueStatus {
        let counters = self.metrics.counters();
        QueueStatus {
            pending_by_priority: self.scheduler.pending_by_priority().into_iter().collect::<BTreeMap<_, _>>(),
            pending: self.scheduler.pending_len(),
            retrying: self.scheduler.retrying_len(),
            active: self.scheduler.active_len(),
            completed: counters.completed,
            failed: counters.failed,
            cancelled: counters.cancelled,
            health: self.metrics.health(),
            pools: self.pools.iter().map(WorkerPool::stats).collect(),
            cache: self.cache.stats(),
            resources: self.resources.current().cloned(),
        }
    }

    /// Fail everything still queued or running with `Shutdown` and stop
    /// the pools.
    pub(super) fn shutdown(&mut self) {
        for request in self.scheduler.drain_waiting() {
            self.forget_key(&request.id);
            self.resolve(&request.id, Err(QueueError::Shutdown));
        }
        let mut orphaned = Vec::new();
        for pool in &mut self.pools {
            orphaned.extend(pool.shutdown());
        }
        for id in orphaned.into_iter().chain(self.scheduler.active_ids()) {
            self.resources.release(&id);
            if self.scheduler.remove(&id).is_some() {
                self.metrics.record_cancelled();
            }
            self.forget_key(&id);
            self.resolve(&id, Err(QueueError::Shutdown));
        }
        let leftover: Vec<RequestId> = self.waiters.keys().copied().collect();
        for id in leftover {
            self.resolve(&id, Err(QueueError::Shutdown));
        }
    }
}
