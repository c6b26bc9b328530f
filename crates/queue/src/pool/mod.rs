//! Worker pool: a bounded, resizable set of execution units.
//!
//! The pool itself is plain state owned by the coordinator. Units are tokio
//! tasks reached only through their inbox; results come back on the shared
//! event channel handed to [`WorkerPool::new`] and are fed into
//! [`WorkerPool::handle_finished`] / [`WorkerPool::handle_exited`].

mod unit;

pub use unit::{Assignment, ExecutionOutcome, UnitCommand, UnitEvent, UnitId, CANCEL_GRACE};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sluice_core::{PoolConfig, RequestId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::QueueError;

/// Busy ratio above which the fallback auto-scaler adds a unit.
const AUTO_GROW_RATIO: f64 = 0.8;
/// Busy ratio below which it may retire an idle unit.
const AUTO_SHRINK_RATIO: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Idle,
    Busy,
    Draining,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitStats {
    pub id: UnitId,
    pub state: UnitState,
    pub active_requests: usize,
    pub processed: u64,
    pub errors: u32,
    pub created_at: DateTime<Utc>,
    pub idle_for_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub size: usize,
    pub busy: usize,
    pub idle: usize,
    pub draining: usize,
    pub in_flight: usize,
    pub capacity: usize,
    pub processed: u64,
    pub restarts: u64,
    pub min_workers: usize,
    pub max_workers: usize,
    pub units: Vec<UnitStats>,
}

struct UnitSlot {
    inbox: mpsc::UnboundedSender<UnitCommand>,
    in_flight: HashSet<RequestId>,
    processed: u64,
    errors: u32,
    created_at: DateTime<Utc>,
    last_active: Instant,
    draining: bool,
}

impl UnitSlot {
    fn state(&self) -> UnitState {
        if self.draining {
            UnitState::Draining
        } else if self.in_flight.is_empty() {
            UnitState::Idle
        } else {
            UnitState::Busy
        }
    }
}

pub struct WorkerPool {
    config: PoolConfig,
    name: Arc<str>,
    units: BTreeMap<UnitId, UnitSlot>,
    next_unit: u64,
    events: mpsc::UnboundedSender<UnitEvent>,
    processed: u64,
    restarts: u64,
    last_auto_scale: Instant,
}

impl WorkerPool {
    /// Create the pool and spawn `min_workers` units. Must be called inside
    /// a tokio runtime.
    pub fn new(config: PoolConfig, events: mpsc::UnboundedSender<UnitEvent>) -> Self {
        let name: Arc<str> = Arc::from(config.name.as_str());
        let mut pool = Self {
            config,
            name,
            units: BTreeMap::new(),
            next_unit: 0,
            events,
            processed: 0,
            restarts: 0,
            last_auto_scale: Instant::now(),
        };
        for _ in 0..pool.config.min_workers {
            pool.spawn_unit();
        }
        info!(pool = %pool.name, units = pool.units.len(), "worker pool started");
        pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Units that accept new work.
    pub fn size(&self) -> usize {
        self.units.values().filter(|u| !u.draining).count()
    }

    pub fn in_flight(&self) -> usize {
        self.units.values().map(|u| u.in_flight.len()).sum()
    }

    /// Request slots available right now, counting units that could still
    /// be spawned.
    pub fn free_capacity(&self) -> usize {
        let per_unit = self.config.max_concurrent_requests;
        let open: usize = self
            .units
            .values()
            .filter(|u| !u.draining)
            .map(|u| per_unit.saturating_sub(u.in_flight.len()))
            .sum();
        let spawnable = self.config.max_workers.saturating_sub(self.size());
        open + spawnable * per_unit
    }

    /// Total slots at the current size.
    pub fn capacity(&self) -> usize {
        self.size() * self.config.max_concurrent_requests
    }

    pub fn accepts(&self, request_type: &str) -> bool {
        self.config.accepts(request_type)
    }

    pub fn has_capacity_for(&self, request_type: &str) -> bool {
        self.accepts(request_type) && self.free_capacity() > 0
    }

    pub fn owner_of(&self, request_id: RequestId) -> Option<UnitId> {
        self.units
            .iter()
            .find(|(_, u)| u.in_flight.contains(&request_id))
            .map(|(id, _)| *id)
    }

    // ── Dispatch ──────────────────────────────────────────────

    /// Hand a request to the least loaded unit, spawning one if every unit
    /// is saturated and the pool is below `max_workers`.
    pub fn process_request(&mut self, assignment: Assignment) -> Result<UnitId, QueueError> {
        let request_id = assignment.request_id;
        let unit = match self.pick_unit() {
            Some(id) => id,
            None if self.size() < self.config.max_workers => self.spawn_unit(),
            None => {
                return Err(QueueError::WorkerFault(format!(
                    "pool {} has no free execution unit",
                    self.name
                )))
            }
        };

        let assignment = match self.send(unit, assignment) {
            Ok(()) => return Ok(unit),
            Err(returned) => returned,
        };

        // The unit's inbox is closed: it died between our last event and
        // now. Replace it and try once more.
        warn!(pool = %self.name, unit = %unit, request_id = %request_id, "unit inbox closed, replacing");
        self.units.remove(&unit);
        self.restarts += 1;
        let replacement = self.spawn_unit();
        self.send(replacement, assignment)
            .map(|()| replacement)
            .map_err(|_| QueueError::WorkerFault(format!("unit {replacement} rejected dispatch")))
    }

    fn pick_unit(&self) -> Option<UnitId> {
        let limit = self.config.max_concurrent_requests;
        self.units
            .iter()
            .filter(|(_, u)| !u.draining && u.in_flight.len() < limit)
            .min_by_key(|(_, u)| u.in_flight.len())
            .map(|(id, _)| *id)
    }

    fn send(&mut self, unit: UnitId, assignment: Assignment) -> Result<(), Assignment> {
        let Some(slot) = self.units.get_mut(&unit) else {
            return Err(assignment);
        };
        let request_id = assignment.request_id;
        match slot.inbox.send(UnitCommand::Execute(assignment)) {
            Ok(()) => {
                slot.in_flight.insert(request_id);
                slot.last_active = Instant::now();
                debug!(pool = %self.name, unit = %unit, request_id = %request_id, "dispatched");
                Ok(())
            }
            Err(mpsc::error::SendError(UnitCommand::Execute(a))) => Err(a),
            Err(_) => unreachable!("only Execute is sent here"),
        }
    }

    /// Ask the owning unit to cancel. Returns false if no unit holds it.
    pub fn cancel(&self, request_id: RequestId) -> bool {
        let Some(unit) = self.owner_of(request_id) else {
            return false;
        };
        match self.units.get(&unit) {
            Some(slot) => slot.inbox.send(UnitCommand::Cancel(request_id)).is_ok(),
            None => false,
        }
    }

    // ── Unit events ───────────────────────────────────────────

    /// Account for a finished request. Returns every request that settled
    /// as a result: the reported one, plus the remaining in-flight requests
    /// of a unit torn down for exceeding its error threshold.
    ///
    /// A unit's error count is cumulative over its lifetime; successes do
    /// not reset it. The unit is replaced once the count is above
    /// `error_threshold`.
    pub fn handle_finished(
        &mut self,
        unit: UnitId,
        request_id: RequestId,
        outcome: ExecutionOutcome,
    ) -> Vec<(RequestId, ExecutionOutcome)> {
        let Some(slot) = self.units.get_mut(&unit) else {
            debug!(pool = %self.name, unit = %unit, request_id = %request_id, "stale finish event");
            return Vec::new();
        };
        if !slot.in_flight.remove(&request_id) {
            return Vec::new();
        }
        slot.processed += 1;
        slot.last_active = Instant::now();
        self.processed += 1;

        let timed_out = matches!(outcome, ExecutionOutcome::Failed(QueueError::Timeout(_)));
        if let ExecutionOutcome::Failed(_) = &outcome {
            slot.errors += 1;
        }
        let errors = slot.errors;

        let mut settled = vec![(request_id, outcome)];

        if errors > self.config.error_threshold {
            warn!(pool = %self.name, unit = %unit, errors, "error threshold exceeded, restarting unit");
            settled.extend(self.restart_unit(unit, "worker restarted"));
            return settled;
        }

        if timed_out {
            // The handler may still be wedged inside the unit; stop feeding it.
            if let Some(slot) = self.units.get_mut(&unit) {
                if !slot.draining {
                    slot.draining = true;
                    info!(pool = %self.name, unit = %unit, "unit timed out, draining and replacing");
                    if self.size() < self.config.min_workers.max(1) {
                        self.spawn_unit();
                    }
                }
            }
        }

        self.retire_drained();
        settled
    }

    /// A unit task ended. Fails its in-flight work if it died abnormally
    /// and keeps the pool at its minimum size.
    pub fn handle_exited(&mut self, unit: UnitId, fault: Option<String>) -> Vec<(RequestId, ExecutionOutcome)> {
        let Some(slot) = self.units.remove(&unit) else {
            return Vec::new();
        };
        let reason = fault.unwrap_or_else(|| "unit exited".to_string());
        warn!(pool = %self.name, unit = %unit, reason = %reason, in_flight = slot.in_flight.len(), "unit lost");
        self.restarts += 1;
        let settled = slot
            .in_flight
            .into_iter()
            .map(|id| (id, ExecutionOutcome::Failed(QueueError::Execution("worker restarted".into()))))
            .collect();
        while self.size() < self.config.min_workers {
            self.spawn_unit();
        }
        settled
    }

    fn restart_unit(&mut self, unit: UnitId, reason: &str) -> Vec<(RequestId, ExecutionOutcome)> {
        let Some(slot) = self.units.remove(&unit) else {
            return Vec::new();
        };
        let _ = slot.inbox.send(UnitCommand::Shutdown);
        self.restarts += 1;
        let was_active = !slot.draining;
        let failed = slot
            .in_flight
            .into_iter()
            .map(|id| (id, ExecutionOutcome::Failed(QueueError::Execution(reason.to_string()))))
            .collect();
        if was_active || self.size() < self.config.min_workers {
            self.spawn_unit();
        }
        failed
    }

    fn retire_drained(&mut self) {
        let done: Vec<UnitId> = self
            .units
            .iter()
            .filter(|(_, u)| u.draining && u.in_flight.is_empty())
            .map(|(id, _)| *id)
            .collect();
        for id in done {
            if let Some(slot) = self.units.remove(&id) {
                let _ = slot.inbox.send(UnitCommand::Shutdown);
                debug!(pool = %self.name, unit = %id, "drained unit retired");
            }
        }
    }

    // ── Sizing ────────────────────────────────────────────────

    /// Resize to `target`, clamped to `[min_workers, max_workers]`. Growing
    /// reactivates draining units before spawning. Shrinking removes idle
    /// units (longest idle first), then drains busy ones. Returns the new
    /// size.
    pub fn scale_to_size(&mut self, target: usize) -> usize {
        let target = self.config.clamp_size(target);
        let current = self.size();

        if target > current {
            let mut missing = target - current;
            for slot in self.units.values_mut().filter(|u| u.draining) {
                if missing == 0 {
                    break;
                }
                slot.draining = false;
                missing -= 1;
            }
            for _ in 0..missing {
                self.spawn_unit();
            }
        } else if target < current {
            let mut excess = current - target;
            let mut idle: Vec<(UnitId, Instant)> = self
                .units
                .iter()
                .filter(|(_, u)| !u.draining && u.in_flight.is_empty())
                .map(|(id, u)| (*id, u.last_active))
                .collect();
            idle.sort_by_key(|(_, last)| *last);
            for (id, _) in idle.into_iter().take(excess) {
                if let Some(slot) = self.units.remove(&id) {
                    let _ = slot.inbox.send(UnitCommand::Shutdown);
                }
                excess -= 1;
            }
            if excess > 0 {
                let mut busy: Vec<(UnitId, usize)> = self
                    .units
                    .iter()
                    .filter(|(_, u)| !u.draining)
                    .map(|(id, u)| (*id, u.in_flight.len()))
                    .collect();
                busy.sort_by_key(|(_, load)| *load);
                for (id, _) in busy.into_iter().take(excess) {
                    if let Some(slot) = self.units.get_mut(&id) {
                        slot.draining = true;
                    }
                }
            }
        }

        let size = self.size();
        if size != current {
            info!(pool = %self.name, from = current, to = size, "pool resized");
        }
        size
    }

    /// Fallback sizing from pending/busy ratios, run every
    /// `auto_scale_interval`. Returns `(from, to)` when the size changed.
    pub fn auto_scale_tick(&mut self, pending: usize, now: Instant) -> Option<(usize, usize)> {
        if !self.config.auto_scale
            || now.saturating_duration_since(self.last_auto_scale) < self.config.auto_scale_interval()
        {
            return None;
        }
        self.last_auto_scale = now;

        let current = self.size();
        let capacity = self.capacity().max(1);
        let busy_ratio = self.in_flight() as f64 / capacity as f64;
        let idle_timeout = self.config.idle_timeout();

        let target = if pending > 0 && busy_ratio >= AUTO_GROW_RATIO {
            current + 1
        } else if pending == 0 && busy_ratio < AUTO_SHRINK_RATIO && self.has_idle_unit_older_than(idle_timeout, now) {
            current.saturating_sub(1)
        } else {
            return None;
        };

        let size = self.scale_to_size(target);
        (size != current).then_some((current, size))
    }

    fn has_idle_unit_older_than(&self, idle: Duration, now: Instant) -> bool {
        self.units
            .values()
            .any(|u| !u.draining && u.in_flight.is_empty() && now.saturating_duration_since(u.last_active) >= idle)
    }

    fn spawn_unit(&mut self) -> UnitId {
        self.next_unit += 1;
        let id = UnitId(self.next_unit);
        let inbox = unit::spawn_unit(Arc::clone(&self.name), id, self.events.clone());
        self.units.insert(
            id,
            UnitSlot {
                inbox,
                in_flight: HashSet::new(),
                processed: 0,
                errors: 0,
                created_at: Utc::now(),
                last_active: Instant::now(),
                draining: false,
            },
        );
        debug!(pool = %self.name, unit = %id, "unit spawned");
        id
    }

    // ── Lifecycle / stats ─────────────────────────────────────

    /// Stop every unit. Requests still in flight are returned so the caller
    /// can settle them.
    pub fn shutdown(&mut self) -> Vec<RequestId> {
        let mut orphaned = Vec::new();
        for (id, slot) in std::mem::take(&mut self.units) {
            let _ = slot.inbox.send(UnitCommand::Shutdown);
            orphaned.extend(slot.in_flight);
            debug!(pool = %self.name, unit = %id, "unit shut down");
        }
        info!(pool = %self.name, orphaned = orphaned.len(), "worker pool stopped");
        orphaned
    }

    pub fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let units: Vec<UnitStats> = self
            .units
            .iter()
            .map(|(id, u)| UnitStats {
                id: *id,
                state: u.state(),
                active_requests: u.in_flight.len(),
                processed: u.processed,
                errors: u.errors,
                created_at: u.created_at,
                idle_for_ms: if u.in_flight.is_empty() {
                    now.saturating_duration_since(u.last_active).as_millis() as u64
                } else {
                    0
                },
            })
            .collect();
        let count = |state: UnitState| units.iter().filter(|u| u.state == state).count();
        PoolStats {
            name: self.name.to_string(),
            size: self.size(),
            busy: count(UnitState::Busy),
            idle: count(UnitState::Idle),
            draining: count(UnitState::Draining),
            in_flight: self.in_flight(),
            capacity: self.capacity(),
            processed: self.processed,
            restarts: self.restarts,
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            units,
        }
    }
}
