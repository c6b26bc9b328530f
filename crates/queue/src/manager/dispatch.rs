//! Per-tick work: promotion, dispatch, settlement, scaling, metrics and
//! cache maintenance.

use std::time::{Duration, Instant};

use chrono::{Timelike, Utc};
use sluice_core::{QueueSection, RequestId};
use tracing::{debug, info, warn};

use super::coordinator::{Coordinator, HandlerMap, Notice};
use crate::cache::cache_key;
use crate::error::QueueError;
use crate::metrics::{AlertChange, QueueGauges};
use crate::pool::{Assignment, ExecutionOutcome, UnitId};
use crate::predictor::LoadObservation;
use crate::scaler::ScalingInputs;
use crate::scheduler::{FailOutcome, PriorityScheduler};

/// Cadence of metric recomputation (health, alerts, history).
const METRICS_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

impl Coordinator {
    pub(super) fn tick(&mut self, handlers: &HandlerMap, now: Instant) -> Vec<Notice> {
        self.resources.sample_if_due(now);

        let promoted = self.scheduler.promote_due(now);
        if !promoted.is_empty() {
            debug!(count = promoted.len(), "retries promoted");
        }

        let mut notices = self.dispatch(handlers, now);

        if self.scaler.is_enabled() {
            if self.scaler.is_due(now) {
                self.evaluate_scaling(now);
            }
        } else {
            let pending = self.scheduler.pending_len();
            for pool in &mut self.pools {
                if let Some((from, to)) = pool.auto_scale_tick(pending, now) {
                    info!(pool = %pool.name(), from, to, "pool auto-scaled");
                }
            }
        }

        if now.saturating_duration_since(self.last_metrics_update) >= METRICS_UPDATE_INTERVAL {
            self.last_metrics_update = now;
            self.update_metrics(now);
        }
        if now.saturating_duration_since(self.last_emit) >= self.config.metrics.emit_interval() {
            self.last_emit = now;
            notices.push(Notice::Metrics(self.metrics.snapshot()));
        }
        if now.saturating_duration_since(self.last_sweep) >= self.config.cache.sweep_interval() {
            self.last_sweep = now;
            let swept = self.cache.sweep_expired_at(now);
            if swept > 0 {
                debug!(swept, "expired cache entries removed");
            }
        }
        notices
    }

    // ── Dispatch ──────────────────────────────────────────────

    /// Move eligible requests to pools until nothing fits or the per-tick
    /// limit is reached.
    pub(super) fn dispatch(&mut self, handlers: &HandlerMap, now: Instant) -> Vec<Notice> {
        let mut notices = Vec::new();

        for _ in 0..self.config.queue.max_dispatch_per_tick {
            let budget = self.resources.available_resources();
            let mut target = None;
            let request = {
                let pools = &self.pools;
                let balancer = &mut self.balancer;
                let resources = &self.resources;
                self.scheduler.dequeue_with(&budget, |req| {
                    target = balancer.select(pools, &req.request_type, |name| resources.pool_load(name));
                    target.is_some()
                })
            };
            let (Some(request), Some(pool_idx)) = (request, target) else {
                break;
            };
            let id = request.id;

            let Some(handler) = handlers.get(&request.request_type).cloned() else {
                warn!(request_id = %id, request_type = %request.request_type, "no handler registered");
                notices.extend(self.settle(
                    id,
                    ExecutionOutcome::Failed(QueueError::NoHandler(request.request_type.clone())),
                    now,
                ));
                continue;
            };

            // A twin may have finished since this one was queued.
            if request.cache.cacheable {
                if let Some(value) = self.cache.get_at(&cache_key(&request), now) {
                    debug!(request_id = %id, "served from cache at dispatch");
                    self.metrics.record_cache_hit();
                    notices.extend(self.settle(id, ExecutionOutcome::Completed(value), now));
                    continue;
                }
            }

            let pool = &mut self.pools[pool_idx];
            if let Err(e) = self.resources.allocate(id, &request.resources, pool.name()) {
                // The ledger is advisory; dequeue already checked the fit.
                warn!(request_id = %id, error = %e, "ledger allocation refused, dispatching anyway");
            }

            let assignment = Assignment {
                request_id: id,
                request_type: request.request_type.clone(),
                payload: request.payload.clone(),
                attempt: request.retry.retry_count + 1,
                timeout: request.retry.timeout,
                handler,
            };
            match pool.process_request(assignment) {
                Ok(unit) => {
                    self.metrics.record_dispatch(request.wait_time().unwrap_or_default());
                    debug!(
                        request_id = %id,
                        pool = %pool.name(),
                        unit = %unit,
                        priority = %request.priority,
                        attempt = request.retry.retry_count + 1,
                        "dispatched"
                    );
                }
                Err(e) => {
                    warn!(request_id = %id, error = %e, "dispatch to pool failed");
                    notices.extend(self.settle(id, ExecutionOutcome::Failed(e), now));
                }
            }
        }
        notices
    }

    // ── Unit events ───────────────────────────────────────────

    pub(super) fn on_finished(
        &mut self,
        pool: &str,
        unit: UnitId,
        request_id: RequestId,
        outcome: ExecutionOutcome,
        now: Instant,
    ) -> Vec<Notice> {
        let Some(pool) = self.pools.iter_mut().find(|p| p.name() == pool) else {
            return Vec::new();
        };
        let settled = pool.handle_finished(unit, request_id, outcome);
        let mut notices = Vec::new();
        for (id, outcome) in settled {
            notices.extend(self.settle(id, outcome, now));
        }
        notices
    }

    pub(super) fn on_exited(&mut self, pool: &str, unit: UnitId, fault: Option<String>, now: Instant) -> Vec<Notice> {
        let Some(pool) = self.pools.iter_mut().find(|p| p.name() == pool) else {
            return Vec::new();
        };
        let settled = pool.handle_exited(unit, fault);
        let mut notices = Vec::new();
        for (id, outcome) in settled {
            notices.extend(self.settle(id, outcome, now));
        }
        notices
    }

    // ── Settlement ────────────────────────────────────────────

    /// Apply the outcome of one attempt to scheduler, ledger, cache,
    /// metrics and waiters.
    pub(super) fn settle(&mut self, id: RequestId, outcome: ExecutionOutcome, now: Instant) -> Vec<Notice> {
        self.resources.release(&id);
        let outcome = if self.cancel_requested.remove(&id) {
            ExecutionOutcome::Cancelled
        } else {
            outcome
        };

        match outcome {
            ExecutionOutcome::Completed(value) => {
                let Some(request) = self.scheduler.complete(&id) else {
                    return Vec::new();
                };
                if request.cache.cacheable {
                    self.cache.set_at(cache_key(&request), value.clone(), request.cache.ttl, now);
                }
                self.metrics
                    .record_completion(request.processing_time().unwrap_or_default(), now);
                self.forget_key(&id);
                self.resolve(&id, Ok(value));
                info!(request_id = %id, request_type = %request.request_type, "request completed");
                Vec::new()
            }
            ExecutionOutcome::Cancelled => {
                if self.scheduler.remove(&id).is_some() {
                    self.metrics.record_cancelled();
                    info!(request_id = %id, "request cancelled");
                }
                self.forget_key(&id);
                self.resolve(&id, Err(QueueError::Cancelled));
                Vec::new()
            }
            ExecutionOutcome::Failed(error) => {
                let timed_out = matches!(error, QueueError::Timeout(_));
                match self.scheduler.fail_at(&id, &error, now) {
                    Some(FailOutcome::Retrying { delay, retry_count }) => {
                        self.metrics.record_retry(timed_out);
                        warn!(
                            request_id = %id,
                            error = %error,
                            retry_count,
                            delay_ms = delay.as_millis() as u64,
                            "attempt failed, retry scheduled"
                        );
                        Vec::new()
                    }
                    Some(FailOutcome::Failed) => {
                        self.metrics.record_failure(timed_out, now);
                        self.forget_key(&id);
                        self.resolve(&id, Err(error.clone()));
                        warn!(request_id = %id, error = %error, kind = error.kind(), "request failed");
                        vec![Notice::Error(error, self.scheduler.info(&id))]
                    }
                    None => Vec::new(),
                }
            }
        }
    }

    // ── Scaling ───────────────────────────────────────────────

    fn evaluate_scaling(&mut self, now: Instant) {
        let snapshot = self.metrics.snapshot();
        let signal = self.resources.signal();
        let cpu = self.resources.cpu_utilization();
        let memory = self.resources.memory_utilization();
        let pending = self.scheduler.pending_len();
        let backlog = weighted_backlog(&self.scheduler, &self.config.queue);
        let optimal_workers = self
            .resources
            .current()
            .is_some()
            .then(|| self.resources.optimal_worker_count());
        let wall = Utc::now();
        let hour_of_day = wall.hour() as f64 + wall.minute() as f64 / 60.0;
        let total_capacity: usize = self.pools.iter().map(|p| p.capacity()).sum();

        self.scaler.observe_load(
            LoadObservation {
                hour_of_day,
                throughput: snapshot.throughput,
                queue_length: pending as f64,
                capacity: total_capacity as f64,
            },
            now,
        );

        for pool in &mut self.pools {
            let config = pool.config();
            let inputs = ScalingInputs {
                pool: pool.name().to_string(),
                current: pool.size(),
                min: config.min_workers,
                max: config.max_workers,
                cpu,
                memory,
                pending: backlog,
                avg_latency_ms: snapshot.avg_wait_ms + snapshot.avg_processing_ms,
                optimal_workers,
                resource_signal: signal,
                load: LoadObservation {
                    hour_of_day,
                    throughput: snapshot.throughput,
                    queue_length: pending as f64,
                    capacity: pool.capacity() as f64,
                },
            };
            let (min, max) = (config.min_workers, config.max_workers);
            if let Some(decision) = self.scaler.evaluate_at(&inputs, now) {
                let started = Instant::now();
                let reached = pool.scale_to_size(decision.to);
                self.scaler.record_action(&decision, reached, min, max, started.elapsed());
            }
        }
    }

    // ── Metrics ───────────────────────────────────────────────

    fn update_metrics(&mut self, now: Instant) {
        let gauges = QueueGauges {
            pending: self.scheduler.pending_len(),
            processing: self.scheduler.active_len(),
            retrying: self.scheduler.retrying_len(),
            workers: self.pools.iter().map(|p| p.size()).sum(),
            cpu_utilization: self.resources.cpu_utilization(),
            memory_utilization: self.resources.memory_utilization(),
        };
        for change in self.metrics.update(gauges, now) {
            match change {
                AlertChange::Raised(alert) | AlertChange::Escalated(alert) => {
                    debug!(alert = %alert.name, value = alert.value, "alert state changed");
                }
                AlertChange::Cleared(name) => debug!(alert = %name, "alert cleared"),
            }
        }
    }
}

/// Pending requests weighted by `queue.priority_weights`, in units of one
/// Normal request.
fn weighted_backlog(scheduler: &PriorityScheduler, queue: &QueueSection) -> f64 {
    scheduler.weighted_pending(|priority| queue.relative_weight(priority))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;
    use sluice_core::{Priority, Request, ScalingSection};

    use super::*;
    use crate::resources::ResourceSignal;
    use crate::scaler::DynamicScaler;

    fn backlog_of(queue: &QueueSection) -> f64 {
        let mut scheduler = PriorityScheduler::new(Duration::from_secs(1), 10);
        for _ in 0..6 {
            scheduler.enqueue(Request::new("job", Value::Null).with_priority(Priority::Critical));
        }
        for _ in 0..6 {
            scheduler.enqueue(Request::new("job", Value::Null));
        }
        weighted_backlog(&scheduler, queue)
    }

    fn queue_score(scaler: &DynamicScaler, pending: f64) -> f64 {
        let inputs = ScalingInputs {
            pool: "default".into(),
            current: 4,
            min: 1,
            max: 8,
            cpu: 0.0,
            memory: 0.0,
            pending,
            avg_latency_ms: 0.0,
            optimal_workers: None,
            resource_signal: ResourceSignal::Neutral,
            load: LoadObservation {
                hour_of_day: 12.0,
                throughput: 0.0,
                queue_length: pending,
                capacity: 4.0,
            },
        };
        scaler.score(&scaler.factors(&inputs))
    }

    #[test]
    fn priority_weights_shape_queue_pressure() {
        let default = QueueSection::default();
        let mut flat = QueueSection::default();
        for priority in Priority::ALL {
            flat.priority_weights.insert(priority.as_str().to_string(), 1.0);
        }

        // Six criticals count 5/3 each by default; flat weights count them as one.
        assert!((backlog_of(&default) - 16.0).abs() < 1e-9);
        assert!((backlog_of(&flat) - 12.0).abs() < 1e-9);

        let scaler = DynamicScaler::new(ScalingSection::default());
        assert!(queue_score(&scaler, backlog_of(&default)) > queue_score(&scaler, backlog_of(&flat)));
    }
}
