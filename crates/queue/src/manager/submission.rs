//! Admission and cancellation.

use std::sync::atomic::Ordering;
use std::time::Instant;

use serde_json::Value;
use sluice_core::{CacheDirective, Request, RequestId, ResourceRequirements, SubmitOptions};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::coordinator::Coordinator;
use super::{Origin, QueueManager, RequestHandle};
use crate::cache::fingerprint;
use crate::error::QueueError;
use crate::pool::ExecutionOutcome;

const MIB: u64 = 1024 * 1024;

impl QueueManager {
    /// Admit a request.
    ///
    /// Rejects with [`QueueError::Admission`] when the queue is full. A
    /// cacheable request whose result is already cached resolves
    /// immediately; one identical to a request still in flight joins it.
    pub fn submit_request(
        &self,
        request_type: impl Into<String>,
        payload: Value,
        options: SubmitOptions,
    ) -> Result<RequestHandle, QueueError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Shutdown);
        }
        self.inner
            .state()
            .submit(request_type.into(), payload, options, Instant::now())
    }

    /// Cancel a request. Returns `Ok(false)` if it had already settled.
    ///
    /// A running request is signalled through its unit; the caller's
    /// handle resolves with [`QueueError::Cancelled`] once the unit lets go.
    pub fn cancel_request(&self, id: RequestId) -> Result<bool, QueueError> {
        self.inner.state().cancel(id, Instant::now())
    }
}

impl Coordinator {
    pub(super) fn submit(
        &mut self,
        request_type: String,
        payload: Value,
        options: SubmitOptions,
        now: Instant,
    ) -> Result<RequestHandle, QueueError> {
        let capacity = self.config.queue.max_queue_size;
        if self.scheduler.waiting_len() >= capacity {
            self.metrics.record_rejected();
            warn!(request_type = %request_type, capacity, "queue full, request rejected");
            return Err(QueueError::Admission { capacity });
        }
        self.metrics.record_submitted();

        let cacheable = options.cacheable || options.cache_key.is_some();
        let key = cacheable.then(|| {
            options
                .cache_key
                .clone()
                .unwrap_or_else(|| fingerprint(&request_type, &payload))
        });

        if let Some(key) = &key {
            let duplicate = self.cache.is_duplicate_key_at(key, now);
            if let Some(value) = self.cache.get_at(key, now) {
                if duplicate {
                    self.metrics.record_deduplicated();
                } else {
                    self.metrics.record_cache_hit();
                }
                let served = Request::new(request_type, payload)
                    .with_priority(options.priority.unwrap_or_default());
                let id = served.id;
                self.scheduler.record_served(served);
                debug!(request_id = %id, duplicate, "answered from cache");
                return Ok(RequestHandle::ready(id, Origin::Cached, value));
            }
            if let Some(&original) = self.inflight_keys.get(key) {
                let (tx, rx) = oneshot::channel();
                self.waiters.entry(original).or_default().push(tx);
                self.metrics.record_deduplicated();
                debug!(request_id = %original, "joined in-flight duplicate");
                return Ok(RequestHandle::pending(original, Origin::Joined, rx));
            }
        }

        let queue = &self.config.queue;
        let mut request = Request::new(request_type, payload)
            .with_priority(options.priority.unwrap_or_default())
            .with_retry(
                options.max_retries.unwrap_or(queue.default_max_retries),
                options.timeout.unwrap_or_else(|| queue.default_timeout()),
            );
        request.dependencies = options.dependencies.into_iter().collect();
        request.metadata = options.metadata;
        request.cache = CacheDirective {
            cacheable,
            key: options.cache_key,
            ttl: options.cache_ttl,
        };
        request.resources = match options.resources {
            Some(resources) => resources,
            None => estimate_resources(&request.request_type, request.payload_size()),
        };

        let id = request.id;
        let priority = request.priority;
        let request_type = request.request_type.clone();
        self.scheduler.enqueue(request);

        let (tx, rx) = oneshot::channel();
        self.waiters.entry(id).or_default().push(tx);
        if let Some(key) = key {
            self.inflight_keys.insert(key.clone(), id);
            self.request_keys.insert(id, key);
        }
        info!(request_id = %id, request_type = %request_type, priority = %priority, "request queued");
        Ok(RequestHandle::pending(id, Origin::Queued, rx))
    }

    pub(super) fn cancel(&mut self, id: RequestId, now: Instant) -> Result<bool, QueueError> {
        let status = self.scheduler.status(&id).ok_or(QueueError::NotFound(id))?;
        if status.is_terminal() {
            return Ok(false);
        }

        if self.scheduler.is_active(&id) {
            if !self.cancel_requested.insert(id) {
                return Ok(true);
            }
            let signalled = self.pools.iter().any(|pool| pool.cancel(id));
            if signalled {
                debug!(request_id = %id, "cancellation sent to unit");
            } else {
                // No unit holds it any more; settle here.
                self.settle(id, ExecutionOutcome::Cancelled, now);
            }
            return Ok(true);
        }

        if self.scheduler.remove(&id).is_some() {
            self.metrics.record_cancelled();
            self.forget_key(&id);
            self.resolve(&id, Err(QueueError::Cancelled));
            info!(request_id = %id, "request cancelled");
        }
        Ok(true)
    }
}

/// Guess what a request needs from its type family and payload size.
pub(crate) fn estimate_resources(request_type: &str, payload_bytes: usize) -> ResourceRequirements {
    let family = request_type.to_ascii_lowercase();
    let base = if family.starts_with("compute") || family.starts_with("cpu") {
        ResourceRequirements::default().with_cpu(1.0).with_memory(64 * MIB)
    } else if family.starts_with("io") || family.starts_with("fetch") {
        ResourceRequirements::default()
            .with_cpu(0.1)
            .with_network(1_000_000)
    } else if family.starts_with("llm") || family.contains("inference") {
        ResourceRequirements::default().with_cpu(0.5).with_memory(512 * MIB)
    } else {
        ResourceRequirements::default()
    };
    let floor = (payload_bytes as u64).saturating_mul(2).saturating_add(MIB);
    let memory = base.memory_bytes.max(floor);
    base.with_memory(memory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_get_their_heavy_dimension() {
        assert_eq!(estimate_resources("compute.hash", 10).cpu, 1.0);
        assert_eq!(estimate_resources("fetch_page", 10).network_bps, 1_000_000);
        assert_eq!(estimate_resources("llm", 10).memory_bytes, 512 * MIB);
        assert_eq!(estimate_resources("sum", 10), ResourceRequirements::default());
    }

    #[test]
    fn memory_scales_with_payload() {
        let req = estimate_resources("sum", 50 * MIB as usize);
        assert_eq!(req.memory_bytes, 101 * MIB);
    }
}
