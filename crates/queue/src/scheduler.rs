//! Priority scheduler: per-priority FIFO queues with dependency- and
//! resource-gated dequeue, retry parking and a bounded completed map.
//!
//! A request id lives in exactly one of: a pending queue, the retry
//! parking list, the active set, or the completed map.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_core::{Priority, Request, RequestId, RequestStatus, ResourceBudget};
use tracing::{debug, warn};

use crate::error::QueueError;

/// What happened to a request handed to [`PriorityScheduler::fail_at`].
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Parked for retry; re-enters its queue after `delay`.
    Retrying { delay: Duration, retry_count: u32 },
    /// Retries exhausted or the error is not retryable.
    Failed,
}

/// Read-only view of a request for status queries and hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub id: RequestId,
    pub request_type: String,
    pub priority: Priority,
    pub status: RequestStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Position in dequeue order while pending.
    pub queue_position: Option<usize>,
}

impl RequestInfo {
    pub fn from_request(req: &Request) -> Self {
        Self {
            id: req.id,
            request_type: req.request_type.clone(),
            priority: req.priority,
            status: req.status(),
            retry_count: req.retry.retry_count,
            max_retries: req.retry.max_retries,
            last_error: req.retry.last_error.clone(),
            created_at: req.created_at,
            scheduled_at: req.scheduled_at,
            started_at: req.started_at,
            completed_at: req.completed_at,
            queue_position: None,
        }
    }
}

struct Parked {
    due: Instant,
    request: Request,
}

pub struct PriorityScheduler {
    /// Indexed by [`Priority::rank`]; index 0 is Critical.
    queues: [VecDeque<Request>; 5],
    active: HashMap<RequestId, Request>,
    retrying: Vec<Parked>,
    completed: HashMap<RequestId, Request>,
    completed_order: VecDeque<RequestId>,
    completed_limit: usize,
    active_by_type: HashMap<String, u32>,
    backoff_base: Duration,
}

impl PriorityScheduler {
    pub fn new(backoff_base: Duration, completed_limit: usize) -> Self {
        Self {
            queues: Default::default(),
            active: HashMap::new(),
            retrying: Vec::new(),
            completed: HashMap::new(),
            completed_order: VecDeque::new(),
            completed_limit: completed_limit.max(1),
            active_by_type: HashMap::new(),
            backoff_base,
        }
    }

    // ── Admission ─────────────────────────────────────────────

    /// Append to the tail of the request's priority queue. Returns `false`
    /// if the id is already known to the scheduler.
    pub fn enqueue(&mut self, mut request: Request) -> bool {
        if self.contains(&request.id) {
            warn!(request_id = %request.id, "duplicate enqueue ignored");
            return false;
        }
        if request.status() != RequestStatus::Pending {
            warn!(request_id = %request.id, status = %request.status(), "only pending requests can be enqueued");
            return false;
        }
        request.scheduled_at = Some(Utc::now());
        debug!(request_id = %request.id, priority = %request.priority, "enqueued");
        self.queues[request.priority.rank()].push_back(request);
        true
    }

    // ── Dequeue ───────────────────────────────────────────────

    /// Take the first eligible request: highest priority first, FIFO within
    /// a level, skipping requests whose dependencies are in flight or whose
    /// requirement does not fit `available`.
    pub fn dequeue(&mut self, available: &ResourceBudget) -> Option<Request> {
        self.dequeue_with(available, |_| true)
    }

    /// Like [`dequeue`](Self::dequeue) with an extra caller predicate,
    /// evaluated last, so a request is only removed once the caller has
    /// somewhere to run it.
    pub fn dequeue_with<F>(&mut self, available: &ResourceBudget, mut accept: F) -> Option<Request>
    where
        F: FnMut(&Request) -> bool,
    {
        let mut found = None;
        'levels: for (level, queue) in self.queues.iter().enumerate() {
            for (idx, req) in queue.iter().enumerate() {
                if req.dependencies.iter().any(|dep| self.active.contains_key(dep)) {
                    continue;
                }
                if !available.fits(&req.resources) {
                    continue;
                }
                if let Some(limit) = req.resources.max_concurrency {
                    let running = self.active_by_type.get(&req.request_type).copied().unwrap_or(0);
                    if running >= limit {
                        continue;
                    }
                }
                if !accept(req) {
                    continue;
                }
                found = Some((level, idx));
                break 'levels;
            }
        }

        let (level, idx) = found?;
        let mut request = self.queues[level].remove(idx)?;
        if let Err(e) = request.transition(RequestStatus::Processing) {
            warn!(request_id = %request.id, error = %e, "queued request in unexpected state");
            self.queues[level].insert(idx, request);
            return None;
        }
        request.started_at = Some(Utc::now());
        request.completed_at = None;
        *self.active_by_type.entry(request.request_type.clone()).or_insert(0) += 1;
        self.active.insert(request.id, request.clone());
        Some(request)
    }

    // ── Settlement ────────────────────────────────────────────

    /// Move an active request to Completed.
    pub fn complete(&mut self, id: &RequestId) -> Option<Request> {
        let mut request = self.take_active(id)?;
        if let Err(e) = request.transition(RequestStatus::Completed) {
            warn!(request_id = %id, error = %e, "complete on request in unexpected state");
        }
        request.completed_at = Some(Utc::now());
        self.remember(request.clone());
        Some(request)
    }

    /// Record a pending request that was answered without running (a
    /// cache hit) straight into the completed map, so its id resolves like
    /// any other settled request.
    pub fn record_served(&mut self, mut request: Request) -> bool {
        if self.contains(&request.id) {
            return false;
        }
        if request.transition(RequestStatus::Processing).is_err()
            || request.transition(RequestStatus::Completed).is_err()
        {
            warn!(request_id = %request.id, status = %request.status(), "only pending requests can be served");
            return false;
        }
        let now = Utc::now();
        request.scheduled_at = Some(now);
        request.started_at = Some(now);
        request.completed_at = Some(now);
        self.remember(request);
        true
    }

    pub fn fail(&mut self, id: &RequestId, error: &QueueError) -> Option<FailOutcome> {
        self.fail_at(id, error, Instant::now())
    }

    /// Record a failed attempt. Retryable errors with retries left are
    /// parked for `base * 2^retry_count` (count after increment); anything
    /// else becomes terminal.
    pub fn fail_at(&mut self, id: &RequestId, error: &QueueError, now: Instant) -> Option<FailOutcome> {
        let mut request = self.take_active(id)?;
        let _ = request.transition(RequestStatus::Failed);
        request.completed_at = Some(Utc::now());
        request.retry.last_error = Some(error.to_string());

        if error.is_retryable() && request.retry.has_retries_left() {
            request.retry.retry_count += 1;
            let _ = request.transition(RequestStatus::Retrying);
            let delay = request.retry.backoff_delay(self.backoff_base);
            let retry_count = request.retry.retry_count;
            debug!(request_id = %id, retry_count, ?delay, "parked for retry");
            self.retrying.push(Parked {
                due: now + delay,
                request,
            });
            return Some(FailOutcome::Retrying { delay, retry_count });
        }

        self.remember(request);
        Some(FailOutcome::Failed)
    }

    /// Re-enqueue parked requests whose backoff has elapsed, earliest due
    /// first. Returns the promoted ids.
    pub fn promote_due(&mut self, now: Instant) -> Vec<RequestId> {
        if self.retrying.is_empty() {
            return Vec::new();
        }
        let (mut due, waiting): (Vec<Parked>, Vec<Parked>) =
            self.retrying.drain(..).partition(|p| p.due <= now);
        self.retrying = waiting;
        due.sort_by_key(|p| p.due);

        let mut promoted = Vec::with_capacity(due.len());
        for Parked { mut request, .. } in due {
            if request.transition(RequestStatus::Pending).is_err() {
                continue;
            }
            request.started_at = None;
            request.scheduled_at = Some(Utc::now());
            promoted.push(request.id);
            self.queues[request.priority.rank()].push_back(request);
        }
        promoted
    }

    /// Earliest retry due time, if anything is parked.
    pub fn next_retry_due(&self) -> Option<Instant> {
        self.retrying.iter().map(|p| p.due).min()
    }

    /// Cancel a request wherever it is. Terminal requests are left alone
    /// and yield `None`.
    pub fn remove(&mut self, id: &RequestId) -> Option<Request> {
        let mut request = if let Some(r) = self.take_pending(id) {
            r
        } else if let Some(pos) = self.retrying.iter().position(|p| &p.request.id == id) {
            self.retrying.swap_remove(pos).request
        } else {
            self.take_active(id)?
        };
        if let Err(e) = request.transition(RequestStatus::Cancelled) {
            warn!(request_id = %id, error = %e, "cancel on request in unexpected state");
        }
        request.completed_at = Some(Utc::now());
        self.remember(request.clone());
        debug!(request_id = %id, "removed");
        Some(request)
    }

    /// Drain every queued and parked request (used on shutdown).
    pub fn drain_waiting(&mut self) -> Vec<Request> {
        let mut out: Vec<Request> = self.queues.iter_mut().flat_map(|q| q.drain(..)).collect();
        out.extend(self.retrying.drain(..).map(|p| p.request));
        out
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn contains(&self, id: &RequestId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &RequestId) -> Option<&Request> {
        self.active
            .get(id)
            .or_else(|| self.queues.iter().flat_map(|q| q.iter()).find(|r| &r.id == id))
            .or_else(|| self.retrying.iter().map(|p| &p.request).find(|r| &r.id == id))
            .or_else(|| self.completed.get(id))
    }

    pub fn status(&self, id: &RequestId) -> Option<RequestStatus> {
        self.get(id).map(Request::status)
    }

    pub fn info(&self, id: &RequestId) -> Option<RequestInfo> {
        let mut info = RequestInfo::from_request(self.get(id)?);
        info.queue_position = self.position(id);
        Some(info)
    }

    /// Zero-based position in dequeue order, ignoring eligibility.
    pub fn position(&self, id: &RequestId) -> Option<usize> {
        let mut offset = 0;
        for queue in &self.queues {
            if let Some(idx) = queue.iter().position(|r| &r.id == id) {
                return Some(offset + idx);
            }
            offset += queue.len();
        }
        None
    }

    pub fn pending_len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn pending_by_priority(&self) -> Vec<(Priority, usize)> {
        Priority::ALL
            .iter()
            .map(|p| (*p, self.queues[p.rank()].len()))
            .collect()
    }

    /// Pending count with each request scaled by `weight(priority)`.
    pub fn weighted_pending<F>(&self, weight: F) -> f64
    where
        F: Fn(Priority) -> f64,
    {
        Priority::ALL
            .iter()
            .map(|p| self.queues[p.rank()].len() as f64 * weight(*p))
            .sum()
    }

    pub fn retrying_len(&self) -> usize {
        self.retrying.len()
    }

    /// Pending plus parked; what counts against queue capacity.
    pub fn waiting_len(&self) -> usize {
        self.pending_len() + self.retrying_len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn active_ids(&self) -> Vec<RequestId> {
        self.active.keys().copied().collect()
    }

    pub fn is_active(&self, id: &RequestId) -> bool {
        self.active.contains_key(id)
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    // ── Internals ─────────────────────────────────────────────

    fn take_active(&mut self, id: &RequestId) -> Option<Request> {
        let request = self.active.remove(id)?;
        if let Some(n) = self.active_by_type.get_mut(&request.request_type) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.active_by_type.remove(&request.request_type);
            }
        }
        Some(request)
    }

    fn take_pending(&mut self, id: &RequestId) -> Option<Request> {
        for queue in &mut self.queues {
            if let Some(idx) = queue.iter().position(|r| &r.id == id) {
                return queue.remove(idx);
            }
        }
        None
    }

    fn remember(&mut self, request: Request) {
        let id = request.id;
        if self.completed.insert(id, request).is_none() {
            self.completed_order.push_back(id);
        }
        while self.completed_order.len() > self.completed_limit {
            if let Some(old) = self.completed_order.pop_front() {
                self.completed.remove(&old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sluice_core::ResourceRequirements;

    fn req(name: &str, priority: Priority) -> Request {
        Request::new(name, json!(null))
            .with_priority(priority)
            .with_resources(ResourceRequirements::none().with_cpu(1.0))
    }

    fn scheduler() -> PriorityScheduler {
        PriorityScheduler::new(Duration::from_secs(1), 100)
    }

    fn one_core() -> ResourceBudget {
        ResourceBudget {
            cpu: 1.0,
            memory_bytes: u64::MAX,
            network_bps: u64::MAX,
            disk_bytes: u64::MAX,
        }
    }

    #[test]
    fn critical_then_fifo_normals() {
        let mut s = scheduler();
        let a = req("a", Priority::Normal);
        let b = req("b", Priority::Normal);
        let c = req("c", Priority::Critical);
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        s.enqueue(a);
        s.enqueue(b);
        s.enqueue(c);

        let budget = one_core();
        let first = s.dequeue(&budget).unwrap();
        assert_eq!(first.id, c_id);
        s.complete(&c_id);
        let second = s.dequeue(&budget).unwrap();
        assert_eq!(second.id, a_id);
        s.complete(&a_id);
        let third = s.dequeue(&budget).unwrap();
        assert_eq!(third.id, b_id);
        assert!(s.dequeue(&budget).is_none());
    }

    #[test]
    fn interleaved_priorities_keep_order() {
        let mut s = scheduler();
        let order = [
            Priority::Low,
            Priority::High,
            Priority::Background,
            Priority::High,
            Priority::Critical,
            Priority::Low,
        ];
        let mut expected: Vec<(Priority, usize, RequestId)> = Vec::new();
        for (seq, p) in order.iter().enumerate() {
            let r = req("x", *p);
            expected.push((*p, seq, r.id));
            s.enqueue(r);
        }
        expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let budget = ResourceBudget::unlimited();
        let got: Vec<RequestId> = std::iter::from_fn(|| s.dequeue(&budget).map(|r| r.id)).collect();
        let want: Vec<RequestId> = expected.into_iter().map(|e| e.2).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn skips_requests_that_do_not_fit() {
        let mut s = scheduler();
        let big = req("big", Priority::High).with_resources(ResourceRequirements::none().with_cpu(4.0));
        let small = req("small", Priority::Normal);
        let small_id = small.id;
        s.enqueue(big);
        s.enqueue(small);
        let got = s.dequeue(&one_core()).unwrap();
        assert_eq!(got.id, small_id);
        assert_eq!(s.pending_len(), 1);
    }

    #[test]
    fn dependency_blocks_while_active() {
        let mut s = scheduler();
        let parent = req("parent", Priority::Normal);
        let parent_id = parent.id;
        let child = req("child", Priority::Critical).with_dependency(parent_id);
        s.enqueue(parent);
        let budget = ResourceBudget::unlimited();
        assert_eq!(s.dequeue(&budget).unwrap().id, parent_id);

        let child_id = child.id;
        s.enqueue(child);
        assert!(s.dequeue(&budget).is_none());
        s.complete(&parent_id);
        assert_eq!(s.dequeue(&budget).unwrap().id, child_id);
    }

    #[test]
    fn served_request_is_completed_and_never_queued() {
        let mut s = scheduler();
        let served = req("sum", Priority::Normal);
        let id = served.id;
        assert!(s.record_served(served));
        assert_eq!(s.status(&id), Some(RequestStatus::Completed));
        assert_eq!(s.pending_len(), 0);
        assert!(!s.is_active(&id));

        let again = s.get(&id).cloned().unwrap();
        assert!(!s.record_served(again));
        assert_eq!(s.completed_len(), 1);
    }

    #[test]
    fn weighted_pending_scales_each_level() {
        let mut s = scheduler();
        s.enqueue(req("a", Priority::Critical));
        s.enqueue(req("b", Priority::Normal));
        s.enqueue(req("c", Priority::Normal));
        assert_eq!(s.weighted_pending(|_| 1.0), 3.0);
        let critical_heavy = |p: Priority| if p == Priority::Critical { 4.0 } else { 1.0 };
        assert_eq!(s.weighted_pending(critical_heavy), 6.0);
    }

    #[test]
    fn unknown_dependency_does_not_block() {
        let mut s = scheduler();
        let child = req("child", Priority::Normal).with_dependency(RequestId::new());
        let child_id = child.id;
        s.enqueue(child);
        assert_eq!(s.dequeue(&ResourceBudget::unlimited()).unwrap().id, child_id);
    }

    #[test]
    fn per_type_concurrency_gate() {
        let mut s = scheduler();
        let limited = |p| req("gpu", p).with_resources(ResourceRequirements::none().with_max_concurrency(1));
        s.enqueue(limited(Priority::Normal));
        s.enqueue(limited(Priority::Normal));
        let budget = ResourceBudget::unlimited();
        let first = s.dequeue(&budget).unwrap();
        assert!(s.dequeue(&budget).is_none());
        s.complete(&first.id);
        assert!(s.dequeue(&budget).is_some());
    }

    #[test]
    fn accept_predicate_leaves_request_queued() {
        let mut s = scheduler();
        s.enqueue(req("a", Priority::Normal));
        assert!(s.dequeue_with(&ResourceBudget::unlimited(), |_| false).is_none());
        assert_eq!(s.pending_len(), 1);
        assert_eq!(s.active_len(), 0);
    }

    #[test]
    fn retry_backoff_doubles_and_promotes() {
        let mut s = scheduler();
        let r = req("flaky", Priority::Normal).with_retry(3, Duration::from_secs(5));
        let id = r.id;
        s.enqueue(r);
        let t0 = Instant::now();
        let budget = ResourceBudget::unlimited();

        s.dequeue(&budget).unwrap();
        let out = s.fail_at(&id, &QueueError::Execution("boom".into()), t0).unwrap();
        assert_eq!(
            out,
            FailOutcome::Retrying {
                delay: Duration::from_secs(2),
                retry_count: 1
            }
        );
        assert_eq!(s.status(&id), Some(RequestStatus::Retrying));
        assert!(s.promote_due(t0 + Duration::from_millis(1999)).is_empty());
        assert_eq!(s.promote_due(t0 + Duration::from_secs(2)), vec![id]);
        assert_eq!(s.status(&id), Some(RequestStatus::Pending));

        s.dequeue(&budget).unwrap();
        let t1 = t0 + Duration::from_secs(2);
        let out = s.fail_at(&id, &QueueError::Timeout(Duration::from_secs(5)), t1).unwrap();
        assert_eq!(
            out,
            FailOutcome::Retrying {
                delay: Duration::from_secs(4),
                retry_count: 2
            }
        );
        assert_eq!(s.next_retry_due(), Some(t1 + Duration::from_secs(4)));
    }

    #[test]
    fn retries_exhaust_to_failed() {
        let mut s = scheduler();
        let r = req("flaky", Priority::Normal).with_retry(1, Duration::from_secs(5));
        let id = r.id;
        s.enqueue(r);
        let budget = ResourceBudget::unlimited();
        let now = Instant::now();
        let err = QueueError::Execution("boom".into());

        s.dequeue(&budget).unwrap();
        assert!(matches!(s.fail_at(&id, &err, now), Some(FailOutcome::Retrying { .. })));
        s.promote_due(now + Duration::from_secs(60));
        s.dequeue(&budget).unwrap();
        assert_eq!(s.fail_at(&id, &err, now), Some(FailOutcome::Failed));
        assert_eq!(s.status(&id), Some(RequestStatus::Failed));
        let info = s.info(&id).unwrap();
        assert_eq!(info.retry_count, 1);
        assert_eq!(info.last_error.as_deref(), Some("execution failed: boom"));
    }

    #[test]
    fn non_retryable_error_is_terminal() {
        let mut s = scheduler();
        let r = req("x", Priority::Normal);
        let id = r.id;
        s.enqueue(r);
        s.dequeue(&ResourceBudget::unlimited()).unwrap();
        let out = s.fail(&id, &QueueError::NoHandler("x".into()));
        assert_eq!(out, Some(FailOutcome::Failed));
    }

    #[test]
    fn remove_pending_and_active() {
        let mut s = scheduler();
        let a = req("a", Priority::Normal);
        let b = req("b", Priority::Normal);
        let (a_id, b_id) = (a.id, b.id);
        s.enqueue(a);
        s.enqueue(b);

        let removed = s.remove(&b_id).unwrap();
        assert_eq!(removed.status(), RequestStatus::Cancelled);
        assert_eq!(s.pending_len(), 1);

        s.dequeue(&ResourceBudget::unlimited()).unwrap();
        assert!(s.is_active(&a_id));
        s.remove(&a_id).unwrap();
        assert_eq!(s.active_len(), 0);
        assert_eq!(s.status(&a_id), Some(RequestStatus::Cancelled));
        assert!(s.remove(&a_id).is_none());
    }

    #[test]
    fn completed_map_is_bounded() {
        let mut s = PriorityScheduler::new(Duration::from_secs(1), 2);
        let budget = ResourceBudget::unlimited();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let r = req("x", Priority::Normal);
            ids.push(r.id);
            s.enqueue(r);
            let r = s.dequeue(&budget).unwrap();
            s.complete(&r.id);
        }
        assert_eq!(s.completed_len(), 2);
        assert!(s.status(&ids[0]).is_none());
        assert_eq!(s.status(&ids[2]), Some(RequestStatus::Completed));
    }

    #[test]
    fn duplicate_enqueue_is_rejected() {
        let mut s = scheduler();
        let r = req("a", Priority::Normal);
        assert!(s.enqueue(r.clone()));
        assert!(!s.enqueue(r));
        assert_eq!(s.pending_len(), 1);
    }
}
