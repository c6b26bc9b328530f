//! Request model: identity, priority, lifecycle status and retry state.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;
use crate::resource::ResourceRequirements;

// ── Identity ──────────────────────────────────────────────────

/// Unique request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| CoreError::InvalidId(s.to_string()))
    }
}

// ── Priority ──────────────────────────────────────────────────

/// Scheduling priority. Higher variants are always dequeued first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Runs only when nothing else is waiting.
    Background = 0,
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    /// User-facing work that must not wait behind anything.
    Critical = 4,
}

impl Priority {
    /// All levels, highest first (dequeue scan order).
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    /// Numeric weight (Background = 0 .. Critical = 4).
    pub fn weight(self) -> u8 {
        self as u8
    }

    /// Position in [`Priority::ALL`]; 0 is the highest level.
    pub fn rank(self) -> usize {
        (Priority::Critical as usize) - (self as usize)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Background => "background",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "background" => Ok(Priority::Background),
            other => Err(CoreError::UnknownPriority(other.to_string())),
        }
    }
}

// ── Status ────────────────────────────────────────────────────

/// Lifecycle status of a request.
///
/// ```text
/// Pending -> Processing -> Completed | Failed
/// Failed -> Retrying -> Pending        (retries remain)
/// Pending | Processing | Retrying -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl RequestStatus {
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Retrying)
                | (Retrying, Pending)
                | (Pending, Cancelled)
                | (Processing, Cancelled)
                | (Retrying, Cancelled)
        )
    }

    /// Completed, Cancelled and Failed (once retries are exhausted) are final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Retrying => "retrying",
            RequestStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Retry / cache directives ──────────────────────────────────

/// Retry bookkeeping carried by each request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    /// Retries already consumed.
    pub retry_count: u32,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Per-attempt execution timeout.
    pub timeout: Duration,
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn new(max_retries: u32, timeout: Duration) -> Self {
        Self {
            retry_count: 0,
            max_retries,
            timeout,
            last_error: None,
        }
    }

    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Backoff before the next attempt: `base * 2^retry_count`.
    pub fn backoff_delay(&self, base: Duration) -> Duration {
        let factor = 1u32.checked_shl(self.retry_count.min(20)).unwrap_or(u32::MAX);
        base.saturating_mul(factor)
    }
}

/// Whether and how a request's result may be cached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheDirective {
    pub cacheable: bool,
    /// Explicit key; when absent the key is derived from type + payload.
    pub key: Option<String>,
    pub ttl: Option<Duration>,
}

// ── Request ───────────────────────────────────────────────────

/// The unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub request_type: String,
    pub priority: Priority,
    pub payload: Value,
    pub resources: ResourceRequirements,
    /// Requests that must not be in flight while this one runs.
    pub dependencies: HashSet<RequestId>,
    pub retry: RetryState,
    pub cache: CacheDirective,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    status: RequestStatus,
}

impl Request {
    pub fn new(request_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: RequestId::new(),
            request_type: request_type.into(),
            priority: Priority::Normal,
            payload,
            resources: ResourceRequirements::default(),
            dependencies: HashSet::new(),
            retry: RetryState::new(3, Duration::from_secs(30)),
            cache: CacheDirective::default(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            status: RequestStatus::Pending,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_dependency(mut self, id: RequestId) -> Self {
        self.dependencies.insert(id);
        self
    }

    pub fn with_retry(mut self, max_retries: u32, timeout: Duration) -> Self {
        self.retry = RetryState::new(max_retries, timeout);
        self
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Move to `next`, rejecting edges the state machine does not allow.
    pub fn transition(&mut self, next: RequestStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Time spent queued before the current attempt started.
    pub fn wait_time(&self) -> Option<Duration> {
        let started = self.started_at?;
        (started - self.created_at).to_std().ok()
    }

    /// Wall time of the last attempt, if it has finished.
    pub fn processing_time(&self) -> Option<Duration> {
        let (started, done) = (self.started_at?, self.completed_at?);
        (done - started).to_std().ok()
    }

    /// Serialized payload size in bytes (used for resource estimation).
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(&self.payload).map(|v| v.len()).unwrap_or(0)
    }
}

// ── Submission options ────────────────────────────────────────

/// Caller-supplied options for a submission. Unset fields fall back to
/// the queue configuration defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitOptions {
    pub priority: Option<Priority>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub dependencies: Vec<RequestId>,
    #[serde(default)]
    pub cacheable: bool,
    pub cache_key: Option<String>,
    pub cache_ttl: Option<Duration>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Overrides the estimated resource requirement.
    pub resources: Option<ResourceRequirements>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn depends_on(mut self, id: RequestId) -> Self {
        self.dependencies.push(id);
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cacheable = true;
        self.cache_key = Some(key.into());
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = Some(resources);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert!(Priority::Low > Priority::Background);
        assert_eq!(Priority::ALL[0], Priority::Critical);
        assert_eq!(Priority::Critical.rank(), 0);
        assert_eq!(Priority::Background.rank(), 4);
    }

    #[test]
    fn priority_defaults_to_normal() {
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!(SubmitOptions::new().priority.unwrap_or_default(), Priority::Normal);
    }

    #[test]
    fn priority_parse() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!(" background ".parse::<Priority>().unwrap(), Priority::Background);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn status_machine_edges() {
        use RequestStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Pending));
        assert!(Retrying.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Cancelled.can_transition_to(Processing));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut req = Request::new("sum", json!([1, 2, 3]));
        assert_eq!(req.status(), RequestStatus::Pending);
        let err = req.transition(RequestStatus::Completed).unwrap_err();
        assert!(matches!(err, CoreError::IllegalTransition { .. }));
        req.transition(RequestStatus::Processing).unwrap();
        req.transition(RequestStatus::Completed).unwrap();
        assert!(req.status().is_terminal());
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let mut retry = RetryState::new(5, Duration::from_secs(30));
        let base = Duration::from_secs(1);
        assert_eq!(retry.backoff_delay(base), Duration::from_secs(1));
        retry.retry_count = 1;
        assert_eq!(retry.backoff_delay(base), Duration::from_secs(2));
        retry.retry_count = 3;
        assert_eq!(retry.backoff_delay(base), Duration::from_secs(8));
    }

    #[test]
    fn request_id_roundtrip_display() {
        let id = RequestId::new();
        let parsed: RequestId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<RequestId>().is_err());
    }

    #[test]
    fn submit_options_builder() {
        let dep = RequestId::new();
        let opts = SubmitOptions::new()
            .priority(Priority::High)
            .cache_key("k1")
            .depends_on(dep)
            .metadata("tenant", "a");
        assert_eq!(opts.priority, Some(Priority::High));
        assert!(opts.cacheable);
        assert_eq!(opts.cache_key.as_deref(), Some("k1"));
        assert_eq!(opts.dependencies, vec![dep]);
        assert_eq!(opts.metadata["tenant"], "a");
    }
}
