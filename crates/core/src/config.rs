use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::request::Priority;

// ── Top-level config ──────────────────────────────────────────

/// Construction-time configuration for a queue manager, typically parsed
/// from TOML by the embedding application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub resources: ResourceSection,
    #[serde(default)]
    pub cache: CacheSection,
    /// Worker pools. Omitted entirely, a single pool named "default" is used.
    #[serde(default = "default_pools")]
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub scaling: ScalingSection,
    #[serde(default)]
    pub metrics: MetricsSection,
    #[serde(default)]
    pub balancer: BalancerSection,
}

fn default_pools() -> Vec<PoolConfig> { vec![PoolConfig::default()] }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue: QueueSection::default(),
            resources: ResourceSection::default(),
            cache: CacheSection::default(),
            pools: default_pools(),
            scaling: ScalingSection::default(),
            metrics: MetricsSection::default(),
            balancer: BalancerSection::default(),
        }
    }
}

impl QueueConfig {
    /// Check bounds and weights. Called by the manager before it starts.
    pub fn validate(&self) -> Result<(), CoreError> {
        self.validate_queue()?;
        self.validate_resources()?;
        self.validate_pools()?;
        self.validate_scaling()?;
        if self.cache.max_entries == 0 {
            return Err(CoreError::Config("cache.max_entries must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.metrics.ema_alpha) || self.metrics.ema_alpha == 0.0 {
            return Err(CoreError::Config(format!(
                "metrics.ema_alpha must be in (0, 1], got {}",
                self.metrics.ema_alpha
            )));
        }
        Ok(())
    }

    fn validate_queue(&self) -> Result<(), CoreError> {
        if self.queue.max_queue_size == 0 {
            return Err(CoreError::Config("queue.max_queue_size must be at least 1".into()));
        }
        if self.queue.dispatch_interval_ms == 0 {
            return Err(CoreError::Config("queue.dispatch_interval_ms must be at least 1".into()));
        }
        for (name, weight) in &self.queue.priority_weights {
            name.parse::<Priority>()?;
            if *weight < 0.0 {
                return Err(CoreError::Config(format!(
                    "queue.priority_weights.{name} must not be negative"
                )));
            }
        }
        Ok(())
    }

    fn validate_resources(&self) -> Result<(), CoreError> {
        let r = &self.resources;
        check_threshold_pair("resources.cpu", r.cpu_scale_up, r.cpu_scale_down)?;
        check_threshold_pair("resources.memory", r.memory_scale_up, r.memory_scale_down)?;
        if r.history_size == 0 {
            return Err(CoreError::Config("resources.history_size must be at least 1".into()));
        }
        if r.trend_window < 2 {
            return Err(CoreError::Config("resources.trend_window must be at least 2".into()));
        }
        Ok(())
    }

    fn validate_pools(&self) -> Result<(), CoreError> {
        if self.pools.is_empty() {
            return Err(CoreError::Config("at least one worker pool is required".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for pool in &self.pools {
            if !seen.insert(pool.name.as_str()) {
                return Err(CoreError::Config(format!("duplicate pool name '{}'", pool.name)));
            }
            if pool.max_workers == 0 {
                return Err(CoreError::Config(format!(
                    "pool '{}': max_workers must be at least 1",
                    pool.name
                )));
            }
            if pool.min_workers > pool.max_workers {
                return Err(CoreError::Config(format!(
                    "pool '{}': min_workers ({}) exceeds max_workers ({})",
                    pool.name, pool.min_workers, pool.max_workers
                )));
            }
            if pool.max_concurrent_requests == 0 {
                return Err(CoreError::Config(format!(
                    "pool '{}': max_concurrent_requests must be at least 1",
                    pool.name
                )));
            }
            if pool.weight <= 0.0 {
                return Err(CoreError::Config(format!(
                    "pool '{}': weight must be positive",
                    pool.name
                )));
            }
        }
        Ok(())
    }

    fn validate_scaling(&self) -> Result<(), CoreError> {
        let s = &self.scaling;
        let w = &s.weights;
        let parts = [w.cpu, w.memory, w.queue, w.latency];
        if parts.iter().any(|v| *v < 0.0) {
            return Err(CoreError::Config("scaling.weights must not be negative".into()));
        }
        if parts.iter().sum::<f64>() <= 0.0 {
            return Err(CoreError::Config("scaling.weights must not sum to zero".into()));
        }
        check_threshold_pair("scaling", s.scale_up_threshold, s.scale_down_threshold)?;
        if s.scale_up_factor <= 1.0 {
            return Err(CoreError::Config("scaling.scale_up_factor must exceed 1.0".into()));
        }
        if !(0.0..1.0).contains(&s.scale_down_factor) || s.scale_down_factor == 0.0 {
            return Err(CoreError::Config("scaling.scale_down_factor must be in (0, 1)".into()));
        }
        if s.predictor_lower_bound >= s.predictor_upper_bound {
            return Err(CoreError::Config(
                "scaling.predictor_lower_bound must be below predictor_upper_bound".into(),
            ));
        }
        Ok(())
    }
}

fn check_threshold_pair(section: &str, up: f64, down: f64) -> Result<(), CoreError> {
    if !(0.0..=1.0).contains(&up) || !(0.0..=1.0).contains(&down) {
        return Err(CoreError::Config(format!(
            "{section} thresholds must be within [0, 1] (up={up}, down={down})"
        )));
    }
    if up <= down {
        return Err(CoreError::Config(format!(
            "{section} scale-up threshold ({up}) must exceed scale-down threshold ({down})"
        )));
    }
    Ok(())
}

// ── Queue ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSection {
    /// Pending requests accepted before submissions are rejected.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Coordinator tick in milliseconds.
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    /// Per-attempt timeout when the submitter gives none.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Base of the exponential retry backoff.
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    /// Finished requests remembered for status lookups.
    #[serde(default = "default_completed_history")]
    pub completed_history: usize,
    /// Upper bound on dispatches per coordinator tick.
    #[serde(default = "default_max_dispatch_per_tick")]
    pub max_dispatch_per_tick: usize,
    /// Weight per priority name. Scales each pending request's share of
    /// the scaler's queue-pressure factor.
    #[serde(default = "default_priority_weights")]
    pub priority_weights: BTreeMap<String, f64>,
}

fn default_max_queue_size() -> usize { 1000 }
fn default_dispatch_interval_ms() -> u64 { 100 }
fn default_timeout_secs() -> u64 { 30 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_backoff_base_ms() -> u64 { 1000 }
fn default_completed_history() -> usize { 1000 }
fn default_max_dispatch_per_tick() -> usize { 32 }
fn default_priority_weights() -> BTreeMap<String, f64> {
    Priority::ALL
        .iter()
        .map(|p| (p.as_str().to_string(), (p.weight() + 1) as f64))
        .collect()
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            default_timeout_secs: default_timeout_secs(),
            default_max_retries: default_max_retries(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            completed_history: default_completed_history(),
            max_dispatch_per_tick: default_max_dispatch_per_tick(),
            priority_weights: default_priority_weights(),
        }
    }
}

impl QueueSection {
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    /// Weight for a priority; unknown names fall back to `weight() + 1`.
    pub fn weight_for(&self, priority: Priority) -> f64 {
        self.priority_weights
            .get(priority.as_str())
            .copied()
            .unwrap_or((priority.weight() + 1) as f64)
    }

    /// Weight relative to Normal, so a Normal request counts 1. With a
    /// zero Normal weight the raw weight is used.
    pub fn relative_weight(&self, priority: Priority) -> f64 {
        let normal = self.weight_for(Priority::Normal);
        if normal > 0.0 {
            self.weight_for(priority) / normal
        } else {
            self.weight_for(priority)
        }
    }
}

// ── Resources ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSection {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Snapshots kept for trend analysis.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_cpu_scale_up")]
    pub cpu_scale_up: f64,
    #[serde(default = "default_cpu_scale_down")]
    pub cpu_scale_down: f64,
    #[serde(default = "default_memory_scale_up")]
    pub memory_scale_up: f64,
    #[serde(default = "default_memory_scale_down")]
    pub memory_scale_down: f64,
    /// Samples used for the regression trend check.
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,
    #[serde(default = "default_memory_per_worker")]
    pub memory_per_worker: u64,
    /// Fixed capacity instead of probing the host.
    #[serde(default)]
    pub capacity_override: Option<CapacityOverride>,
}

/// Static host capacity used in place of `/proc` probing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityOverride {
    pub cpu_cores: usize,
    pub memory_bytes: u64,
    #[serde(default)]
    pub network_bps: u64,
    #[serde(default)]
    pub disk_bytes: u64,
}

fn default_sample_interval_ms() -> u64 { 5000 }
fn default_history_size() -> usize { 100 }
fn default_cpu_scale_up() -> f64 { 0.8 }
fn default_cpu_scale_down() -> f64 { 0.3 }
fn default_memory_scale_up() -> f64 { 0.85 }
fn default_memory_scale_down() -> f64 { 0.4 }
fn default_trend_window() -> usize { 10 }
fn default_memory_per_worker() -> u64 { 256 * 1024 * 1024 }

impl Default for ResourceSection {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            history_size: default_history_size(),
            cpu_scale_up: default_cpu_scale_up(),
            cpu_scale_down: default_cpu_scale_down(),
            memory_scale_up: default_memory_scale_up(),
            memory_scale_down: default_memory_scale_down(),
            trend_window: default_trend_window(),
            memory_per_worker: default_memory_per_worker(),
            capacity_override: None,
        }
    }
}

impl ResourceSection {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

// ── Cache ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Identical requests within this window are treated as one.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_cache_entries() -> usize { 1000 }
fn default_cache_ttl_secs() -> u64 { 300 }
fn default_dedup_window_secs() -> u64 { 60 }
fn default_sweep_interval_secs() -> u64 { 60 }

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
            default_ttl_secs: default_cache_ttl_secs(),
            dedup_window_secs: default_dedup_window_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheSection {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

// ── Pools ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_name")]
    pub name: String,
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Requests a single execution unit runs at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    /// A unit whose lifetime error count exceeds this is torn down and
    /// replaced.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_auto_scale_interval_secs")]
    pub auto_scale_interval_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Routing weight for the weighted balancer strategy.
    #[serde(default = "default_pool_weight")]
    pub weight: f64,
    /// Accepted request types. Empty accepts everything.
    #[serde(default)]
    pub request_types: Vec<String>,
    /// Enables the pool's own pending/busy auto-scale tick.
    #[serde(default = "default_true")]
    pub auto_scale: bool,
}

fn default_pool_name() -> String { "default".into() }
fn default_min_workers() -> usize { 1 }
fn default_max_workers() -> usize { 8 }
fn default_max_concurrent() -> usize { 4 }
fn default_error_threshold() -> u32 { 5 }
fn default_auto_scale_interval_secs() -> u64 { 10 }
fn default_idle_timeout_secs() -> u64 { 60 }
fn default_pool_weight() -> f64 { 1.0 }
fn default_true() -> bool { true }

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: default_pool_name(),
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            max_concurrent_requests: default_max_concurrent(),
            error_threshold: default_error_threshold(),
            auto_scale_interval_secs: default_auto_scale_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            weight: default_pool_weight(),
            request_types: Vec::new(),
            auto_scale: default_true(),
        }
    }
}

impl PoolConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn auto_scale_interval(&self) -> Duration {
        Duration::from_secs(self.auto_scale_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn accepts(&self, request_type: &str) -> bool {
        self.request_types.is_empty() || self.request_types.iter().any(|t| t == request_type)
    }

    pub fn clamp_size(&self, n: usize) -> usize {
        n.clamp(self.min_workers, self.max_workers)
    }
}

// ── Scaling ───────────────────────────────────────────────────

/// Weights of the four pressure factors in the scaling score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingWeights {
    #[serde(default = "default_w_cpu")]
    pub cpu: f64,
    #[serde(default = "default_w_memory")]
    pub memory: f64,
    #[serde(default = "default_w_queue")]
    pub queue: f64,
    #[serde(default = "default_w_latency")]
    pub latency: f64,
}

fn default_w_cpu() -> f64 { 0.3 }
fn default_w_memory() -> f64 { 0.3 }
fn default_w_queue() -> f64 { 0.2 }
fn default_w_latency() -> f64 { 0.2 }

impl Default for ScalingWeights {
    fn default() -> Self {
        Self {
            cpu: default_w_cpu(),
            memory: default_w_memory(),
            queue: default_w_queue(),
            latency: default_w_latency(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_evaluate_interval_secs")]
    pub evaluate_interval_secs: u64,
    /// Minimum gap between two scaling actions on the same pool.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub weights: ScalingWeights,
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: f64,
    #[serde(default = "default_scale_down_threshold")]
    pub scale_down_threshold: f64,
    #[serde(default = "default_scale_up_factor")]
    pub scale_up_factor: f64,
    #[serde(default = "default_scale_down_factor")]
    pub scale_down_factor: f64,
    /// Pending requests per worker considered full queue pressure.
    #[serde(default = "default_target_queue_per_worker")]
    pub target_queue_per_worker: f64,
    /// Average processing time considered full latency pressure.
    #[serde(default = "default_target_latency_ms")]
    pub target_latency_ms: f64,
    #[serde(default = "default_retrain_interval_secs")]
    pub retrain_interval_secs: u64,
    #[serde(default = "default_predictor_min_confidence")]
    pub predictor_min_confidence: f64,
    #[serde(default = "default_predictor_lower_bound")]
    pub predictor_lower_bound: f64,
    #[serde(default = "default_predictor_upper_bound")]
    pub predictor_upper_bound: f64,
    /// Scaling events retained for analysis.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

fn default_evaluate_interval_secs() -> u64 { 10 }
fn default_cooldown_secs() -> u64 { 30 }
fn default_scale_up_threshold() -> f64 { 0.8 }
fn default_scale_down_threshold() -> f64 { 0.3 }
fn default_scale_up_factor() -> f64 { 1.5 }
fn default_scale_down_factor() -> f64 { 0.8 }
fn default_target_queue_per_worker() -> f64 { 10.0 }
fn default_target_latency_ms() -> f64 { 1000.0 }
fn default_retrain_interval_secs() -> u64 { 3600 }
fn default_predictor_min_confidence() -> f64 { 0.6 }
fn default_predictor_lower_bound() -> f64 { 0.6 }
fn default_predictor_upper_bound() -> f64 { 1.2 }
fn default_max_events() -> usize { 500 }

impl Default for ScalingSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            evaluate_interval_secs: default_evaluate_interval_secs(),
            cooldown_secs: default_cooldown_secs(),
            weights: ScalingWeights::default(),
            scale_up_threshold: default_scale_up_threshold(),
            scale_down_threshold: default_scale_down_threshold(),
            scale_up_factor: default_scale_up_factor(),
            scale_down_factor: default_scale_down_factor(),
            target_queue_per_worker: default_target_queue_per_worker(),
            target_latency_ms: default_target_latency_ms(),
            retrain_interval_secs: default_retrain_interval_secs(),
            predictor_min_confidence: default_predictor_min_confidence(),
            predictor_lower_bound: default_predictor_lower_bound(),
            predictor_upper_bound: default_predictor_upper_bound(),
            max_events: default_max_events(),
        }
    }
}

impl ScalingSection {
    pub fn evaluate_interval(&self) -> Duration {
        Duration::from_secs(self.evaluate_interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn retrain_interval(&self) -> Duration {
        Duration::from_secs(self.retrain_interval_secs)
    }
}

// ── Metrics ───────────────────────────────────────────────────

/// Warning/critical levels for each health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    #[serde(default = "default_latency_warning_ms")]
    pub latency_warning_ms: f64,
    #[serde(default = "default_latency_critical_ms")]
    pub latency_critical_ms: f64,
    #[serde(default = "default_error_rate_warning")]
    pub error_rate_warning: f64,
    #[serde(default = "default_error_rate_critical")]
    pub error_rate_critical: f64,
    #[serde(default = "default_queue_length_warning")]
    pub queue_length_warning: usize,
    #[serde(default = "default_queue_length_critical")]
    pub queue_length_critical: usize,
    /// Requests/second below which throughput is flagged while work is queued.
    #[serde(default = "default_min_throughput")]
    pub min_throughput: f64,
    #[serde(default = "default_cpu_warning")]
    pub cpu_warning: f64,
    #[serde(default = "default_cpu_critical")]
    pub cpu_critical: f64,
    #[serde(default = "default_memory_warning")]
    pub memory_warning: f64,
    #[serde(default = "default_memory_critical")]
    pub memory_critical: f64,
}

fn default_latency_warning_ms() -> f64 { 5_000.0 }
fn default_latency_critical_ms() -> f64 { 15_000.0 }
fn default_error_rate_warning() -> f64 { 0.1 }
fn default_error_rate_critical() -> f64 { 0.25 }
fn default_queue_length_warning() -> usize { 100 }
fn default_queue_length_critical() -> usize { 500 }
fn default_min_throughput() -> f64 { 0.1 }
fn default_cpu_warning() -> f64 { 0.8 }
fn default_cpu_critical() -> f64 { 0.95 }
fn default_memory_warning() -> f64 { 0.85 }
fn default_memory_critical() -> f64 { 0.95 }

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            latency_warning_ms: default_latency_warning_ms(),
            latency_critical_ms: default_latency_critical_ms(),
            error_rate_warning: default_error_rate_warning(),
            error_rate_critical: default_error_rate_critical(),
            queue_length_warning: default_queue_length_warning(),
            queue_length_critical: default_queue_length_critical(),
            min_throughput: default_min_throughput(),
            cpu_warning: default_cpu_warning(),
            cpu_critical: default_cpu_critical(),
            memory_warning: default_memory_warning(),
            memory_critical: default_memory_critical(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSection {
    #[serde(default = "default_metrics_history")]
    pub history_size: usize,
    /// Samples in the rolling analytics window.
    #[serde(default = "default_analytics_window")]
    pub analytics_window: usize,
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    #[serde(default = "default_emit_interval_secs")]
    pub emit_interval_secs: u64,
    /// Window over which throughput is measured.
    #[serde(default = "default_throughput_window_secs")]
    pub throughput_window_secs: u64,
    #[serde(default)]
    pub alerts: AlertThresholds,
}

fn default_metrics_history() -> usize { 1000 }
fn default_analytics_window() -> usize { 100 }
fn default_ema_alpha() -> f64 { 0.1 }
fn default_emit_interval_secs() -> u64 { 5 }
fn default_throughput_window_secs() -> u64 { 60 }

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            history_size: default_metrics_history(),
            analytics_window: default_analytics_window(),
            ema_alpha: default_ema_alpha(),
            emit_interval_secs: default_emit_interval_secs(),
            throughput_window_secs: default_throughput_window_secs(),
            alerts: AlertThresholds::default(),
        }
    }
}

impl MetricsSection {
    pub fn emit_interval(&self) -> Duration {
        Duration::from_secs(self.emit_interval_secs)
    }

    pub fn throughput_window(&self) -> Duration {
        Duration::from_secs(self.throughput_window_secs.max(1))
    }
}

// ── Balancer ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerStrategy {
    RoundRobin,
    #[default]
    LeastLoaded,
    Weighted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalancerSection {
    #[serde(default)]
    pub strategy: BalancerStrategy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = QueueConfig::default();
        config.validate().unwrap();
        assert_eq!(config.queue.dispatch_interval(), Duration::from_millis(100));
        assert_eq!(config.cache.dedup_window(), Duration::from_secs(60));
        assert_eq!(config.scaling.cooldown(), Duration::from_secs(30));
    }

    #[test]
    fn empty_toml_fills_every_section() {
        let config: QueueConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.pools.len(), 1);
        assert_eq!(config.pools[0].name, "default");
        assert_eq!(config.resources.history_size, 100);
        assert_eq!(config.balancer.strategy, BalancerStrategy::LeastLoaded);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_min_above_max() {
        let mut config: QueueConfig = serde_json::from_str("{}").unwrap();
        config.pools[0].min_workers = 10;
        config.pools[0].max_workers = 2;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds max_workers"));
    }

    #[test]
    fn rejects_zero_weights() {
        let mut config: QueueConfig = serde_json::from_str("{}").unwrap();
        config.scaling.weights = ScalingWeights {
            cpu: 0.0,
            memory: 0.0,
            queue: 0.0,
            latency: 0.0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config: QueueConfig = serde_json::from_str("{}").unwrap();
        config.resources.cpu_scale_up = 0.2;
        config.resources.cpu_scale_down = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_priority_weight() {
        let mut config: QueueConfig = serde_json::from_str("{}").unwrap();
        config.queue.priority_weights.insert("urgent".into(), 2.0);
        assert!(matches!(config.validate(), Err(CoreError::UnknownPriority(_))));
    }

    #[test]
    fn relative_weight_is_normalised_to_normal() {
        let mut queue = QueueSection::default();
        assert_eq!(queue.relative_weight(Priority::Normal), 1.0);
        assert!((queue.relative_weight(Priority::Critical) - 5.0 / 3.0).abs() < 1e-9);

        queue.priority_weights.insert("normal".into(), 0.0);
        assert_eq!(queue.relative_weight(Priority::Critical), 5.0);
    }

    #[test]
    fn pool_accepts_types() {
        let mut pool = PoolConfig::named("io");
        assert!(pool.accepts("anything"));
        pool.request_types = vec!["fetch".into()];
        assert!(pool.accepts("fetch"));
        assert!(!pool.accepts("sum"));
        assert_eq!(pool.clamp_size(100), pool.max_workers);
    }
}
