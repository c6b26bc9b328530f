//! Queue metrics: counters, moving averages, health classification,
//! alerting and rolling-window analytics.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_core::{AlertThresholds, MetricsSection};
use tracing::{info, warn};

use crate::stats::{ema, linear_fit, mean, percentile, RingBuffer};

// ── Snapshot types ────────────────────────────────────────────

/// Monotonic counters since construction (or the last restore).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricCounters {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub timeouts: u64,
    pub rejected: u64,
    pub cache_hits: u64,
    pub deduplicated: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueHealth {
    Healthy,
    Degraded,
    Critical,
}

impl fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueHealth::Healthy => "healthy",
            QueueHealth::Degraded => "degraded",
            QueueHealth::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A failed health check. Each maps to one recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthIssue {
    HighLatency,
    HighErrorRate,
    LongQueue,
    LowThroughput,
    HighCpu,
    HighMemory,
}

impl HealthIssue {
    pub fn name(self) -> &'static str {
        match self {
            HealthIssue::HighLatency => "high_latency",
            HealthIssue::HighErrorRate => "high_error_rate",
            HealthIssue::LongQueue => "long_queue",
            HealthIssue::LowThroughput => "low_throughput",
            HealthIssue::HighCpu => "high_cpu",
            HealthIssue::HighMemory => "high_memory",
        }
    }

    pub fn recommendation(self) -> &'static str {
        match self {
            HealthIssue::HighLatency => {
                "Processing latency is high: add workers or reduce per-request work"
            }
            HealthIssue::HighErrorRate => {
                "Error rate is high: inspect handler failures and upstream dependencies"
            }
            HealthIssue::LongQueue => {
                "Queue is backing up: raise max_workers or shed low-priority load"
            }
            HealthIssue::LowThroughput => {
                "Throughput is low while work is queued: check for stuck workers or resource starvation"
            }
            HealthIssue::HighCpu => "CPU is saturated: lower concurrency or move work off this host",
            HealthIssue::HighMemory => {
                "Memory is nearly exhausted: reduce cache size or per-request memory"
            }
        }
    }
}

/// Live metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub timestamp: DateTime<Utc>,
    pub counters: MetricCounters,
    pub pending: usize,
    pub processing: usize,
    pub retrying: usize,
    pub workers: usize,
    /// EMA of queue wait, milliseconds.
    pub avg_wait_ms: f64,
    /// EMA of execution time, milliseconds.
    pub avg_processing_ms: f64,
    /// Completions per second over the throughput window.
    pub throughput: f64,
    /// Terminal failures / (completions + terminal failures) over the window.
    pub error_rate: f64,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub health: QueueHealth,
    pub issues: Vec<HealthIssue>,
}

impl Default for QueueMetrics {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            counters: MetricCounters::default(),
            pending: 0,
            processing: 0,
            retrying: 0,
            workers: 0,
            avg_wait_ms: 0.0,
            avg_processing_ms: 0.0,
            throughput: 0.0,
            error_rate: 0.0,
            cpu_utilization: 0.0,
            memory_utilization: 0.0,
            health: QueueHealth::Healthy,
            issues: Vec::new(),
        }
    }
}

impl QueueMetrics {
    pub fn recommendations(&self) -> Vec<String> {
        self.issues.iter().map(|i| i.recommendation().to_string()).collect()
    }
}

/// Gauges the coordinator reads from other components on each update.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueGauges {
    pub pending: usize,
    pub processing: usize,
    pub retrying: usize,
    pub workers: usize,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
}

// ── Alerts ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub name: String,
    pub level: AlertLevel,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub raised_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub acknowledged: bool,
}

/// Alert state changes from one update, for logging and hooks.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertChange {
    Raised(Alert),
    Escalated(Alert),
    Cleared(String),
}

struct Check {
    issue: HealthIssue,
    level: AlertLevel,
    value: f64,
    threshold: f64,
}

// ── Analytics ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    WaitTime,
    ProcessingTime,
    Throughput,
    ErrorRate,
    QueueLength,
    CpuUtilization,
    MemoryUtilization,
}

impl Metric {
    pub const ALL: [Metric; 7] = [
        Metric::WaitTime,
        Metric::ProcessingTime,
        Metric::Throughput,
        Metric::ErrorRate,
        Metric::QueueLength,
        Metric::CpuUtilization,
        Metric::MemoryUtilization,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Rising,
    Falling,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub direction: TrendDirection,
    /// Change per sample.
    pub slope: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub trend: Option<Trend>,
}

/// Relative slope below which a series counts as stable.
const STABLE_SLOPE: f64 = 0.01;

/// Serializable subset used by the persistence handoff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: MetricCounters,
    pub avg_wait_ms: f64,
    pub avg_processing_ms: f64,
    pub alerts: Vec<Alert>,
}

// ── Collector ─────────────────────────────────────────────────

pub struct QueueMetricsCollector {
    config: MetricsSection,
    current: QueueMetrics,
    avg_wait: Option<f64>,
    avg_processing: Option<f64>,
    completions: VecDeque<Instant>,
    failures: VecDeque<Instant>,
    wait_samples: RingBuffer<f64>,
    processing_samples: RingBuffer<f64>,
    history: RingBuffer<QueueMetrics>,
    alerts: BTreeMap<String, Alert>,
}

impl QueueMetricsCollector {
    pub fn new(config: MetricsSection) -> Self {
        Self {
            wait_samples: RingBuffer::new(config.analytics_window),
            processing_samples: RingBuffer::new(config.analytics_window),
            history: RingBuffer::new(config.history_size),
            config,
            current: QueueMetrics::default(),
            avg_wait: None,
            avg_processing: None,
            completions: VecDeque::new(),
            failures: VecDeque::new(),
            alerts: BTreeMap::new(),
        }
    }

    // ── Recording ─────────────────────────────────────────────

    pub fn record_submitted(&mut self) {
        self.current.counters.submitted += 1;
    }

    pub fn record_rejected(&mut self) {
        self.current.counters.rejected += 1;
    }

    pub fn record_cache_hit(&mut self) {
        self.current.counters.cache_hits += 1;
    }

    pub fn record_deduplicated(&mut self) {
        self.current.counters.deduplicated += 1;
    }

    /// A request left the queue for a unit after waiting `wait`.
    pub fn record_dispatch(&mut self, wait: Duration) {
        let ms = wait.as_secs_f64() * 1000.0;
        self.avg_wait = Some(ema(self.avg_wait, ms, self.config.ema_alpha));
        self.wait_samples.push(ms);
    }

    pub fn record_completion(&mut self, processing: Duration, now: Instant) {
        let ms = processing.as_secs_f64() * 1000.0;
        self.avg_processing = Some(ema(self.avg_processing, ms, self.config.ema_alpha));
        self.processing_samples.push(ms);
        self.current.counters.completed += 1;
        self.completions.push_back(now);
    }

    /// Terminal failure. `timed_out` tags timeouts separately.
    pub fn record_failure(&mut self, timed_out: bool, now: Instant) {
        self.current.counters.failed += 1;
        if timed_out {
            self.current.counters.timeouts += 1;
        }
        self.failures.push_back(now);
    }

    /// A failed attempt that will be retried.
    pub fn record_retry(&mut self, timed_out: bool) {
        self.current.counters.retried += 1;
        if timed_out {
            self.current.counters.timeouts += 1;
        }
    }

    pub fn record_cancelled(&mut self) {
        self.current.counters.cancelled += 1;
    }

    // ── Update ────────────────────────────────────────────────

    /// Refresh gauges and derived figures, re-evaluate health and alerts,
    /// and append to history.
    pub fn update(&mut self, gauges: QueueGauges, now: Instant) -> Vec<AlertChange> {
        let window = self.config.throughput_window();
        prune(&mut self.completions, now, window);
        prune(&mut self.failures, now, window);

        let done = self.completions.len();
        let failed = self.failures.len();
        let m = &mut self.current;
        m.timestamp = Utc::now();
        m.pending = gauges.pending;
        m.processing = gauges.processing;
        m.retrying = gauges.retrying;
        m.workers = gauges.workers;
        m.cpu_utilization = gauges.cpu_utilization;
        m.memory_utilization = gauges.memory_utilization;
        m.avg_wait_ms = self.avg_wait.unwrap_or(0.0);
        m.avg_processing_ms = self.avg_processing.unwrap_or(0.0);
        m.throughput = done as f64 / window.as_secs_f64();
        m.error_rate = if done + failed == 0 {
            0.0
        } else {
            failed as f64 / (done + failed) as f64
        };

        let checks = self.run_checks();
        let issues: Vec<HealthIssue> = checks.iter().map(|c| c.issue).collect();
        let health = match issues.len() {
            0 => QueueHealth::Healthy,
            1 | 2 => QueueHealth::Degraded,
            _ => QueueHealth::Critical,
        };
        if health != self.current.health {
            info!(from = %self.current.health, to = %health, issues = issues.len(), "queue health changed");
        }
        self.current.health = health;
        self.current.issues = issues;

        let changes = self.apply_alerts(checks);
        self.history.push(self.current.clone());
        changes
    }

    fn run_checks(&self) -> Vec<Check> {
        let t: &AlertThresholds = &self.config.alerts;
        let m = &self.current;
        let mut checks = Vec::new();

        let mut level_check = |issue, value: f64, warn_at: f64, crit_at: f64| {
            let level = if value >= crit_at {
                Some((AlertLevel::Critical, crit_at))
            } else if value >= warn_at {
                Some((AlertLevel::Warning, warn_at))
            } else {
                None
            };
            if let Some((level, threshold)) = level {
                checks.push(Check {
                    issue,
                    level,
                    value,
                    threshold,
                });
            }
        };

        level_check(
            HealthIssue::HighLatency,
            m.avg_processing_ms,
            t.latency_warning_ms,
            t.latency_critical_ms,
        );
        level_check(
            HealthIssue::HighErrorRate,
            m.error_rate,
            t.error_rate_warning,
            t.error_rate_critical,
        );
        level_check(
            HealthIssue::LongQueue,
            m.pending as f64,
            t.queue_length_warning as f64,
            t.queue_length_critical as f64,
        );
        level_check(HealthIssue::HighCpu, m.cpu_utilization, t.cpu_warning, t.cpu_critical);
        level_check(
            HealthIssue::HighMemory,
            m.memory_utilization,
            t.memory_warning,
            t.memory_critical,
        );

        // Only meaningful once there is a full window of history and work waiting.
        let warmed_up = self.history.len() >= 2;
        if warmed_up && m.pending > 0 && m.processing == 0 && m.throughput < t.min_throughput {
            checks.push(Check {
                issue: HealthIssue::LowThroughput,
                level: AlertLevel::Warning,
                value: m.throughput,
                threshold: t.min_throughput,
            });
        }
        checks
    }

    fn apply_alerts(&mut self, checks: Vec<Check>) -> Vec<AlertChange> {
        let now = Utc::now();
        let mut changes = Vec::new();
        let firing: Vec<&'static str> = checks.iter().map(|c| c.issue.name()).collect();

        for check in checks {
            let name = check.issue.name();
            let message = format!(
                "{}: {:.3} over threshold {:.3}",
                name, check.value, check.threshold
            );
            match self.alerts.get_mut(name) {
                Some(alert) => {
                    let escalated = check.level > alert.level;
                    alert.level = check.level;
                    alert.value = check.value;
                    alert.threshold = check.threshold;
                    alert.message = message;
                    alert.updated_at = now;
                    if escalated {
                        alert.acknowledged = false;
                        warn!(alert = name, value = check.value, "alert escalated");
                        changes.push(AlertChange::Escalated(alert.clone()));
                    }
                }
                None => {
                    let alert = Alert {
                        name: name.to_string(),
                        level: check.level,
                        message,
                        value: check.value,
                        threshold: check.threshold,
                        raised_at: now,
                        updated_at: now,
                        acknowledged: false,
                    };
                    warn!(alert = name, level = ?check.level, value = check.value, "alert raised");
                    changes.push(AlertChange::Raised(alert.clone()));
                    self.alerts.insert(name.to_string(), alert);
                }
            }
        }

        let cleared: Vec<String> = self
            .alerts
            .keys()
            .filter(|k| !firing.contains(&k.as_str()))
            .cloned()
            .collect();
        for name in cleared {
            self.alerts.remove(&name);
            info!(alert = %name, "alert cleared");
            changes.push(AlertChange::Cleared(name));
        }
        changes
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn snapshot(&self) -> QueueMetrics {
        self.current.clone()
    }

    pub fn counters(&self) -> &MetricCounters {
        &self.current.counters
    }

    pub fn health(&self) -> QueueHealth {
        self.current.health
    }

    pub fn recommendations(&self) -> Vec<String> {
        self.current.recommendations()
    }

    pub fn history(&self) -> impl Iterator<Item = &QueueMetrics> {
        self.history.iter()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.values().cloned().collect()
    }

    /// Mark an active alert as seen. It stays listed until it clears.
    pub fn acknowledge(&mut self, name: &str) -> bool {
        match self.alerts.get_mut(name) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    // ── Analytics ─────────────────────────────────────────────

    /// Values of `metric` in the rolling analytics window, oldest first.
    pub fn series(&self, metric: Metric) -> Vec<f64> {
        let n = self.config.analytics_window;
        let from_history = |f: fn(&QueueMetrics) -> f64| -> Vec<f64> {
            self.history.tail(n).map(f).collect()
        };
        match metric {
            Metric::WaitTime => self.wait_samples.iter().copied().collect(),
            Metric::ProcessingTime => self.processing_samples.iter().copied().collect(),
            Metric::Throughput => from_history(|m| m.throughput),
            Metric::ErrorRate => from_history(|m| m.error_rate),
            Metric::QueueLength => from_history(|m| m.pending as f64),
            Metric::CpuUtilization => from_history(|m| m.cpu_utilization),
            Metric::MemoryUtilization => from_history(|m| m.memory_utilization),
        }
    }

    pub fn percentile(&self, metric: Metric, p: f64) -> Option<f64> {
        percentile(&self.series(metric), p)
    }

    pub fn median(&self, metric: Metric) -> Option<f64> {
        self.percentile(metric, 50.0)
    }

    /// Direction by regression slope, relative to the series mean.
    pub fn trend(&self, metric: Metric) -> Option<Trend> {
        let values = self.series(metric);
        let fit = linear_fit(&values)?;
        let scale = mean(&values).abs().max(f64::EPSILON);
        let relative = fit.slope / scale;
        let direction = if relative > STABLE_SLOPE {
            TrendDirection::Rising
        } else if relative < -STABLE_SLOPE {
            TrendDirection::Falling
        } else {
            TrendDirection::Stable
        };
        Some(Trend {
            direction,
            slope: fit.slope,
        })
    }

    pub fn summary(&self) -> BTreeMap<Metric, MetricSummary> {
        let mut out = BTreeMap::new();
        for metric in Metric::ALL {
            let values = self.series(metric);
            if values.is_empty() {
                continue;
            }
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            out.insert(
                metric,
                MetricSummary {
                    count: values.len(),
                    mean: mean(&values),
                    min,
                    max,
                    p50: percentile(&values, 50.0).unwrap_or(0.0),
                    p95: percentile(&values, 95.0).unwrap_or(0.0),
                    p99: percentile(&values, 99.0).unwrap_or(0.0),
                    trend: self.trend(metric),
                },
            );
        }
        out
    }

    // ── Persistence ───────────────────────────────────────────

    pub fn export(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.current.counters.clone(),
            avg_wait_ms: self.avg_wait.unwrap_or(0.0),
            avg_processing_ms: self.avg_processing.unwrap_or(0.0),
            alerts: self.alerts(),
        }
    }

    /// Replace counters and averages. Alerts are re-derived on the next
    /// update rather than restored.
    pub fn restore(&mut self, snapshot: MetricsSnapshot) {
        self.current.counters = snapshot.counters;
        self.avg_wait = Some(snapshot.avg_wait_ms).filter(|v| *v > 0.0);
        self.avg_processing = Some(snapshot.avg_processing_ms).filter(|v| *v > 0.0);
        self.current.avg_wait_ms = snapshot.avg_wait_ms;
        self.current.avg_processing_ms = snapshot.avg_processing_ms;
    }
}

fn prune(events: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = events.front() {
        if now.saturating_duration_since(*front) > window {
            events.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> QueueMetricsCollector {
        QueueMetricsCollector::new(MetricsSection::default())
    }

    fn quiet() -> QueueGauges {
        QueueGauges {
            workers: 2,
            cpu_utilization: 0.2,
            memory_utilization: 0.3,
            ..QueueGauges::default()
        }
    }

    #[test]
    fn ema_of_processing_time() {
        let mut c = collector();
        let now = Instant::now();
        c.record_completion(Duration::from_millis(100), now);
        c.record_completion(Duration::from_millis(200), now);
        c.update(quiet(), now);
        let m = c.snapshot();
        assert!((m.avg_processing_ms - 110.0).abs() < 1e-6);
        assert_eq!(m.counters.completed, 2);
        assert_eq!(m.health, QueueHealth::Healthy);
        assert!(c.alerts().is_empty());
    }

    #[test]
    fn throughput_and_error_rate_over_window() {
        let mut c = collector();
        let t0 = Instant::now();
        for _ in 0..6 {
            c.record_completion(Duration::from_millis(10), t0);
        }
        for _ in 0..2 {
            c.record_failure(false, t0);
        }
        c.update(quiet(), t0);
        let m = c.snapshot();
        assert!((m.throughput - 0.1).abs() < 1e-9);
        assert!((m.error_rate - 0.25).abs() < 1e-9);

        // Outside the 60s window everything ages out.
        c.update(quiet(), t0 + Duration::from_secs(61));
        assert_eq!(c.snapshot().throughput, 0.0);
        assert_eq!(c.snapshot().error_rate, 0.0);
    }

    #[test]
    fn health_classification() {
        let mut c = collector();
        let now = Instant::now();
        let mut g = quiet();
        g.cpu_utilization = 0.9;
        c.update(g, now);
        assert_eq!(c.health(), QueueHealth::Degraded);
        assert_eq!(c.recommendations().len(), 1);

        g.memory_utilization = 0.99;
        g.pending = 600;
        c.update(g, now);
        assert_eq!(c.health(), QueueHealth::Critical);
        assert_eq!(c.snapshot().issues.len(), 3);
    }

    #[test]
    fn alerts_raise_escalate_ack_and_clear() {
        let mut c = collector();
        let now = Instant::now();
        let mut g = quiet();
        g.cpu_utilization = 0.85;
        let changes = c.update(g, now);
        assert!(matches!(&changes[0], AlertChange::Raised(a) if a.name == "high_cpu" && a.level == AlertLevel::Warning));

        assert!(c.acknowledge("high_cpu"));
        assert!(c.alerts()[0].acknowledged);
        // refresh at same level keeps the acknowledgement
        c.update(g, now);
        assert!(c.alerts()[0].acknowledged);

        g.cpu_utilization = 0.97;
        let changes = c.update(g, now);
        assert!(matches!(&changes[0], AlertChange::Escalated(a) if a.level == AlertLevel::Critical));
        assert!(!c.alerts()[0].acknowledged);

        g.cpu_utilization = 0.1;
        let changes = c.update(g, now);
        assert_eq!(changes, vec![AlertChange::Cleared("high_cpu".into())]);
        assert!(c.alerts().is_empty());
        assert!(!c.acknowledge("high_cpu"));
    }

    #[test]
    fn analytics_over_window() {
        let mut c = collector();
        let now = Instant::now();
        for ms in 1..=100u64 {
            c.record_completion(Duration::from_millis(ms), now);
        }
        assert_eq!(c.median(Metric::ProcessingTime), Some(50.0));
        assert_eq!(c.percentile(Metric::ProcessingTime, 95.0), Some(95.0));
        let trend = c.trend(Metric::ProcessingTime).unwrap();
        assert_eq!(trend.direction, TrendDirection::Rising);

        for pending in [50, 40, 30, 20, 10] {
            let mut g = quiet();
            g.pending = pending;
            c.update(g, now);
        }
        assert_eq!(c.trend(Metric::QueueLength).unwrap().direction, TrendDirection::Falling);
        let summary = c.summary();
        assert_eq!(summary[&Metric::QueueLength].max, 50.0);
        assert_eq!(summary[&Metric::ProcessingTime].count, 100);
    }

    #[test]
    fn export_restore_counters() {
        let mut c = collector();
        let now = Instant::now();
        c.record_submitted();
        c.record_completion(Duration::from_millis(40), now);
        let snap = c.export();

        let mut restored = collector();
        restored.restore(snap.clone());
        assert_eq!(restored.counters(), &snap.counters);
        assert_eq!(restored.snapshot().avg_processing_ms, 40.0);
    }
}
