//! Resource model: host sampling, a logical allocation ledger and
//! trend-checked scale signals.
//!
//! The ledger is advisory. It tracks what in-flight requests declared they
//! need; it does not cap what they actually consume, and the two are
//! expected to drift apart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sluice_core::{
    CapacityOverride, RequestId, ResourceBudget, ResourceRequirements, ResourceSection,
    ResourceSnapshot,
};
use tracing::{debug, trace};

use crate::error::QueueError;
use crate::stats::{linear_fit, LinearFit, RingBuffer};

/// Fallback when total memory cannot be read.
const FALLBACK_MEMORY_BYTES: u64 = 8 * 1024 * 1024 * 1024;
/// Nominal network capacity reported when nothing better is known (1 Gbit/s).
const NOMINAL_NETWORK_BPS: u64 = 125_000_000;
/// Nominal scratch disk budget reported when nothing better is known.
const NOMINAL_DISK_BYTES: u64 = 100 * 1024 * 1024 * 1024;

// ── Probes ────────────────────────────────────────────────────

/// Source of host resource samples.
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> ResourceSnapshot;
}

/// Reads `/proc` on Linux; elsewhere falls back to core count and fixed
/// defaults.
#[derive(Debug, Default)]
pub struct SystemProbe {
    /// (idle, total) jiffies from the previous `/proc/stat` read.
    last_cpu: Option<(u64, u64)>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn cores() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    fn read_cpu_usage(&mut self, cores: usize) -> f64 {
        if let Some((idle, total)) = read_proc_stat() {
            let usage = match self.last_cpu {
                Some((prev_idle, prev_total)) if total > prev_total => {
                    let d_total = (total - prev_total) as f64;
                    let d_idle = idle.saturating_sub(prev_idle) as f64;
                    1.0 - d_idle / d_total
                }
                _ => read_loadavg().map(|l| l / cores as f64).unwrap_or(0.0),
            };
            self.last_cpu = Some((idle, total));
            return usage.clamp(0.0, 1.0);
        }
        read_loadavg()
            .map(|l| (l / cores as f64).clamp(0.0, 1.0))
            .unwrap_or(0.0)
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&mut self) -> ResourceSnapshot {
        let cores = Self::cores();
        let cpu_usage = self.read_cpu_usage(cores);
        let (memory_total, memory_available) =
            read_meminfo().unwrap_or((FALLBACK_MEMORY_BYTES, FALLBACK_MEMORY_BYTES / 2));
        ResourceSnapshot {
            taken_at: Utc::now(),
            cpu_usage,
            cpu_available: cores as f64 * (1.0 - cpu_usage),
            cpu_cores: cores,
            memory_used: memory_total.saturating_sub(memory_available),
            memory_available,
            memory_total,
            network_bandwidth_bps: NOMINAL_NETWORK_BPS,
            network_latency_ms: 0.0,
            disk_used: 0,
            disk_available: NOMINAL_DISK_BYTES,
        }
    }
}

/// `(idle, total)` jiffies summed over all CPUs.
fn read_proc_stat() -> Option<(u64, u64)> {
    let contents = std::fs::read_to_string("/proc/stat").ok()?;
    let line = contents.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some((idle, fields.iter().sum()))
}

/// `(total, available)` bytes.
fn read_meminfo() -> Option<(u64, u64)> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    let field = |name: &str| -> Option<u64> {
        let line = contents.lines().find(|l| l.starts_with(name))?;
        let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb * 1024)
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    Some((total, available))
}

fn read_loadavg() -> Option<f64> {
    let contents = std::fs::read_to_string("/proc/loadavg").ok()?;
    contents.split_whitespace().next()?.parse().ok()
}

/// Utilization shared between a [`StaticProbe`] and whoever drives it.
#[derive(Debug, Clone, Default)]
pub struct UsageHandle {
    inner: Arc<Mutex<(f64, f64)>>,
}

impl UsageHandle {
    /// Set CPU and memory utilization (0.0..=1.0) for subsequent samples.
    pub fn set(&self, cpu: f64, memory: f64) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = (cpu.clamp(0.0, 1.0), memory.clamp(0.0, 1.0));
    }

    fn get(&self) -> (f64, f64) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed capacity with externally controlled utilization.
#[derive(Debug, Clone)]
pub struct StaticProbe {
    capacity: CapacityOverride,
    usage: UsageHandle,
}

impl StaticProbe {
    pub fn new(capacity: CapacityOverride) -> Self {
        Self {
            capacity,
            usage: UsageHandle::default(),
        }
    }

    pub fn with_cores(cores: usize, memory_bytes: u64) -> Self {
        Self::new(CapacityOverride {
            cpu_cores: cores,
            memory_bytes,
            network_bps: NOMINAL_NETWORK_BPS,
            disk_bytes: NOMINAL_DISK_BYTES,
        })
    }

    pub fn usage_handle(&self) -> UsageHandle {
        self.usage.clone()
    }
}

impl ResourceProbe for StaticProbe {
    fn sample(&mut self) -> ResourceSnapshot {
        let (cpu, mem) = self.usage.get();
        let cap = &self.capacity;
        let memory_used = (cap.memory_bytes as f64 * mem) as u64;
        ResourceSnapshot {
            taken_at: Utc::now(),
            cpu_usage: cpu,
            cpu_available: cap.cpu_cores as f64 * (1.0 - cpu),
            cpu_cores: cap.cpu_cores,
            memory_used,
            memory_available: cap.memory_bytes.saturating_sub(memory_used),
            memory_total: cap.memory_bytes,
            network_bandwidth_bps: cap.network_bps,
            network_latency_ms: 0.0,
            disk_used: 0,
            disk_available: cap.disk_bytes,
        }
    }
}

// ── Manager ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceMetric {
    Cpu,
    Memory,
}

/// Direction the resource model alone would push pool size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceSignal {
    ScaleUp,
    ScaleDown,
    Neutral,
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    requirement: ResourceRequirements,
    pool: String,
}

pub struct ResourceManager {
    config: ResourceSection,
    probe: Box<dyn ResourceProbe>,
    history: RingBuffer<ResourceSnapshot>,
    ledger: HashMap<RequestId, LedgerEntry>,
    allocated: ResourceRequirements,
    last_sample: Option<Instant>,
}

impl ResourceManager {
    /// Builds from config: a [`StaticProbe`] when a capacity override is
    /// configured, otherwise a [`SystemProbe`].
    pub fn from_config(config: ResourceSection) -> Self {
        let probe: Box<dyn ResourceProbe> = match &config.capacity_override {
            Some(cap) => Box::new(StaticProbe::new(cap.clone())),
            None => Box::new(SystemProbe::new()),
        };
        Self::new(config, probe)
    }

    pub fn new(config: ResourceSection, probe: Box<dyn ResourceProbe>) -> Self {
        let mut manager = Self {
            history: RingBuffer::new(config.history_size),
            config,
            probe,
            ledger: HashMap::new(),
            allocated: ResourceRequirements::none(),
            last_sample: None,
        };
        manager.sample_at(Instant::now());
        manager
    }

    // ── Sampling ──────────────────────────────────────────────

    pub fn sample_at(&mut self, now: Instant) {
        let snapshot = self.probe.sample();
        trace!(
            cpu = snapshot.cpu_usage,
            memory = snapshot.memory_usage(),
            "resource sample"
        );
        self.history.push(snapshot);
        self.last_sample = Some(now);
    }

    /// Take a sample if the sampling interval has elapsed.
    pub fn sample_if_due(&mut self, now: Instant) -> bool {
        let due = match self.last_sample {
            Some(last) => now.saturating_duration_since(last) >= self.config.sample_interval(),
            None => true,
        };
        if due {
            self.sample_at(now);
        }
        due
    }

    pub fn current(&self) -> Option<&ResourceSnapshot> {
        self.history.latest()
    }

    pub fn history(&self) -> impl Iterator<Item = &ResourceSnapshot> {
        self.history.iter()
    }

    // ── Ledger ────────────────────────────────────────────────

    /// Physical capacity minus everything currently allocated.
    pub fn available_resources(&self) -> ResourceBudget {
        let Some(snap) = self.current() else {
            return ResourceBudget::unlimited();
        };
        let mut budget = ResourceBudget {
            cpu: snap.cpu_cores as f64,
            memory_bytes: snap.memory_total,
            network_bps: snap.network_bandwidth_bps,
            disk_bytes: snap.disk_used.saturating_add(snap.disk_available),
        };
        budget.subtract(&self.allocated);
        budget
    }

    pub fn can_allocate(&self, requirement: &ResourceRequirements) -> bool {
        self.available_resources().fits(requirement)
    }

    pub fn allocate(
        &mut self,
        id: RequestId,
        requirement: &ResourceRequirements,
        pool: &str,
    ) -> Result<(), QueueError> {
        if self.ledger.contains_key(&id) {
            return Ok(());
        }
        if !self.can_allocate(requirement) {
            return Err(QueueError::CapacityDenied(id));
        }
        self.allocated = self.allocated.add(requirement);
        self.ledger.insert(
            id,
            LedgerEntry {
                requirement: requirement.clone(),
                pool: pool.to_string(),
            },
        );
        debug!(request_id = %id, pool, cpu = requirement.cpu, "allocated");
        Ok(())
    }

    pub fn release(&mut self, id: &RequestId) -> Option<ResourceRequirements> {
        let entry = self.ledger.remove(id)?;
        let r = &entry.requirement;
        self.allocated.cpu = (self.allocated.cpu - r.cpu).max(0.0);
        self.allocated.memory_bytes = self.allocated.memory_bytes.saturating_sub(r.memory_bytes);
        self.allocated.network_bps = self.allocated.network_bps.saturating_sub(r.network_bps);
        self.allocated.disk_bytes = self.allocated.disk_bytes.saturating_sub(r.disk_bytes);
        if self.ledger.is_empty() {
            self.allocated = ResourceRequirements::none();
        }
        Some(entry.requirement)
    }

    pub fn allocated(&self) -> &ResourceRequirements {
        &self.allocated
    }

    pub fn allocation_count(&self) -> usize {
        self.ledger.len()
    }

    /// Share of host cores allocated to requests running in `pool`.
    pub fn pool_load(&self, pool: &str) -> f64 {
        let cores = self.current().map(|s| s.cpu_cores).unwrap_or(1).max(1) as f64;
        let cpu: f64 = self
            .ledger
            .values()
            .filter(|e| e.pool == pool)
            .map(|e| e.requirement.cpu)
            .sum();
        (cpu / cores).clamp(0.0, 1.0)
    }

    // ── Utilization and trends ────────────────────────────────

    pub fn cpu_utilization(&self) -> f64 {
        self.current().map(|s| s.cpu_usage).unwrap_or(0.0)
    }

    pub fn memory_utilization(&self) -> f64 {
        self.current().map(ResourceSnapshot::memory_usage).unwrap_or(0.0)
    }

    /// 1.0 minus the higher of CPU and memory utilization.
    pub fn headroom(&self) -> f64 {
        (1.0 - self.cpu_utilization().max(self.memory_utilization())).clamp(0.0, 1.0)
    }

    fn series(&self, metric: ResourceMetric) -> Vec<f64> {
        self.history
            .tail(self.config.trend_window)
            .map(|s| match metric {
                ResourceMetric::Cpu => s.cpu_usage,
                ResourceMetric::Memory => s.memory_usage(),
            })
            .collect()
    }

    /// Regression over the last `trend_window` samples.
    pub fn trend(&self, metric: ResourceMetric) -> Option<LinearFit> {
        linear_fit(&self.series(metric))
    }

    /// Value the trend line projects for the next sample.
    fn projected(&self, metric: ResourceMetric) -> Option<f64> {
        let series = self.series(metric);
        let fit = linear_fit(&series)?;
        Some(fit.at(series.len() as f64))
    }

    fn breach_up(&self, metric: ResourceMetric, current: f64, threshold: f64) -> bool {
        current > threshold && self.projected(metric).is_some_and(|p| p > threshold)
    }

    fn breach_down(&self, metric: ResourceMetric, current: f64, threshold: f64) -> bool {
        current < threshold && self.projected(metric).is_some_and(|p| p < threshold)
    }

    /// CPU or memory is over its threshold now and the trend agrees.
    /// A single spike after a calm period does not qualify.
    pub fn should_scale_up(&self) -> bool {
        let c = &self.config;
        self.breach_up(ResourceMetric::Cpu, self.cpu_utilization(), c.cpu_scale_up)
            || self.breach_up(ResourceMetric::Memory, self.memory_utilization(), c.memory_scale_up)
    }

    /// Both CPU and memory are under their thresholds and trending there.
    pub fn should_scale_down(&self) -> bool {
        let c = &self.config;
        self.breach_down(ResourceMetric::Cpu, self.cpu_utilization(), c.cpu_scale_down)
            && self.breach_down(ResourceMetric::Memory, self.memory_utilization(), c.memory_scale_down)
    }

    pub fn signal(&self) -> ResourceSignal {
        if self.should_scale_up() {
            ResourceSignal::ScaleUp
        } else if self.should_scale_down() {
            ResourceSignal::ScaleDown
        } else {
            ResourceSignal::Neutral
        }
    }

    /// min(cores * 2, total memory / memory per worker), at least 1.
    pub fn optimal_worker_count(&self) -> usize {
        let Some(snap) = self.current() else {
            return 1;
        };
        let by_cpu = snap.cpu_cores * 2;
        let by_memory = (snap.memory_total / self.config.memory_per_worker.max(1)) as usize;
        by_cpu.min(by_memory).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn manager(cores: usize) -> (ResourceManager, UsageHandle) {
        let probe = StaticProbe::with_cores(cores, 8 * GIB);
        let handle = probe.usage_handle();
        let config = ResourceSection {
            trend_window: 5,
            ..ResourceSection::default()
        };
        (ResourceManager::new(config, Box::new(probe)), handle)
    }

    fn feed(m: &mut ResourceManager, handle: &UsageHandle, cpu: &[f64]) {
        for c in cpu {
            handle.set(*c, 0.5);
            m.sample_at(Instant::now());
        }
    }

    #[test]
    fn ledger_reduces_availability() {
        let (mut m, _) = manager(2);
        let req = ResourceRequirements::none().with_cpu(1.5);
        let a = RequestId::new();
        m.allocate(a, &req, "default").unwrap();
        assert!(!m.can_allocate(&req));
        let b = RequestId::new();
        assert_eq!(m.allocate(b, &req, "default"), Err(QueueError::CapacityDenied(b)));
        assert!((m.pool_load("default") - 0.75).abs() < 1e-9);
        m.release(&a).unwrap();
        assert!(m.can_allocate(&req));
        assert_eq!(m.allocation_count(), 0);
    }

    #[test]
    fn sustained_load_scales_up() {
        let (mut m, h) = manager(4);
        feed(&mut m, &h, &[0.85, 0.88, 0.9, 0.92, 0.95]);
        assert!(m.should_scale_up());
        assert_eq!(m.signal(), ResourceSignal::ScaleUp);
    }

    #[test]
    fn transient_spike_does_not_scale_up() {
        let (mut m, h) = manager(4);
        feed(&mut m, &h, &[0.1, 0.1, 0.1, 0.1, 0.9]);
        assert!(m.cpu_utilization() > 0.8);
        assert!(!m.should_scale_up());
    }

    #[test]
    fn quiet_host_scales_down() {
        let (mut m, h) = manager(4);
        for _ in 0..5 {
            h.set(0.1, 0.2);
            m.sample_at(Instant::now());
        }
        assert!(m.should_scale_down());
        assert!(!m.should_scale_up());
    }

    #[test]
    fn optimal_workers_bounded_by_memory() {
        let (m, _) = manager(16);
        // 8 GiB / 256 MiB = 32, cores * 2 = 32
        assert_eq!(m.optimal_worker_count(), 32);
        let probe = StaticProbe::with_cores(16, GIB);
        let m = ResourceManager::new(ResourceSection::default(), Box::new(probe));
        assert_eq!(m.optimal_worker_count(), 4);
    }

    #[test]
    fn sample_if_due_respects_interval() {
        let (mut m, _) = manager(1);
        let t0 = Instant::now();
        m.sample_at(t0);
        let before = m.history().count();
        assert!(!m.sample_if_due(t0 + std::time::Duration::from_millis(10)));
        assert!(m.sample_if_due(t0 + std::time::Duration::from_secs(5)));
        assert_eq!(m.history().count(), before + 1);
    }

    #[test]
    fn system_probe_reports_sane_values() {
        let snap = SystemProbe::new().sample();
        assert!(snap.cpu_cores >= 1);
        assert!((0.0..=1.0).contains(&snap.cpu_usage));
        assert!(snap.memory_total > 0);
    }
}
