//! Resource requirement and availability types.
//!
//! CPU is measured in cores (fractional), everything else in bytes or
//! bytes per second.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a single request needs while it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// CPU cores (0.5 = half a core).
    pub cpu: f64,
    pub memory_bytes: u64,
    pub network_bps: u64,
    pub disk_bytes: u64,
    /// Max requests of this type in flight at once.
    pub max_concurrency: Option<u32>,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu: 0.1,
            memory_bytes: 16 * 1024 * 1024,
            network_bps: 0,
            disk_bytes: 0,
            max_concurrency: None,
        }
    }
}

impl ResourceRequirements {
    /// A requirement that consumes nothing.
    pub fn none() -> Self {
        Self {
            cpu: 0.0,
            memory_bytes: 0,
            network_bps: 0,
            disk_bytes: 0,
            max_concurrency: None,
        }
    }

    pub fn with_cpu(mut self, cores: f64) -> Self {
        self.cpu = cores.max(0.0);
        self
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    pub fn with_network(mut self, bps: u64) -> Self {
        self.network_bps = bps;
        self
    }

    pub fn with_disk(mut self, bytes: u64) -> Self {
        self.disk_bytes = bytes;
        self
    }

    pub fn with_max_concurrency(mut self, n: u32) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    /// Component-wise sum (concurrency limit is not additive and is dropped).
    pub fn add(&self, other: &ResourceRequirements) -> ResourceRequirements {
        ResourceRequirements {
            cpu: self.cpu + other.cpu,
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            network_bps: self.network_bps.saturating_add(other.network_bps),
            disk_bytes: self.disk_bytes.saturating_add(other.disk_bytes),
            max_concurrency: None,
        }
    }
}

/// Remaining allocatable capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub cpu: f64,
    pub memory_bytes: u64,
    pub network_bps: u64,
    pub disk_bytes: u64,
}

impl ResourceBudget {
    pub fn unlimited() -> Self {
        Self {
            cpu: f64::INFINITY,
            memory_bytes: u64::MAX,
            network_bps: u64::MAX,
            disk_bytes: u64::MAX,
        }
    }

    pub fn fits(&self, req: &ResourceRequirements) -> bool {
        req.cpu <= self.cpu + f64::EPSILON
            && req.memory_bytes <= self.memory_bytes
            && req.network_bps <= self.network_bps
            && req.disk_bytes <= self.disk_bytes
    }

    /// Remove `req` from the budget, saturating at zero.
    pub fn subtract(&mut self, req: &ResourceRequirements) {
        self.cpu = (self.cpu - req.cpu).max(0.0);
        self.memory_bytes = self.memory_bytes.saturating_sub(req.memory_bytes);
        self.network_bps = self.network_bps.saturating_sub(req.network_bps);
        self.disk_bytes = self.disk_bytes.saturating_sub(req.disk_bytes);
    }
}

/// One sample of host resource state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub taken_at: DateTime<Utc>,
    /// CPU utilization, 0.0..=1.0.
    pub cpu_usage: f64,
    /// Idle cores.
    pub cpu_available: f64,
    pub cpu_cores: usize,
    pub memory_used: u64,
    pub memory_available: u64,
    pub memory_total: u64,
    pub network_bandwidth_bps: u64,
    pub network_latency_ms: f64,
    pub disk_used: u64,
    pub disk_available: u64,
}

impl ResourceSnapshot {
    /// Memory utilization, 0.0..=1.0.
    pub fn memory_usage(&self) -> f64 {
        if self.memory_total == 0 {
            return 0.0;
        }
        self.memory_used as f64 / self.memory_total as f64
    }

    /// The free capacity this snapshot reports, as a budget.
    pub fn budget(&self) -> ResourceBudget {
        ResourceBudget {
            cpu: self.cpu_available,
            memory_bytes: self.memory_available,
            network_bps: self.network_bandwidth_bps,
            disk_bytes: self.disk_available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> ResourceSnapshot {
        ResourceSnapshot {
            taken_at: Utc::now(),
            cpu_usage: 0.25,
            cpu_available: 3.0,
            cpu_cores: 4,
            memory_used: 2 * 1024,
            memory_available: 6 * 1024,
            memory_total: 8 * 1024,
            network_bandwidth_bps: 1_000,
            network_latency_ms: 1.0,
            disk_used: 0,
            disk_available: 10_000,
        }
    }

    #[test]
    fn budget_fits_and_subtracts() {
        let mut budget = snapshot().budget();
        let req = ResourceRequirements::none().with_cpu(2.0).with_memory(4 * 1024);
        assert!(budget.fits(&req));
        budget.subtract(&req);
        assert!(!budget.fits(&req));
        assert_eq!(budget.memory_bytes, 2 * 1024);
    }

    #[test]
    fn memory_usage_ratio() {
        assert!((snapshot().memory_usage() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn unlimited_fits_anything() {
        let req = ResourceRequirements::default().with_cpu(1_000.0);
        assert!(ResourceBudget::unlimited().fits(&req));
    }
}
