//! Routes a dispatched request to one of the worker pools.

use sluice_core::BalancerStrategy;

use crate::pool::WorkerPool;

/// Floor for the headroom factor so a fully loaded pool can still win
/// when it is the only one with free slots.
const MIN_HEADROOM: f64 = 0.05;

/// What the balancer needs to know about a pool.
pub trait Routable {
    fn name(&self) -> &str;
    fn accepts(&self, request_type: &str) -> bool;
    fn free_slots(&self) -> usize;
    fn capacity(&self) -> usize;
    fn in_flight(&self) -> usize;
    fn weight(&self) -> f64;
}

impl Routable for WorkerPool {
    fn name(&self) -> &str {
        WorkerPool::name(self)
    }

    fn accepts(&self, request_type: &str) -> bool {
        WorkerPool::accepts(self, request_type)
    }

    fn free_slots(&self) -> usize {
        self.free_capacity()
    }

    fn capacity(&self) -> usize {
        WorkerPool::capacity(self)
    }

    fn in_flight(&self) -> usize {
        WorkerPool::in_flight(self)
    }

    fn weight(&self) -> f64 {
        self.config().weight
    }
}

#[derive(Debug, Clone)]
pub struct LoadBalancer {
    strategy: BalancerStrategy,
    cursor: usize,
}

impl LoadBalancer {
    pub fn new(strategy: BalancerStrategy) -> Self {
        Self { strategy, cursor: 0 }
    }

    pub fn strategy(&self) -> BalancerStrategy {
        self.strategy
    }

    /// Index of the pool that should run a request of `request_type`, or
    /// `None` when no candidate has a free slot. Pools restricted to other
    /// types are skipped unless no pool accepts the type at all.
    ///
    /// `pool_load` reports the ledger share allocated to a pool (0..=1); it
    /// only matters for the weighted strategy.
    pub fn select<P, L>(&mut self, pools: &[P], request_type: &str, pool_load: L) -> Option<usize>
    where
        P: Routable,
        L: Fn(&str) -> f64,
    {
        let any_accepts = pools.iter().any(|p| p.accepts(request_type));
        let candidates: Vec<usize> = pools
            .iter()
            .enumerate()
            .filter(|(_, p)| (!any_accepts || p.accepts(request_type)) && p.free_slots() > 0)
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let chosen = match self.strategy {
            BalancerStrategy::RoundRobin => {
                // First candidate at or after the cursor, wrapping.
                let start = self.cursor % pools.len();
                let pick = candidates
                    .iter()
                    .copied()
                    .find(|&i| i >= start)
                    .unwrap_or(candidates[0]);
                self.cursor = pick + 1;
                pick
            }
            BalancerStrategy::LeastLoaded => candidates
                .iter()
                .copied()
                .min_by(|&a, &b| {
                    load_ratio(&pools[a])
                        .total_cmp(&load_ratio(&pools[b]))
                        .then(pools[b].free_slots().cmp(&pools[a].free_slots()))
                })
                .unwrap_or(candidates[0]),
            BalancerStrategy::Weighted => candidates
                .iter()
                .copied()
                .max_by(|&a, &b| {
                    weighted_score(&pools[a], &pool_load)
                        .total_cmp(&weighted_score(&pools[b], &pool_load))
                        // Prefer the earlier pool on ties.
                        .then(b.cmp(&a))
                })
                .unwrap_or(candidates[0]),
        };
        Some(chosen)
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(BalancerStrategy::default())
    }
}

fn load_ratio<P: Routable>(pool: &P) -> f64 {
    let total = pool.in_flight() + pool.free_slots();
    if total == 0 {
        1.0
    } else {
        pool.in_flight() as f64 / total as f64
    }
}

fn weighted_score<P: Routable, L: Fn(&str) -> f64>(pool: &P, pool_load: &L) -> f64 {
    let free_fraction = 1.0 - load_ratio(pool);
    let headroom = (1.0 - pool_load(pool.name())).max(MIN_HEADROOM);
    pool.weight().max(0.0) * free_fraction * headroom
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockPool {
        name: &'static str,
        types: &'static [&'static str],
        free: usize,
        busy: usize,
        weight: f64,
    }

    impl Routable for MockPool {
        fn name(&self) -> &str {
            self.name
        }
        fn accepts(&self, request_type: &str) -> bool {
            self.types.is_empty() || self.types.contains(&request_type)
        }
        fn free_slots(&self) -> usize {
            self.free
        }
        fn capacity(&self) -> usize {
            self.free + self.busy
        }
        fn in_flight(&self) -> usize {
            self.busy
        }
        fn weight(&self) -> f64 {
            self.weight
        }
    }

    fn pool(name: &'static str, free: usize, busy: usize) -> MockPool {
        MockPool {
            name,
            types: &[],
            free,
            busy,
            weight: 1.0,
        }
    }

    fn no_load(_: &str) -> f64 {
        0.0
    }

    #[test]
    fn round_robin_cycles_through_candidates() {
        let pools = vec![pool("a", 1, 0), pool("b", 1, 0), pool("c", 1, 0)];
        let mut lb = LoadBalancer::new(BalancerStrategy::RoundRobin);
        let picks: Vec<_> = (0..4).filter_map(|_| lb.select(&pools, "t", no_load)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0]);
    }

    #[test]
    fn round_robin_skips_full_pools() {
        let pools = vec![pool("a", 1, 0), pool("b", 0, 4), pool("c", 1, 0)];
        let mut lb = LoadBalancer::new(BalancerStrategy::RoundRobin);
        assert_eq!(lb.select(&pools, "t", no_load), Some(0));
        assert_eq!(lb.select(&pools, "t", no_load), Some(2));
    }

    #[test]
    fn least_loaded_prefers_lowest_ratio() {
        let pools = vec![pool("a", 1, 3), pool("b", 3, 1)];
        let mut lb = LoadBalancer::new(BalancerStrategy::LeastLoaded);
        assert_eq!(lb.select(&pools, "t", no_load), Some(1));
    }

    #[test]
    fn weighted_uses_weight_and_ledger_load() {
        let mut heavy = pool("heavy", 2, 2);
        heavy.weight = 3.0;
        let pools = vec![pool("light", 2, 2), heavy];
        let mut lb = LoadBalancer::new(BalancerStrategy::Weighted);
        assert_eq!(lb.select(&pools, "t", no_load), Some(1));

        // Heavy pool's ledger share is saturated.
        let loaded = |name: &str| if name == "heavy" { 1.0 } else { 0.0 };
        assert_eq!(lb.select(&pools, "t", loaded), Some(0));
    }

    #[test]
    fn type_restrictions_with_fallback() {
        let mut gpu = pool("gpu", 1, 0);
        gpu.types = &["inference"];
        let pools = vec![pool("general", 1, 0), gpu];
        let mut lb = LoadBalancer::new(BalancerStrategy::LeastLoaded);
        assert_eq!(lb.select(&pools, "inference", no_load), Some(1));

        // Nobody restricts to "other" but "general" accepts everything.
        assert_eq!(lb.select(&pools, "other", no_load), Some(0));

        // Only restricted pools: fall back to any of them.
        let only_gpu = vec![{
            let mut p = pool("gpu", 1, 0);
            p.types = &["inference"];
            p
        }];
        assert_eq!(lb.select(&only_gpu, "sum", no_load), Some(0));
    }

    #[test]
    fn none_when_everything_is_full() {
        let pools = vec![pool("a", 0, 2)];
        let mut lb = LoadBalancer::default();
        assert_eq!(lb.select(&pools, "t", no_load), None);
    }
}
