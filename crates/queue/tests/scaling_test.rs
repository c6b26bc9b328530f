//! Dynamic scaling driven by the coordinator: direction, bounds and
//! cooldown.

use std::time::Duration;

use sluice_core::{PoolConfig, QueueConfig, ScalingWeights};
use sluice_queue::{QueueManager, StaticProbe};

const GIB: u64 = 1024 * 1024 * 1024;

/// Scaling driven by host utilization alone, evaluated every tick.
fn config(min: usize, max: usize) -> QueueConfig {
    let mut config = QueueConfig::default();
    config.queue.dispatch_interval_ms = 10;
    config.scaling.evaluate_interval_secs = 0;
    config.scaling.cooldown_secs = 60;
    config.scaling.weights = ScalingWeights {
        cpu: 1.0,
        memory: 1.0,
        queue: 0.0,
        latency: 0.0,
    };
    config.pools = vec![PoolConfig {
        min_workers: min,
        max_workers: max,
        auto_scale: false,
        ..PoolConfig::named("elastic")
    }];
    config
}

fn manager_with_usage(config: QueueConfig, cpu: f64, memory: f64) -> QueueManager {
    let probe = StaticProbe::with_cores(4, 8 * GIB);
    probe.usage_handle().set(cpu, memory);
    QueueManager::with_probe(config, Box::new(probe)).unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn hot_host_scales_up_once_within_cooldown() {
    let qm = manager_with_usage(config(1, 6), 0.95, 0.95);
    settle().await;

    let events = qm.scaling_events();
    assert_eq!(events.len(), 1, "cooldown should suppress repeats: {events:?}");
    assert_eq!(events[0].pool, "elastic");
    assert_eq!((events[0].from, events[0].to), (1, 2));
    assert!(events[0].success);
    assert_eq!(qm.queue_status().pools[0].size, 2);

    let stats = qm.scaler_stats();
    assert_eq!(stats.scale_ups, 1);
    assert!(stats.evaluations > 1);
    qm.shutdown().await;
}

#[tokio::test]
async fn idle_host_scales_down_toward_min() {
    let qm = manager_with_usage(config(1, 8), 0.0, 0.0);
    assert_eq!(qm.scale_pool("elastic", 5).unwrap(), 5);
    settle().await;

    let events = qm.scaling_events();
    assert_eq!(events.len(), 1);
    assert_eq!((events[0].from, events[0].to), (5, 4));
    assert_eq!(qm.queue_status().pools[0].size, 4);
    qm.shutdown().await;
}

#[tokio::test]
async fn growth_stops_at_host_worker_budget() {
    // 8 GiB at 4 GiB per worker leaves room for two workers.
    let mut config = config(1, 6);
    config.scaling.cooldown_secs = 0;
    config.resources.memory_per_worker = 4 * GIB;
    let qm = manager_with_usage(config, 0.95, 0.95);
    settle().await;

    let events = qm.scaling_events();
    assert_eq!(events.len(), 1, "{events:?}");
    assert_eq!((events[0].from, events[0].to), (1, 2));
    assert!(events[0].reason.contains("host capacity"));
    assert_eq!(qm.queue_status().pools[0].size, 2);
    qm.shutdown().await;
}

#[tokio::test]
async fn pool_at_max_is_left_alone() {
    let qm = manager_with_usage(config(2, 2), 1.0, 1.0);
    settle().await;

    assert!(qm.scaling_events().is_empty());
    assert_eq!(qm.queue_status().pools[0].size, 2);
    qm.shutdown().await;
}

#[tokio::test]
async fn disabled_scaler_records_nothing() {
    let mut config = config(1, 6);
    config.scaling.enabled = false;
    let qm = manager_with_usage(config, 0.95, 0.95);
    settle().await;

    assert!(qm.scaling_events().is_empty());
    assert_eq!(qm.queue_status().pools[0].size, 1);
    qm.shutdown().await;
}
