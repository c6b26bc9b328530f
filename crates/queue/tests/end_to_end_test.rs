//! End-to-end behaviour of the queue through its public API: ordering
//! under a tight resource budget, duplicate suppression and bulk load.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;

use sluice_core::{Priority, QueueConfig, ResourceRequirements, SubmitOptions};
use sluice_queue::{handler_fn, sync_handler, HandlerError, Origin, QueueManager, StaticProbe};

const TIMEOUT: Duration = Duration::from_secs(5);
const GIB: u64 = 1024 * 1024 * 1024;

fn config() -> QueueConfig {
    let mut config = QueueConfig::default();
    config.queue.dispatch_interval_ms = 10;
    config.queue.retry_backoff_base_ms = 10;
    config.scaling.enabled = false;
    config
}

fn manager(config: QueueConfig, cores: usize) -> QueueManager {
    QueueManager::with_probe(config, Box::new(StaticProbe::with_cores(cores, 16 * GIB))).unwrap()
}

#[tokio::test]
async fn resource_budget_serialises_by_priority_then_fifo() {
    let qm = manager(config(), 2);
    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let order = Arc::clone(&order);
        qm.register_handler(
            "render",
            handler_fn(move |payload, _ctx| {
                let order = Arc::clone(&order);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    order.lock().unwrap().push(payload.clone());
                    Ok::<_, HandlerError>(payload)
                }
            }),
        );
    }

    // Each request wants the whole host, so only one can run at a time.
    let whole_host = ResourceRequirements::default().with_cpu(2.0);
    let opts = |p: Priority| SubmitOptions::new().priority(p).resources(whole_host.clone());

    let a = qm.submit_request("render", json!("A"), opts(Priority::Normal)).unwrap();
    let b = qm.submit_request("render", json!("B"), opts(Priority::Normal)).unwrap();
    let c = qm.submit_request("render", json!("CRITICAL"), opts(Priority::Critical)).unwrap();

    for handle in [a, b, c] {
        timeout(TIMEOUT, handle.wait()).await.unwrap().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![json!("CRITICAL"), json!("A"), json!("B")]);
    qm.shutdown().await;
}

#[tokio::test]
async fn duplicate_sum_runs_once_and_both_callers_agree() {
    let qm = manager(config(), 8);
    let executions = Arc::new(AtomicUsize::new(0));
    {
        let executions = Arc::clone(&executions);
        qm.register_handler(
            "sum",
            sync_handler(move |payload| {
                executions.fetch_add(1, Ordering::SeqCst);
                let total: f64 = payload
                    .as_array()
                    .ok_or_else(|| HandlerError::InvalidPayload("expected an array".into()))?
                    .iter()
                    .filter_map(Value::as_f64)
                    .sum();
                Ok(json!({ "total": total }))
            }),
        );
    }

    let opts = SubmitOptions::new().cacheable();
    let first = qm.submit_request("sum", json!([1, 2, 3]), opts.clone()).unwrap();
    let second = qm.submit_request("sum", json!([1, 2, 3]), opts).unwrap();
    assert_eq!(second.origin(), Origin::Joined);

    let (r1, r2) = tokio::join!(first.wait(), second.wait());
    let (r1, r2) = (r1.unwrap(), r2.unwrap());
    assert_eq!(r1, json!({ "total": 6.0 }));
    assert_eq!(r1, r2);
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    qm.shutdown().await;
}

#[tokio::test]
async fn bulk_load_drains_completely() {
    let qm = manager(config(), 8);
    qm.register_handler(
        "square",
        handler_fn(|payload, _ctx| async move {
            let n = payload
                .as_i64()
                .ok_or_else(|| HandlerError::InvalidPayload("expected an integer".into()))?;
            Ok::<_, HandlerError>(json!(n * n))
        }),
    );

    let priorities = [Priority::Low, Priority::Normal, Priority::High, Priority::Background];
    let handles: Vec<_> = (0..50i64)
        .map(|i| {
            let opts = SubmitOptions::new().priority(priorities[i as usize % priorities.len()]);
            (i, qm.submit_request("square", json!(i), opts).unwrap())
        })
        .collect();

    for (i, handle) in handles {
        let out = timeout(TIMEOUT, handle.wait()).await.unwrap().unwrap();
        assert_eq!(out, json!(i * i));
    }

    let status = qm.queue_status();
    assert_eq!(status.pending, 0);
    assert_eq!(status.active, 0);
    assert_eq!(status.completed, 50);
    assert_eq!(qm.metrics().counters.submitted, 50);
    qm.shutdown().await;
}
