//! Typed operation pipelines registered as ordinary handlers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;

use sluice_core::{QueueConfig, SubmitOptions};
use sluice_queue::{AggregateKind, Operation, OperationHandler, QueueError, QueueManager, StaticProbe};

const TIMEOUT: Duration = Duration::from_secs(5);

fn manager() -> QueueManager {
    let mut config = QueueConfig::default();
    config.queue.dispatch_interval_ms = 10;
    config.scaling.enabled = false;
    QueueManager::with_probe(config, Box::new(StaticProbe::with_cores(4, 8 * 1024 * 1024 * 1024))).unwrap()
}

#[tokio::test]
async fn sort_filter_transform_pipeline() {
    let qm = manager();
    let pipeline = OperationHandler::new(vec![
        Operation::filter(|v| v.as_i64().is_some_and(|n| n % 2 == 1)),
        Operation::transform(|v| json!(v.as_i64().unwrap_or(0) * 10)),
        Operation::Sort { descending: true },
    ]);
    qm.register_handler("odd_tens", Arc::new(pipeline));

    let handle = qm
        .submit_request("odd_tens", json!([4, 7, 1, 8, 3]), SubmitOptions::new())
        .unwrap();
    let out = timeout(TIMEOUT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(out, json!([70, 30, 10]));
    qm.shutdown().await;
}

#[tokio::test]
async fn aggregate_reports_progress_per_step() {
    let qm = manager();
    let pipeline = OperationHandler::default()
        .then(Operation::Sort { descending: false })
        .then(Operation::Aggregate(AggregateKind::Max));
    qm.register_handler("max", Arc::new(pipeline));

    let progress = Arc::new(Mutex::new(Vec::new()));
    {
        let progress = Arc::clone(&progress);
        qm.on_progress(move |_, pct| progress.lock().unwrap().push(pct));
    }

    let handle = qm.submit_request("max", json!([2, 9, 4]), SubmitOptions::new()).unwrap();
    let out = timeout(TIMEOUT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(out, json!(9));

    for _ in 0..100 {
        if progress.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*progress.lock().unwrap(), vec![50.0, 100.0]);
    qm.shutdown().await;
}

#[tokio::test]
async fn non_array_payload_fails_the_request() {
    let qm = manager();
    qm.register_handler(
        "sum",
        Arc::new(OperationHandler::new(vec![Operation::Aggregate(AggregateKind::Sum)])),
    );
    let handle = qm
        .submit_request("sum", Value::String("nope".into()), SubmitOptions::new().max_retries(0))
        .unwrap();
    let err = timeout(TIMEOUT, handle.wait()).await.unwrap().unwrap_err();
    assert!(matches!(err, QueueError::Execution(ref msg) if msg.contains("invalid payload")), "got {err:?}");
    qm.shutdown().await;
}
