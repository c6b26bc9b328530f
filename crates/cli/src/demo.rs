//! Demo handlers and a synthetic workload generator.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use sluice_core::{Priority, SubmitOptions};
use sluice_queue::{
    handler_fn, AggregateKind, HandlerError, Operation, OperationHandler, QueueManager,
};

use crate::config::WorkloadConfig;

pub const REQUEST_TYPES: [&str; 4] = ["sum", "sort", "sleep", "flaky"];

/// Register the demo handlers on `qm`.
pub fn register_handlers(qm: &QueueManager) {
    qm.register_handler(
        "sum",
        Arc::new(OperationHandler::new(vec![Operation::Aggregate(AggregateKind::Sum)])),
    );
    qm.register_handler(
        "sort",
        Arc::new(OperationHandler::new(vec![Operation::Sort { descending: false }])),
    );

    // Sleeps for `ms`, reporting progress and honouring cancellation.
    qm.register_handler(
        "sleep",
        handler_fn(|payload, ctx| async move {
            let ms = payload.get("ms").and_then(Value::as_u64).unwrap_or(10);
            let steps = 4u64;
            for step in 1..=steps {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms / steps)) => {}
                    _ = ctx.cancelled() => return Err(HandlerError::Cancelled),
                }
                ctx.report_progress(step as f64 / steps as f64 * 100.0);
            }
            Ok(json!({ "slept_ms": ms }))
        }),
    );

    // Fails its first `fail_attempts` attempts, then echoes the payload.
    qm.register_handler(
        "flaky",
        handler_fn(|payload, ctx| async move {
            let fail_attempts = payload.get("fail_attempts").and_then(Value::as_u64).unwrap_or(0);
            if u64::from(ctx.attempt) <= fail_attempts {
                return Err(HandlerError::failed(format!("attempt {} failed", ctx.attempt)));
            }
            Ok(json!({ "attempt": ctx.attempt, "payload": payload }))
        }),
    );
}

/// One synthetic submission.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub request_type: &'static str,
    pub payload: Value,
    pub options: SubmitOptions,
}

/// Deterministic mixed workload: request types, priorities and payloads
/// cycle, so repeated payloads exercise the cache.
pub fn workload(count: usize, failure_rate: f64, config: &WorkloadConfig) -> Vec<WorkItem> {
    let distinct = config.distinct_payloads.max(1);
    let fail_every = (failure_rate > 0.0).then(|| (1.0 / failure_rate.min(1.0)).round().max(1.0) as usize);

    (0..count)
        .map(|i| {
            let request_type = REQUEST_TYPES[i % REQUEST_TYPES.len()];
            let priority = Priority::ALL[i % Priority::ALL.len()];
            let variant = (i / REQUEST_TYPES.len()) % distinct;
            let (payload, options) = match request_type {
                "sum" | "sort" => {
                    let items: Vec<i64> = (0..=variant as i64).rev().collect();
                    (json!(items), SubmitOptions::new().cacheable())
                }
                "sleep" => {
                    let ms = (variant as u64 * 7) % config.max_sleep_ms.max(1);
                    (json!({ "ms": ms }), SubmitOptions::new())
                }
                _ => {
                    let round = i / REQUEST_TYPES.len();
                    let fail_attempts = u64::from(fail_every.is_some_and(|n| round % n == 0));
                    (json!({ "n": i, "fail_attempts": fail_attempts }), SubmitOptions::new())
                }
            };
            WorkItem {
                request_type,
                payload,
                options: options.priority(priority),
            }
        })
        .collect()
}
