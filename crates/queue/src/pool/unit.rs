//! A single execution unit: a tokio task that runs up to N requests at a
//! time and talks to the coordinator only through channels.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sluice_core::RequestId;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{HandlerError, QueueError};
use crate::handler::{CancelToken, CancelTrigger, ExecutionContext, SharedHandler};

/// How long a cancelled handler may keep running before it is aborted.
pub const CANCEL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Work handed to a unit.
pub struct Assignment {
    pub request_id: RequestId,
    pub request_type: String,
    pub payload: Value,
    /// 1-based attempt number.
    pub attempt: u32,
    pub timeout: Duration,
    pub handler: SharedHandler,
}

impl fmt::Debug for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assignment")
            .field("request_id", &self.request_id)
            .field("request_type", &self.request_type)
            .field("attempt", &self.attempt)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Coordinator → unit.
#[derive(Debug)]
pub enum UnitCommand {
    Execute(Assignment),
    Cancel(RequestId),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(Value),
    Failed(QueueError),
    Cancelled,
}

/// Unit → coordinator.
#[derive(Debug)]
pub enum UnitEvent {
    Progress {
        request_id: RequestId,
        percent: f64,
    },
    Finished {
        pool: Arc<str>,
        unit: UnitId,
        request_id: RequestId,
        outcome: ExecutionOutcome,
        elapsed: Duration,
    },
    /// The unit task ended. `fault` is set when it died abnormally.
    Exited {
        pool: Arc<str>,
        unit: UnitId,
        fault: Option<String>,
    },
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawn a unit and a watcher that reports its exit. Returns the inbox.
pub(crate) fn spawn_unit(
    pool: Arc<str>,
    id: UnitId,
    events: mpsc::UnboundedSender<UnitEvent>,
) -> mpsc::UnboundedSender<UnitCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = tokio::spawn(run_unit(Arc::clone(&pool), id, rx, events.clone()));
    tokio::spawn(async move {
        let fault = match worker.await {
            Ok(()) => None,
            Err(e) if e.is_panic() => Some("unit panicked".to_string()),
            Err(e) => Some(format!("unit aborted: {e}")),
        };
        if let Some(reason) = &fault {
            warn!(pool = %pool, unit = %id, reason = %reason, "execution unit died");
        }
        let _ = events.send(UnitEvent::Exited { pool, unit: id, fault });
    });
    tx
}

async fn run_unit(
    pool: Arc<str>,
    id: UnitId,
    mut inbox: mpsc::UnboundedReceiver<UnitCommand>,
    events: mpsc::UnboundedSender<UnitEvent>,
) {
    debug!(pool = %pool, unit = %id, "unit started");
    let mut running: JoinSet<(RequestId, ExecutionOutcome, Duration)> = JoinSet::new();
    let mut triggers: HashMap<RequestId, CancelTrigger> = HashMap::new();

    loop {
        tokio::select! {
            cmd = inbox.recv() => match cmd {
                Some(UnitCommand::Execute(assignment)) => {
                    let (trigger, token) = CancelToken::pair();
                    triggers.insert(assignment.request_id, trigger);
                    running.spawn(execute(assignment, token, events.clone()));
                }
                Some(UnitCommand::Cancel(request_id)) => {
                    if let Some(trigger) = triggers.get(&request_id) {
                        debug!(unit = %id, request_id = %request_id, "cancel requested");
                        trigger.cancel();
                    }
                }
                Some(UnitCommand::Shutdown) | None => break,
            },
            Some(joined) = running.join_next(), if !running.is_empty() => {
                // `execute` never panics itself; handler panics are caught inside it.
                let Ok((request_id, outcome, elapsed)) = joined else { continue };
                triggers.remove(&request_id);
                let _ = events.send(UnitEvent::Finished {
                    pool: Arc::clone(&pool),
                    unit: id,
                    request_id,
                    outcome,
                    elapsed,
                });
            }
        }
    }

    for trigger in triggers.values() {
        trigger.cancel();
    }
    running.abort_all();
    info!(pool = %pool, unit = %id, "unit stopped");
}

/// Run one attempt with timeout and cooperative cancellation.
async fn execute(
    assignment: Assignment,
    token: CancelToken,
    events: mpsc::UnboundedSender<UnitEvent>,
) -> (RequestId, ExecutionOutcome, Duration) {
    let started = Instant::now();
    let Assignment {
        request_id,
        request_type,
        payload,
        attempt,
        timeout,
        handler,
    } = assignment;

    let progress = Arc::new(move |id: RequestId, percent: f64| {
        let _ = events.send(UnitEvent::Progress {
            request_id: id,
            percent,
        });
    });
    let ctx = ExecutionContext::new(request_id, request_type, attempt, token.clone(), progress);
    let mut task = AbortOnDrop(tokio::spawn(async move { handler.handle(payload, ctx).await }));

    let outcome = tokio::select! {
        res = tokio::time::timeout(timeout, &mut task.0) => match res {
            Ok(Ok(Ok(value))) => ExecutionOutcome::Completed(value),
            Ok(Ok(Err(HandlerError::Cancelled))) => ExecutionOutcome::Cancelled,
            Ok(Ok(Err(e))) => ExecutionOutcome::Failed(e.into()),
            Ok(Err(join)) if join.is_panic() => {
                ExecutionOutcome::Failed(QueueError::WorkerFault("handler panicked".into()))
            }
            Ok(Err(join)) => {
                ExecutionOutcome::Failed(QueueError::WorkerFault(format!("handler aborted: {join}")))
            }
            Err(_) => ExecutionOutcome::Failed(QueueError::Timeout(timeout)),
        },
        _ = cancelled_past_grace(&token) => ExecutionOutcome::Cancelled,
    };
    drop(task);
    (request_id, outcome, started.elapsed())
}

async fn cancelled_past_grace(token: &CancelToken) {
    token.cancelled().await;
    tokio::time::sleep(CANCEL_GRACE).await;
}
