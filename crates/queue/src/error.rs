//! Queue error types.

use std::time::Duration;

use sluice_core::{CoreError, RequestId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueueError {
    /// Queue at capacity; the request was never queued.
    #[error("queue at capacity ({capacity} pending)")]
    Admission { capacity: usize },

    /// The handler returned a failure.
    #[error("execution failed: {0}")]
    Execution(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The execution unit itself failed (panic, dropped channel).
    #[error("worker fault: {0}")]
    WorkerFault(String),

    /// Requirement does not fit right now; the request stays pending.
    #[error("insufficient capacity for request {0}")]
    CapacityDenied(RequestId),

    #[error("request not found: {0}")]
    NotFound(RequestId),

    #[error("request cancelled")]
    Cancelled,

    #[error("no handler registered for request type '{0}'")]
    NoHandler(String),

    #[error("queue is shut down")]
    Shutdown,

    #[error("import failed: {0}")]
    Import(String),

    #[error(transparent)]
    Config(#[from] CoreError),
}

impl QueueError {
    /// Execution, timeout and worker faults are retried with backoff;
    /// everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::Execution(_) | QueueError::Timeout(_) | QueueError::WorkerFault(_)
        )
    }

    /// Short tag used for metrics and alert labels.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueError::Admission { .. } => "admission",
            QueueError::Execution(_) => "execution",
            QueueError::Timeout(_) => "timeout",
            QueueError::WorkerFault(_) => "worker_fault",
            QueueError::CapacityDenied(_) => "capacity_denied",
            QueueError::NotFound(_) => "not_found",
            QueueError::Cancelled => "cancelled",
            QueueError::NoHandler(_) => "no_handler",
            QueueError::Shutdown => "shutdown",
            QueueError::Import(_) => "import",
            QueueError::Config(_) => "config",
        }
    }
}

/// Error returned by a request handler.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    /// The handler observed cancellation and stopped early.
    #[error("cancelled")]
    Cancelled,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

impl From<HandlerError> for QueueError {
    fn from(e: HandlerError) -> Self {
        match e {
            HandlerError::Cancelled => QueueError::Cancelled,
            other => QueueError::Execution(other.to_string()),
        }
    }
}
