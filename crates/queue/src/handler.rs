//! Request handler trait and the execution context handed to handlers.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sluice_core::RequestId;
use tokio::sync::watch;

use crate::error::HandlerError;

/// Boxed handler as stored in the registry.
pub type SharedHandler = Arc<dyn RequestHandler>;

/// Executes requests of one type inside an execution unit.
///
/// Implementations should poll [`ExecutionContext::cancelled`] (or check
/// [`ExecutionContext::is_cancelled`]) at convenient points; cancellation
/// is cooperative and a handler that ignores it is aborted after a grace
/// period.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, payload: Value, ctx: ExecutionContext) -> Result<Value, HandlerError>;
}

// ── Cancellation ──────────────────────────────────────────────

/// Sending half of a cancellation signal, kept by the execution unit.
#[derive(Debug)]
pub struct CancelTrigger {
    tx: watch::Sender<bool>,
}

impl CancelTrigger {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiving half, observed by the handler.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn pair() -> (CancelTrigger, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelTrigger { tx }, CancelToken { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the
    /// trigger is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ── Execution context ─────────────────────────────────────────

type ProgressSink = Arc<dyn Fn(RequestId, f64) + Send + Sync>;

/// Per-attempt context passed to a handler.
#[derive(Clone)]
pub struct ExecutionContext {
    pub request_id: RequestId,
    pub request_type: String,
    /// 1 for the first attempt, incremented on every retry.
    pub attempt: u32,
    cancel: CancelToken,
    progress: Option<ProgressSink>,
}

impl ExecutionContext {
    pub(crate) fn new(
        request_id: RequestId,
        request_type: String,
        attempt: u32,
        cancel: CancelToken,
        progress: ProgressSink,
    ) -> Self {
        Self {
            request_id,
            request_type,
            attempt,
            cancel,
            progress: Some(progress),
        }
    }

    /// A context with no unit behind it, for calling handlers directly.
    pub fn detached(request_type: impl Into<String>) -> Self {
        let (_trigger, cancel) = CancelToken::pair();
        Self {
            request_id: RequestId::new(),
            request_type: request_type.into(),
            attempt: 1,
            cancel,
            progress: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Report progress in percent (clamped to 0..=100).
    pub fn report_progress(&self, percent: f64) {
        if let Some(sink) = &self.progress {
            sink(self.request_id, percent.clamp(0.0, 100.0));
        }
    }

    /// Shorthand for handlers that poll between work steps.
    pub fn check_cancelled(&self) -> Result<(), HandlerError> {
        if self.is_cancelled() {
            Err(HandlerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("request_id", &self.request_id)
            .field("request_type", &self.request_type)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ── Closure adapters ──────────────────────────────────────────

/// Adapts an async closure into a [`RequestHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: Value, ctx: ExecutionContext) -> Result<Value, HandlerError> {
        (self.f)(payload, ctx).await
    }
}

/// Wrap an async closure as a shared handler.
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

struct BlockingHandler<F> {
    f: Arc<F>,
}

#[async_trait]
impl<F> RequestHandler for BlockingHandler<F>
where
    F: Fn(Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    async fn handle(&self, payload: Value, _ctx: ExecutionContext) -> Result<Value, HandlerError> {
        let f = Arc::clone(&self.f);
        tokio::task::spawn_blocking(move || f(payload))
            .await
            .map_err(|e| HandlerError::Failed(format!("blocking handler aborted: {e}")))?
    }
}

/// Wrap a synchronous, possibly CPU-heavy function. It runs on the
/// blocking thread pool and cannot observe cancellation.
pub fn sync_handler<F>(f: F) -> SharedHandler
where
    F: Fn(Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    Arc::new(BlockingHandler { f: Arc::new(f) })
}
