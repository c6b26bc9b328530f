//! In-process request queue: priority scheduling, resource-aware dispatch,
//! result caching, worker pools with dynamic scaling, and metrics.

pub mod balancer;
pub mod cache;
pub mod error;
pub mod handler;
pub mod hooks;
pub mod manager;
pub mod metrics;
pub mod operation;
pub mod pool;
pub mod predictor;
pub mod resources;
pub mod scaler;
pub mod scheduler;
pub mod stats;

pub use balancer::{LoadBalancer, Routable};
pub use cache::{fingerprint, CacheRecord, CacheStats, RequestCache};
pub use error::{HandlerError, QueueError};
pub use handler::{handler_fn, sync_handler, ExecutionContext, RequestHandler, SharedHandler};
pub use hooks::{Hooks, SubscriptionId};
pub use manager::{ImportSummary, Origin, QueueManager, QueueSnapshot, QueueStatus, RequestHandle, SNAPSHOT_VERSION};
pub use metrics::{Alert, AlertLevel, Metric, MetricsSnapshot, QueueHealth, QueueMetrics, QueueMetricsCollector, Trend};
pub use operation::{AggregateKind, Operation, OperationHandler};
pub use pool::{PoolStats, UnitState, WorkerPool};
pub use predictor::{LoadObservation, LoadPredictor, Prediction};
pub use resources::{ResourceManager, ResourceProbe, ResourceSignal, StaticProbe, SystemProbe};
pub use scaler::{DynamicScaler, ScalerStats, ScalingDecision, ScalingEvent, ScalingVerdict};
pub use scheduler::{FailOutcome, PriorityScheduler, RequestInfo};
