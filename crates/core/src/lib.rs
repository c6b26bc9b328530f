//! Shared types for the sluice request queue: the request model, resource
//! vectors and the queue configuration.

pub mod config;
pub mod error;
pub mod request;
pub mod resource;

pub use config::{
    AlertThresholds, BalancerSection, BalancerStrategy, CacheSection, CapacityOverride,
    MetricsSection, PoolConfig, QueueConfig, QueueSection, ResourceSection, ScalingSection,
    ScalingWeights,
};
pub use error::CoreError;
pub use request::{
    CacheDirective, Priority, Request, RequestId, RequestStatus, RetryState, SubmitOptions,
};
pub use resource::{ResourceBudget, ResourceRequirements, ResourceSnapshot};
