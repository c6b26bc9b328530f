use thiserror::Error;

use crate::request::RequestStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown priority: {0}")]
    UnknownPriority(String),

    #[error("invalid request id: {0}")]
    InvalidId(String),

    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition {
        from: RequestStatus,
        to: RequestStatus,
    },
}
