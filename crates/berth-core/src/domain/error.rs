//! Domain-level error taxonomy for Berth.

use super::stage::Stage;
use super::service::ServiceType;

/// Errors produced by input validation, before any stage starts.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("channel count for {service} must be non-negative, got {count}")]
    NegativeChannelCount { service: String, count: i64 },

    #[error("channel count for {service} exceeds the supported maximum: {count}")]
    ChannelCountOverflow { service: String, count: i64 },

    #[error("service {service} listed more than once")]
    DuplicateService { service: String },

    #[error("malformed channel entry: {0}")]
    MalformedEntry(String),

    #[error("no service demand: at least one service needs a positive channel count")]
    NoServiceDemand,

    #[error("invalid custom resources: {0}")]
    InvalidCustomResources(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },

    #[error("inputs can no longer be edited once the request reached {stage}")]
    InputsFrozen { stage: Stage },
}

/// Errors produced by capacity estimation and bundle allocation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("unsupported service type: {service}")]
    UnsupportedService { service: String },

    #[error("no server template family can host service {service}")]
    UnallocatableService { service: ServiceType },
}

/// Result type for planning operations.
pub type PlanResult<T> = std::result::Result<T, PlanError>;

/// A stage transition that the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid stage transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: Stage,
    pub to: Stage,
}
