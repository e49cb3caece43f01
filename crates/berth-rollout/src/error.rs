//! Error types for verification, dispatch and the workflow engine.

use berth_core::{ErrorKind, ExecutionRef, PlanError, Stage, SystemName, TransitionError, ValidationError};
use berth_state::StorageError;
use thiserror::Error;
use uuid::Uuid;

use crate::dispatcher::DispatchStep;

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

impl CollaboratorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("infrastructure not ready: {}", join(unready))]
    InfraUnready { unready: Vec<SystemName> },

    #[error("dispatch failed at {step} after {attempts} attempt(s): {message}")]
    Dispatch {
        step: DispatchStep,
        attempts: u32,
        message: String,
    },

    #[error("{operation} timed out after {after_ms} ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("collaborator error during {stage}: {source}")]
    Collaborator {
        stage: Stage,
        #[source]
        source: CollaboratorError,
    },

    #[error("deployment {id} is {stage} and can no longer change")]
    Terminal { id: Uuid, stage: Stage },

    #[error("deployment {id} cannot be rolled back from {stage}")]
    RollbackUnavailable { id: Uuid, stage: Stage },

    #[error("unknown execution: {0}")]
    UnknownExecution(ExecutionRef),

    /// The request was failed, but its issue could not be raised.
    #[error("deployment {id} failed ({failure}); raising its issue failed after {attempts} attempt(s): {message}")]
    IssueEmission {
        id: Uuid,
        failure: String,
        attempts: u32,
        message: String,
    },
}

fn join(systems: &[SystemName]) -> String {
    systems
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl RolloutError {
    /// Classification recorded on failed requests and issues.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RolloutError::Validation(_) | RolloutError::RollbackUnavailable { .. } => {
                ErrorKind::Validation
            }
            RolloutError::Plan(PlanError::Validation(_)) => ErrorKind::Validation,
            RolloutError::Plan(PlanError::UnsupportedService { .. }) => {
                ErrorKind::UnsupportedService
            }
            RolloutError::Plan(PlanError::UnallocatableService { .. }) => {
                ErrorKind::UnallocatableService
            }
            RolloutError::InfraUnready { .. } => ErrorKind::InfraUnready,
            RolloutError::Dispatch { .. } => ErrorKind::Dispatch,
            RolloutError::Timeout { .. } => ErrorKind::Timeout,
            RolloutError::Collaborator { .. }
            | RolloutError::Storage(_)
            | RolloutError::Transition(_)
            | RolloutError::Terminal { .. }
            | RolloutError::UnknownExecution(_)
            | RolloutError::IssueEmission { .. } => ErrorKind::Collaborator,
        }
    }
}

pub type RolloutResult<T> = std::result::Result<T, RolloutError>;

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::ServiceType;

    #[test]
    fn test_infra_unready_lists_systems() {
        let err = RolloutError::InfraUnready {
            unready: vec![SystemName::Artifact, SystemName::Gitops],
        };
        assert_eq!(
            err.to_string(),
            "infrastructure not ready: artifact, gitops"
        );
        assert_eq!(err.kind(), ErrorKind::InfraUnready);
    }

    #[test]
    fn test_dispatch_display() {
        let err = RolloutError::Dispatch {
            step: DispatchStep::Push,
            attempts: 3,
            message: "registry 503".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("push"));
        assert!(msg.contains("3 attempt"));
        assert_eq!(err.kind(), ErrorKind::Dispatch);
    }

    #[test]
    fn test_issue_emission_keeps_original_failure() {
        let err = RolloutError::IssueEmission {
            id: Uuid::nil(),
            failure: "build timed out after 100 ms".to_string(),
            attempts: 3,
            message: "tracker down".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("build timed out"));
        assert!(msg.contains("3 attempt"));
        assert!(msg.contains("tracker down"));
        assert_eq!(err.kind(), ErrorKind::Collaborator);
    }

    #[test]
    fn test_plan_error_kinds() {
        let err: RolloutError = PlanError::UnallocatableService {
            service: ServiceType::Qa,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::UnallocatableService);

        let err: RolloutError = ValidationError::NoServiceDemand.into();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
