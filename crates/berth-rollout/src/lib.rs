//! Berth rollout: verification, dispatch and the deployment workflow engine.
//!
//! - `InfraVerifier`: concurrent, time-bounded health checks per subsystem
//! - `ExecutionDispatcher`: build → push → sync with bounded retry
//! - `WorkflowEngine`: the per-request state machine and namespace locking
//! - `simulated`: in-process collaborators for local runs and tests

pub mod collaborators;
pub mod dispatcher;
pub mod engine;
mod error;
pub mod http_probe;
pub mod locks;
pub mod retry;
pub mod simulated;
pub mod verifier;

pub use collaborators::{
    ArtifactRef, ArtifactStore, BuildJob, BuildOutput, BuildService, CollaboratorResult,
    GitOpsSync, HealthProbe, RepositoryAnalyzer, SyncTarget,
};
pub use dispatcher::{
    CompensationRequest, DispatchStep, ExecutionDispatcher, ExecutionPhase, ExecutionStatus,
    StepFailure,
};
pub use engine::{
    effective_input, Collaborators, EngineFootprint, WorkflowEngine, MIN_DETECTION_CONFIDENCE,
};
pub use error::{CollaboratorError, RolloutError, RolloutResult};
pub use http_probe::HttpHealthProbe;
pub use locks::{NamespaceGuard, NamespaceLocks};
pub use retry::{retry_with_backoff, AttemptError, RetryExhausted};
pub use verifier::InfraVerifier;
