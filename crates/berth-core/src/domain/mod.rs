//! Domain models for Berth.
//!
//! - `ChannelRequirements`: validated per-service channel demand
//! - `ResourceBundle` / `ServerAllocation`: sized infrastructure
//! - `CostEstimate`: monthly cost per provider
//! - `DeploymentRequest`: a rollout and its append-only stage history
//! - `Stage`: the workflow state machine

pub mod bundle;
pub mod context;
pub mod deployment;
pub mod error;
pub mod service;
pub mod stage;

pub use bundle::{
    CostEstimate, CostLineItem, CustomResources, Provider, ResourceBundle, ResourcePlan,
    ServerAllocation, ServiceDemand,
};
pub use context::CallContext;
pub use deployment::{
    AnalysisReport, Complexity, DeploymentConfig, DeploymentInputs, DeploymentRequest,
    DeploymentStrategy, DetectedService, ErrorKind, ExecutionRef, FailureDetail, HealthStatus,
    InfraReport, InfrastructureHealth, InputsEdit, Issue, NewDeployment, RequestStatus, Severity,
    StageResult, StageStatus, SystemName, TargetEnvironment,
};
pub use error::{PlanError, PlanResult, TransitionError, ValidationError};
pub use service::{ChannelRequirements, Preset, ServiceChannelRequirement, ServiceType};
pub use stage::{validate_history, HistoryViolation, Stage};
