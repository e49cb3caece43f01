//! Deployment requests and their append-only stage history.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::bundle::{CostEstimate, CustomResources, ResourceBundle};
use super::error::{TransitionError, ValidationError};
use super::service::{ChannelRequirements, ServiceType};
use super::stage::Stage;

/// Environment a request deploys into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetEnvironment {
    Development,
    Staging,
    Production,
}

impl TargetEnvironment {
    pub const ALL: [TargetEnvironment; 3] = [
        TargetEnvironment::Development,
        TargetEnvironment::Staging,
        TargetEnvironment::Production,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetEnvironment::Development => "development",
            TargetEnvironment::Staging => "staging",
            TargetEnvironment::Production => "production",
        }
    }
}

impl fmt::Display for TargetEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetEnvironment {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(TargetEnvironment::Development),
            "staging" | "stg" => Ok(TargetEnvironment::Staging),
            "production" | "prod" | "prd" => Ok(TargetEnvironment::Production),
            other => Err(ValidationError::MalformedEntry(format!(
                "unknown target environment '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

/// Outcome recorded for one stage entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failed,
    /// The stage ran but its checkpoint did not pass; the caller may retry.
    Retried,
}

/// One immutable entry of a request's stage history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub status: StageStatus,
    pub output: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Version of [`DeploymentInputs`] this stage consumed.
    pub inputs_version: u32,
}

/// Error classes surfaced on failed requests and issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    UnsupportedService,
    UnallocatableService,
    InfraUnready,
    Dispatch,
    Timeout,
    Collaborator,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::UnsupportedService => "unsupported_service",
            ErrorKind::UnallocatableService => "unallocatable_service",
            ErrorKind::InfraUnready => "infra_unready",
            ErrorKind::Dispatch => "dispatch",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Collaborator => "collaborator",
        }
    }
}

/// Originating stage and raw error detail of a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
}

/// Operator-editable inputs, versioned so every stage knows what it consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentInputs {
    pub version: u32,
    pub declared_services: Vec<ServiceType>,
    pub channel_counts: ChannelRequirements,
    pub custom_resources: Option<CustomResources>,
}

impl Default for DeploymentInputs {
    fn default() -> Self {
        Self {
            version: 1,
            declared_services: Vec::new(),
            channel_counts: ChannelRequirements::new(),
            custom_resources: None,
        }
    }
}

/// A partial edit of [`DeploymentInputs`]; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputsEdit {
    pub declared_services: Option<Vec<ServiceType>>,
    pub channel_counts: Option<ChannelRequirements>,
    pub custom_resources: Option<CustomResources>,
    #[serde(default)]
    pub clear_custom_resources: bool,
}

impl DeploymentInputs {
    /// Apply an edit and bump the version when anything changed.
    pub fn apply(&mut self, edit: InputsEdit) -> Result<bool, ValidationError> {
        if let Some(custom) = &edit.custom_resources {
            custom.validate()?;
        }

        let before = self.clone();
        if let Some(mut services) = edit.declared_services {
            services.sort();
            services.dedup();
            self.declared_services = services;
        }
        if let Some(counts) = edit.channel_counts {
            self.channel_counts = counts;
        }
        if edit.clear_custom_resources {
            self.custom_resources = None;
        }
        if let Some(custom) = edit.custom_resources {
            self.custom_resources = Some(custom);
        }

        let changed = *self != before;
        if changed {
            self.version = before.version + 1;
        }
        Ok(changed)
    }
}

/// Estimated complexity of the analysed repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
    Critical,
}

/// A service detected by repository analysis. `service_type` is untrusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedService {
    #[serde(rename = "type")]
    pub service_type: String,
    pub confidence: f64,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Output of the repository-analysis collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub detected_services: Vec<DetectedService>,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    pub complexity: Complexity,
}

/// Subsystems checked before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemName {
    Build,
    Artifact,
    Gitops,
    Cluster,
}

impl SystemName {
    pub const ALL: [SystemName; 4] = [
        SystemName::Build,
        SystemName::Artifact,
        SystemName::Gitops,
        SystemName::Cluster,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemName::Build => "build",
            SystemName::Artifact => "artifact",
            SystemName::Gitops => "gitops",
            SystemName::Cluster => "cluster",
        }
    }
}

impl fmt::Display for SystemName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        SystemName::ALL
            .iter()
            .copied()
            .find(|n| n.as_str() == needle)
            .ok_or_else(|| ValidationError::MalformedEntry(format!("unknown subsystem '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unreachable,
}

/// Health of one subsystem at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfrastructureHealth {
    pub system_name: SystemName,
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Result of one verification pass over every required subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraReport {
    pub environment: TargetEnvironment,
    pub entries: Vec<InfrastructureHealth>,
    pub all_ready: bool,
}

impl InfraReport {
    pub fn new(environment: TargetEnvironment, entries: Vec<InfrastructureHealth>) -> Self {
        let all_ready =
            !entries.is_empty() && entries.iter().all(|e| e.status == HealthStatus::Healthy);
        Self {
            environment,
            entries,
            all_ready,
        }
    }

    /// Subsystems that are not healthy.
    pub fn unready(&self) -> Vec<SystemName> {
        self.entries
            .iter()
            .filter(|e| e.status != HealthStatus::Healthy)
            .map(|e| e.system_name)
            .collect()
    }
}

/// Rollout strategy selected during config generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStrategy {
    Recreate,
    RollingUpdate,
    BlueGreen,
    Canary,
}

/// Generated deployment configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub cluster: String,
    pub namespace: String,
    pub domains: BTreeMap<ServiceType, String>,
    pub strategy: DeploymentStrategy,
    /// Role name → instance count.
    pub replicas: BTreeMap<String, u32>,
    /// SHA-256 of the fields above, for change detection.
    pub digest: String,
}

/// Handle to an in-flight or finished dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionRef(pub Uuid);

impl ExecutionRef {
    pub fn new() -> Self {
        ExecutionRef(Uuid::new_v4())
    }
}

impl Default for ExecutionRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Submission payload: a repository and a target environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeployment {
    pub project_name: String,
    pub repository_url: String,
    pub branch: String,
    pub target_environment: TargetEnvironment,
    #[serde(default)]
    pub inputs: DeploymentInputs,
}

impl NewDeployment {
    pub fn new(
        project_name: impl Into<String>,
        repository_url: impl Into<String>,
        branch: impl Into<String>,
        target_environment: TargetEnvironment,
    ) -> Self {
        Self {
            project_name: project_name.into(),
            repository_url: repository_url.into(),
            branch: branch.into(),
            target_environment,
            inputs: DeploymentInputs::default(),
        }
    }

    pub fn with_inputs(mut self, inputs: DeploymentInputs) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.project_name.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "project_name",
            });
        }
        if self.repository_url.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "repository_url",
            });
        }
        if self.branch.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "branch" });
        }
        if let Some(custom) = &self.inputs.custom_resources {
            custom.validate()?;
        }
        Ok(())
    }
}

/// A project rollout, owned exclusively by the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub id: Uuid,
    pub project_name: String,
    pub repository_url: String,
    pub branch: String,
    pub target_environment: TargetEnvironment,
    pub stage: Stage,
    pub status: RequestStatus,
    pub inputs: DeploymentInputs,
    pub analysis: Option<AnalysisReport>,
    pub resource_bundle: Option<ResourceBundle>,
    pub cost_estimates: Vec<CostEstimate>,
    pub config: Option<DeploymentConfig>,
    pub infra_health: Option<InfraReport>,
    /// Operator-visible count of verification attempts at the infra checkpoint.
    pub infra_retry_count: u32,
    pub execution_ref: Option<ExecutionRef>,
    pub failure: Option<FailureDetail>,
    /// Optimistic-concurrency version, maintained by the store.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stage_history: Vec<StageResult>,
}

impl DeploymentRequest {
    /// Create a pending request with its submission entry recorded.
    pub fn new(submission: NewDeployment) -> Self {
        let now = Utc::now();
        let submitted = StageResult {
            stage: Stage::Pending,
            status: StageStatus::Success,
            output: json!({
                "repository_url": &submission.repository_url,
                "branch": &submission.branch,
                "target_environment": submission.target_environment,
            }),
            started_at: now,
            completed_at: now,
            retry_count: 0,
            inputs_version: submission.inputs.version,
        };
        Self {
            id: Uuid::new_v4(),
            project_name: submission.project_name,
            repository_url: submission.repository_url,
            branch: submission.branch,
            target_environment: submission.target_environment,
            stage: Stage::Pending,
            status: RequestStatus::Active,
            inputs: submission.inputs,
            analysis: None,
            resource_bundle: None,
            cost_estimates: Vec::new(),
            config: None,
            infra_health: None,
            infra_retry_count: 0,
            execution_ref: None,
            failure: None,
            version: 0,
            created_at: now,
            updated_at: now,
            stage_history: vec![submitted],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == RequestStatus::Cancelled
    }

    /// Move along a state-machine edge and append the matching history entry.
    ///
    /// `status` is `Retried` when the stage was entered but its checkpoint
    /// did not pass.
    pub fn enter(
        &mut self,
        to: Stage,
        status: StageStatus,
        output: serde_json::Value,
        started_at: DateTime<Utc>,
        retry_count: u32,
    ) -> Result<(), TransitionError> {
        if matches!(to, Stage::Failed | Stage::Cancelled) || !self.stage.can_transition_to(to) {
            return Err(TransitionError {
                from: self.stage,
                to,
            });
        }
        self.push(to, status, output, started_at, retry_count);
        self.stage = to;
        if to == Stage::Completed {
            self.status = RequestStatus::Completed;
        }
        Ok(())
    }

    /// Record another attempt at a retryable checkpoint without moving.
    pub fn record_retry(
        &mut self,
        status: StageStatus,
        output: serde_json::Value,
        started_at: DateTime<Utc>,
        retry_count: u32,
    ) -> Result<(), TransitionError> {
        if !self.stage.is_retryable_checkpoint() || self.is_terminal() {
            return Err(TransitionError {
                from: self.stage,
                to: self.stage,
            });
        }
        self.push(self.stage, status, output, started_at, retry_count);
        Ok(())
    }

    /// Fail the request at its current stage.
    pub fn fail(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Result<FailureDetail, TransitionError> {
        self.fail_during(self.stage, kind, message, started_at)
    }

    /// Fail the request, attributing the failure to `origin`: the current
    /// stage, or the stage it was moving into when that stage's work failed.
    pub fn fail_during(
        &mut self,
        origin: Stage,
        kind: ErrorKind,
        message: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Result<FailureDetail, TransitionError> {
        let attributable = origin == self.stage
            || (self.stage.successor() == Some(origin) && !origin.is_terminal());
        if !self.stage.can_transition_to(Stage::Failed) || !attributable {
            return Err(TransitionError {
                from: self.stage,
                to: Stage::Failed,
            });
        }
        let detail = FailureDetail {
            stage: origin,
            kind,
            message: message.into(),
        };
        self.push(
            origin,
            StageStatus::Failed,
            json!({ "kind": kind, "message": &detail.message }),
            started_at,
            0,
        );
        self.stage = Stage::Failed;
        self.status = RequestStatus::Failed;
        self.failure = Some(detail.clone());
        Ok(detail)
    }

    /// Cancel the request; only ever user-initiated.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        if !self.stage.can_transition_to(Stage::Cancelled) {
            return Err(TransitionError {
                from: self.stage,
                to: Stage::Cancelled,
            });
        }
        let now = Utc::now();
        let from = self.stage;
        self.push(
            Stage::Cancelled,
            StageStatus::Success,
            json!({ "cancelled_from": from, "reason": reason.into() }),
            now,
            0,
        );
        self.stage = Stage::Cancelled;
        self.status = RequestStatus::Cancelled;
        Ok(())
    }

    fn push(
        &mut self,
        stage: Stage,
        status: StageStatus,
        output: serde_json::Value,
        started_at: DateTime<Utc>,
        retry_count: u32,
    ) {
        let now = Utc::now();
        self.stage_history.push(StageResult {
            stage,
            status,
            output,
            started_at,
            completed_at: now,
            retry_count,
            inputs_version: self.inputs.version,
        });
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Failure report emitted to the issue-tracking collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub deployment_request_id: Uuid,
    pub stage: Stage,
    pub severity: Severity,
    pub message: String,
    pub auto_created: bool,
    pub created_at: DateTime<Utc>,
}

impl Issue {
    /// Build the issue raised for a failed request.
    pub fn for_failure(
        request_id: Uuid,
        environment: TargetEnvironment,
        failure: &FailureDetail,
    ) -> Self {
        let severity = if environment == TargetEnvironment::Production {
            Severity::Critical
        } else if matches!(failure.kind, ErrorKind::Dispatch | ErrorKind::Timeout) {
            Severity::High
        } else {
            Severity::Medium
        };
        Self {
            id: Uuid::new_v4(),
            deployment_request_id: request_id,
            stage: failure.stage,
            severity,
            message: format!("[{}] {}", failure.kind.as_str(), failure.message),
            auto_created: true,
            created_at: Utc::now(),
        }
    }
}
