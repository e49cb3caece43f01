//! Deployment workflow engine.
//!
//! Drives a [`DeploymentRequest`] through
//!
//! ```text
//! Pending → Analyzing → ResourcePlanning → ConfigGeneration
//!         → InfraVerification → Executing → Monitoring → Completed
//! ```
//!
//! - `advance` performs exactly one transition; calls for the same request
//!   are serialized, different requests run independently.
//! - Every transition is one compare-and-swap on the store, so a snapshot
//!   never shows a request between two recorded stages.
//! - A failure is attributed to the stage whose work failed: a planning
//!   error at `ResourcePlanning`, a failed push at `Executing`.
//! - `cancel` does not wait for `advance`. An in-flight call finishes, its
//!   commit loses the compare-and-swap and the result is discarded.
//! - `Executing` holds a per-(cluster, namespace) lock until the request
//!   completes, fails or is cancelled.
//! - Per-request bookkeeping (call gate, execution record, namespace slot)
//!   is dropped once the request is terminal.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use berth_core::obs;
use berth_core::{
    generate_config, CallContext, DeploymentRequest, EngineConfig, ExecutionRef, InputsEdit,
    Issue, NewDeployment, PlanResult, Preset, RequestStatus, ResourceCalculationInput,
    ResourcePlanner, ServiceType, Stage, StageStatus, SystemName, TransitionError,
    ValidationError, METRICS,
};
use berth_state::{DeploymentStore, IssueSink, StorageError};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::collaborators::{
    ArtifactStore, BuildService, GitOpsSync, HealthProbe, RepositoryAnalyzer,
};
use crate::dispatcher::{
    sync_target, CompensationRequest, DispatchStep, ExecutionDispatcher, ExecutionPhase,
    ExecutionStatus,
};
use crate::error::{CollaboratorError, RolloutError, RolloutResult};
use crate::locks::{NamespaceGuard, NamespaceLocks};
use crate::retry::{retry_with_backoff, RetryExhausted};
use crate::verifier::InfraVerifier;

/// Detected services below this confidence are ignored during planning.
pub const MIN_DETECTION_CONFIDENCE: f64 = 0.5;

/// External subsystems the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub analyzer: Arc<dyn RepositoryAnalyzer>,
    pub probes: BTreeMap<SystemName, Arc<dyn HealthProbe>>,
    pub build: Arc<dyn BuildService>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub gitops: Arc<dyn GitOpsSync>,
}

/// Outcome of a versioned write.
enum Commit {
    Applied(DeploymentRequest),
    /// A concurrent cancel or input edit won; the stage result was dropped.
    Superseded(DeploymentRequest),
}

impl Commit {
    fn into_request(self) -> DeploymentRequest {
        match self {
            Commit::Applied(r) | Commit::Superseded(r) => r,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn timeout_error(operation: &str, after: Duration) -> RolloutError {
    RolloutError::Timeout {
        operation: operation.to_string(),
        after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
    }
}

/// Errors that move the request to `Failed`. Storage and state-machine
/// errors are the engine's own and leave the request untouched.
fn fails_request(error: &RolloutError) -> bool {
    matches!(
        error,
        RolloutError::Validation(_)
            | RolloutError::Plan(_)
            | RolloutError::Dispatch { .. }
            | RolloutError::Timeout { .. }
            | RolloutError::Collaborator { .. }
            | RolloutError::UnknownExecution(_)
    )
}

/// The request is terminal once this result is observed.
fn settled(result: &RolloutResult<DeploymentRequest>) -> bool {
    match result {
        Ok(request) => request.is_terminal(),
        Err(RolloutError::Terminal { .. } | RolloutError::IssueEmission { .. }) => true,
        Err(error) => fails_request(error),
    }
}

/// Stage whose work runs when advancing from `stage`.
fn working_stage(stage: Stage) -> Stage {
    match stage {
        Stage::Pending => Stage::Analyzing,
        Stage::Analyzing => Stage::ResourcePlanning,
        Stage::ResourcePlanning => Stage::ConfigGeneration,
        Stage::ConfigGeneration => Stage::InfraVerification,
        other => other,
    }
}

/// Sizes of the engine's per-request tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineFootprint {
    pub gates: usize,
    pub held_namespaces: usize,
    pub namespace_slots: usize,
    pub executions: usize,
}

/// Resource-calculation input for a request's current inputs and analysis.
///
/// Custom resources win. Otherwise the services are the declared ones plus
/// confidently detected ones, each sized by its channel count or, when the
/// operator gave none, by the standard preset.
pub fn effective_input(request: &DeploymentRequest) -> PlanResult<ResourceCalculationInput> {
    let inputs = &request.inputs;
    if let Some(custom) = &inputs.custom_resources {
        return Ok(ResourceCalculationInput::CustomResources(custom.clone()));
    }

    let mut services: BTreeSet<ServiceType> = inputs.declared_services.iter().copied().collect();
    if let Some(report) = &request.analysis {
        for detected in report
            .detected_services
            .iter()
            .filter(|d| d.confidence >= MIN_DETECTION_CONFIDENCE)
        {
            services.insert(detected.service_type.parse()?);
        }
    }

    let defaults = Preset::Standard.requirements();
    let mut requirements = inputs.channel_counts.clone();
    for service in services {
        if !requirements.contains(service) {
            requirements.set(service, defaults.get(service).unwrap_or(0));
        }
    }
    Ok(ResourceCalculationInput::ChannelRequirements(requirements))
}

pub struct WorkflowEngine {
    config: EngineConfig,
    store: Arc<dyn DeploymentStore>,
    issues: Arc<dyn IssueSink>,
    analyzer: Arc<dyn RepositoryAnalyzer>,
    gitops: Arc<dyn GitOpsSync>,
    planner: ResourcePlanner,
    verifier: InfraVerifier,
    dispatcher: ExecutionDispatcher,
    compensations: AsyncMutex<mpsc::UnboundedReceiver<CompensationRequest>>,
    namespaces: NamespaceLocks,
    held: Mutex<HashMap<Uuid, NamespaceGuard>>,
    gates: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl WorkflowEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn DeploymentStore>,
        issues: Arc<dyn IssueSink>,
        collaborators: Collaborators,
    ) -> Self {
        let verifier =
            InfraVerifier::with_probes(config.timeouts.health_check(), collaborators.probes);
        let (dispatcher, compensations) = ExecutionDispatcher::new(
            collaborators.build,
            collaborators.artifacts,
            Arc::clone(&collaborators.gitops),
            config.retry.clone(),
            config.timeouts.dispatch_step(),
        );
        Self {
            config,
            store,
            issues,
            analyzer: collaborators.analyzer,
            gitops: collaborators.gitops,
            planner: ResourcePlanner::default(),
            verifier,
            dispatcher,
            compensations: AsyncMutex::new(compensations),
            namespaces: NamespaceLocks::new(),
            held: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the built-in estimator, allocator and price tables.
    pub fn with_planner(mut self, planner: ResourcePlanner) -> Self {
        self.planner = planner;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn verifier(&self) -> &InfraVerifier {
        &self.verifier
    }

    pub fn footprint(&self) -> EngineFootprint {
        EngineFootprint {
            gates: lock(&self.gates).len(),
            held_namespaces: lock(&self.held).len(),
            namespace_slots: self.namespaces.len(),
            executions: self.dispatcher.tracked(),
        }
    }

    /// Validate and persist a new request in `Pending`.
    pub async fn submit(
        &self,
        ctx: &CallContext,
        submission: NewDeployment,
    ) -> RolloutResult<DeploymentRequest> {
        submission.validate()?;
        let request = DeploymentRequest::new(submission);
        let stored = self.store.insert(&request).await?;
        METRICS.inc_requests_submitted();
        obs::emit_request_submitted(
            stored.id,
            &stored.project_name,
            stored.target_environment.as_str(),
        );
        debug!(deployment_id = %stored.id, principal = %ctx.principal, "request submitted");
        Ok(stored)
    }

    pub async fn get(&self, id: Uuid) -> RolloutResult<DeploymentRequest> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list(&self) -> RolloutResult<Vec<DeploymentRequest>> {
        Ok(self.store.list().await?)
    }

    pub async fn issues_for(&self, id: Uuid) -> RolloutResult<Vec<Issue>> {
        Ok(self.issues.issues_for(id).await?)
    }

    /// Progress of the request's build → push → sync execution.
    ///
    /// `None` before dispatch and after a finished execution was released.
    pub async fn execution_status(&self, id: Uuid) -> RolloutResult<Option<ExecutionStatus>> {
        let request = self.store.get(id).await?;
        let Some(exec) = request.execution_ref else {
            return Ok(None);
        };
        match self.dispatcher.poll(exec) {
            Ok(status) => Ok(Some(status)),
            Err(RolloutError::UnknownExecution(_)) if request.stage != Stage::Executing => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Edit the operator inputs. Allowed until resource planning consumes them.
    pub async fn update_inputs(
        &self,
        id: Uuid,
        edit: InputsEdit,
    ) -> RolloutResult<DeploymentRequest> {
        loop {
            let current = self.store.get(id).await?;
            if current.is_terminal() {
                return Err(RolloutError::Terminal {
                    id,
                    stage: current.stage,
                });
            }
            if !matches!(current.stage, Stage::Pending | Stage::Analyzing) {
                return Err(ValidationError::InputsFrozen {
                    stage: current.stage,
                }
                .into());
            }
            let mut next = current.clone();
            if !next.inputs.apply(edit.clone())? {
                return Ok(current);
            }
            match self.store.update(&next, current.version).await {
                Ok(stored) => {
                    info!(
                        event = "deployment.inputs_updated",
                        deployment_id = %id,
                        inputs_version = stored.inputs.version,
                    );
                    return Ok(stored);
                }
                Err(StorageError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Perform one transition and return the committed snapshot.
    ///
    /// An unready infrastructure check is not an error: the request stays at
    /// `InfraVerification` with a `retried` entry. Errors that fail the
    /// request are returned after the failure and its issue are recorded;
    /// when the issue cannot be raised the caller gets `IssueEmission`.
    pub async fn advance(&self, ctx: &CallContext, id: Uuid) -> RolloutResult<DeploymentRequest> {
        let gate = self.gate(id);
        let result = {
            let _serial = gate.lock().await;
            self.step(ctx, id)
                .instrument(obs::deployment_span(id))
                .await
        };
        if settled(&result) {
            lock(&self.gates).remove(&id);
        }
        result
    }

    /// Advance until the infrastructure gate blocks or the request is terminal.
    pub async fn run_until_checkpoint(
        &self,
        ctx: &CallContext,
        id: Uuid,
    ) -> RolloutResult<DeploymentRequest> {
        loop {
            let request = self.advance(ctx, id).await?;
            if request.is_terminal() || blocked_at_checkpoint(&request) {
                return Ok(request);
            }
        }
    }

    /// Cancel a non-terminal request. In-flight calls are not waited for.
    pub async fn cancel(
        &self,
        ctx: &CallContext,
        id: Uuid,
        reason: &str,
    ) -> RolloutResult<DeploymentRequest> {
        loop {
            let current = self.store.get(id).await?;
            if current.is_terminal() {
                return Err(RolloutError::Terminal {
                    id,
                    stage: current.stage,
                });
            }
            let mut next = current.clone();
            next.cancel(format!("{} (by {})", reason, ctx.principal))?;
            match self.store.update(&next, current.version).await {
                Ok(stored) => {
                    self.release(id);
                    if let Some(exec) = stored.execution_ref {
                        self.dispatcher.forget(exec);
                    }
                    lock(&self.gates).remove(&id);
                    METRICS.inc_stages_committed();
                    obs::emit_cancelled(id, current.stage);
                    return Ok(stored);
                }
                Err(StorageError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Ask GitOps to revert the namespace of a finished request.
    ///
    /// The request itself is left as it is.
    pub async fn rollback(&self, ctx: &CallContext, id: Uuid) -> RolloutResult<()> {
        let request = self.store.get(id).await?;
        let finished = matches!(
            request.status,
            RequestStatus::Completed | RequestStatus::Failed
        );
        if !finished || request.config.is_none() || request.execution_ref.is_none() {
            return Err(RolloutError::RollbackUnavailable {
                id,
                stage: request.stage,
            });
        }
        let target = sync_target(&request)?;
        let limit = self.config.timeouts.dispatch_step();
        match timeout(limit, self.gitops.revert(ctx, &target)).await {
            Ok(Ok(())) => {
                info!(
                    event = "deployment.rolled_back",
                    deployment_id = %id,
                    cluster = %target.cluster,
                    namespace = %target.namespace,
                );
                Ok(())
            }
            Ok(Err(source)) => Err(RolloutError::Collaborator {
                stage: request.stage,
                source,
            }),
            Err(_) => Err(timeout_error("rollback", limit)),
        }
    }

    /// Run pending compensating actions requested by the dispatcher.
    ///
    /// Returns how many were handled.
    pub async fn process_compensations(&self, ctx: &CallContext) -> usize {
        let mut rx = self.compensations.lock().await;
        let limit = self.config.timeouts.dispatch_step();
        let mut handled = 0;
        while let Ok(request) = rx.try_recv() {
            let CompensationRequest::Stop {
                deployment_id,
                execution_ref,
                target,
                failed_step,
            } = request;
            match timeout(limit, self.gitops.stop(ctx, &target)).await {
                Ok(Ok(())) => info!(
                    event = "compensation.stopped",
                    deployment_id = %deployment_id,
                    execution_id = %execution_ref,
                    failed_step = %failed_step,
                    namespace = %target.namespace,
                ),
                Ok(Err(e)) => warn!(
                    deployment_id = %deployment_id,
                    error = %e,
                    "compensating stop failed"
                ),
                Err(_) => warn!(
                    deployment_id = %deployment_id,
                    "compensating stop timed out"
                ),
            }
            handled += 1;
        }
        handled
    }

    fn gate(&self, id: Uuid) -> Arc<AsyncMutex<()>> {
        Arc::clone(lock(&self.gates).entry(id).or_default())
    }

    fn release(&self, id: Uuid) {
        if let Some(guard) = lock(&self.held).remove(&id) {
            debug!(
                deployment_id = %id,
                cluster = guard.cluster(),
                namespace = guard.namespace(),
                "namespace released"
            );
        }
    }

    async fn step(&self, ctx: &CallContext, id: Uuid) -> RolloutResult<DeploymentRequest> {
        let current = self.store.get(id).await?;
        let started = Utc::now();
        let clock = Instant::now();
        let outcome = match current.stage {
            Stage::Pending => self.analyze(ctx, &current, started, clock).await,
            Stage::Analyzing => self.plan(&current, started, clock).await,
            Stage::ResourcePlanning => self.configure(&current, started, clock).await,
            Stage::ConfigGeneration | Stage::InfraVerification => {
                self.verify(ctx, &current, started, clock).await
            }
            Stage::Executing => self.execute(ctx, &current, started, clock).await,
            Stage::Monitoring => self.complete(&current, started, clock).await,
            Stage::Completed | Stage::Failed | Stage::Cancelled => {
                return Err(RolloutError::Terminal {
                    id,
                    stage: current.stage,
                })
            }
        };
        match outcome {
            Err(error) if fails_request(&error) => {
                self.fail_request(id, working_stage(current.stage), started, error)
                    .await
            }
            other => other,
        }
    }

    /// Write `apply(current)` with compare-and-swap.
    ///
    /// On conflict the fresh snapshot is re-used when only unrelated fields
    /// moved; otherwise the work is superseded.
    async fn commit<F>(
        &self,
        current: &DeploymentRequest,
        clock: Instant,
        consumes_inputs: bool,
        apply: F,
    ) -> RolloutResult<Commit>
    where
        F: Fn(&mut DeploymentRequest) -> Result<(), TransitionError>,
    {
        let mut base = current.clone();
        loop {
            let mut next = base.clone();
            apply(&mut next)?;
            match self.store.update(&next, base.version).await {
                Ok(stored) => {
                    if stored.stage != base.stage {
                        METRICS.inc_stages_committed();
                        obs::emit_stage_committed(
                            stored.id,
                            base.stage,
                            stored.stage,
                            u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
                        );
                    }
                    return Ok(Commit::Applied(stored));
                }
                Err(StorageError::VersionConflict { .. }) => {
                    let fresh = self.store.get(base.id).await?;
                    let superseded = fresh.is_terminal()
                        || fresh.stage != base.stage
                        || (consumes_inputs && fresh.inputs.version != base.inputs.version);
                    if superseded {
                        debug!(
                            deployment_id = %fresh.id,
                            stage = %fresh.stage,
                            "stage result discarded"
                        );
                        return Ok(Commit::Superseded(fresh));
                    }
                    base = fresh;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Record the failure, attributed to `origin`, then raise its issue.
    async fn fail_request(
        &self,
        id: Uuid,
        origin: Stage,
        started: DateTime<Utc>,
        error: RolloutError,
    ) -> RolloutResult<DeploymentRequest> {
        let kind = error.kind();
        let message = error.to_string();
        loop {
            let current = self.store.get(id).await?;
            if current.is_terminal() {
                // Cancelled while the failing call was in flight.
                self.release(id);
                return Ok(current);
            }
            let during = if origin == current.stage || current.stage.successor() == Some(origin) {
                origin
            } else {
                current.stage
            };
            let mut next = current.clone();
            let detail = next.fail_during(during, kind, &message, started)?;
            match self.store.update(&next, current.version).await {
                Ok(stored) => {
                    self.release(id);
                    if let Some(exec) = stored.execution_ref {
                        self.dispatcher.forget(exec);
                    }
                    METRICS.inc_stages_committed();
                    obs::emit_stage_failed(id, detail.stage, kind, &message);
                    let issue = Issue::for_failure(id, stored.target_environment, &detail);
                    self.raise_issue(&issue, &message).await?;
                    return Err(error);
                }
                Err(StorageError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Raise `issue` under the retry policy, each attempt bounded by the
    /// issue timeout. The request stays failed either way.
    async fn raise_issue(&self, issue: &Issue, failure: &str) -> RolloutResult<()> {
        let id = issue.deployment_request_id;
        let result = retry_with_backoff(
            &self.config.retry,
            self.config.timeouts.issue(),
            |attempt, error| {
                debug!(deployment_id = %id, attempt, error = %error, "issue raise retrying");
            },
            |_| async move {
                self.issues
                    .raise(issue)
                    .await
                    .map_err(|e| CollaboratorError::new(e.to_string()))
            },
        )
        .await;
        match result {
            Ok(((), _)) => {
                METRICS.inc_issues_raised();
                obs::emit_issue_raised(id, issue.id, issue.stage);
                Ok(())
            }
            Err(RetryExhausted { attempts, last }) => {
                warn!(
                    event = "issue.emission_failed",
                    deployment_id = %id,
                    issue_id = %issue.id,
                    attempts,
                    error = %last,
                );
                Err(RolloutError::IssueEmission {
                    id,
                    failure: failure.to_string(),
                    attempts,
                    message: last.to_string(),
                })
            }
        }
    }

    async fn analyze(
        &self,
        ctx: &CallContext,
        current: &DeploymentRequest,
        started: DateTime<Utc>,
        clock: Instant,
    ) -> RolloutResult<DeploymentRequest> {
        let limit = self.config.timeouts.analysis();
        let call = self
            .analyzer
            .analyze(ctx, &current.repository_url, &current.branch);
        let report = match timeout(limit, call).await {
            Ok(Ok(report)) => report,
            Ok(Err(source)) => {
                return Err(RolloutError::Collaborator {
                    stage: Stage::Analyzing,
                    source,
                })
            }
            Err(_) => return Err(timeout_error("repository analysis", limit)),
        };
        let output = json!({
            "detected_services": &report.detected_services,
            "framework": &report.framework,
            "language": &report.language,
            "complexity": report.complexity,
        });
        let commit = self
            .commit(current, clock, false, |next| {
                next.analysis = Some(report.clone());
                next.enter(Stage::Analyzing, StageStatus::Success, output.clone(), started, 0)
            })
            .await?;
        Ok(commit.into_request())
    }

    async fn plan(
        &self,
        current: &DeploymentRequest,
        started: DateTime<Utc>,
        clock: Instant,
    ) -> RolloutResult<DeploymentRequest> {
        let input = effective_input(current)?;
        let plan = self.planner.plan(&input)?;
        let output = json!({
            "instances": plan.bundle.instance_count(),
            "cpu_cores": plan.bundle.cpu_cores,
            "memory_gb": plan.bundle.memory_gb,
            "storage_gb": plan.bundle.storage_gb,
            "gpu_count": plan.bundle.gpu_count,
            "providers": plan.costs.iter().map(|c| c.provider).collect::<Vec<_>>(),
        });
        let commit = self
            .commit(current, clock, true, |next| {
                next.resource_bundle = Some(plan.bundle.clone());
                next.cost_estimates = plan.costs.clone();
                next.enter(
                    Stage::ResourcePlanning,
                    StageStatus::Success,
                    output.clone(),
                    started,
                    0,
                )
            })
            .await?;
        Ok(commit.into_request())
    }

    async fn configure(
        &self,
        current: &DeploymentRequest,
        started: DateTime<Utc>,
        clock: Instant,
    ) -> RolloutResult<DeploymentRequest> {
        let bundle = current
            .resource_bundle
            .as_ref()
            .filter(|b| !b.is_empty())
            .ok_or(ValidationError::EmptyField {
                field: "resource_bundle",
            })?;
        let complexity = current.analysis.as_ref().map(|a| a.complexity);
        let config = generate_config(
            &current.project_name,
            current.target_environment,
            bundle,
            complexity,
            &self.config,
        )?;
        let output = json!({
            "cluster": &config.cluster,
            "namespace": &config.namespace,
            "strategy": config.strategy,
            "domains": &config.domains,
            "digest": &config.digest,
        });
        let commit = self
            .commit(current, clock, false, |next| {
                next.config = Some(config.clone());
                next.enter(
                    Stage::ConfigGeneration,
                    StageStatus::Success,
                    output.clone(),
                    started,
                    0,
                )
            })
            .await?;
        Ok(commit.into_request())
    }

    async fn verify(
        &self,
        ctx: &CallContext,
        current: &DeploymentRequest,
        started: DateTime<Utc>,
        clock: Instant,
    ) -> RolloutResult<DeploymentRequest> {
        let report = self.verifier.verify(ctx, current.target_environment).await;
        let attempt = current.infra_retry_count + 1;
        let unready: Vec<String> = report.unready().iter().map(|s| s.to_string()).collect();
        let output = json!({
            "all_ready": report.all_ready,
            "unready": &unready,
            "attempt": attempt,
        });
        let entering = current.stage == Stage::ConfigGeneration;

        if entering || !report.all_ready {
            if !report.all_ready {
                obs::emit_checkpoint_blocked(current.id, attempt, &unready);
            }
            let status = if report.all_ready {
                StageStatus::Success
            } else {
                StageStatus::Retried
            };
            let commit = self
                .commit(current, clock, false, |next| {
                    next.infra_health = Some(report.clone());
                    next.infra_retry_count = attempt;
                    if entering {
                        next.enter(
                            Stage::InfraVerification,
                            status,
                            output.clone(),
                            started,
                            attempt - 1,
                        )
                    } else {
                        next.record_retry(status, output.clone(), started, attempt - 1)
                    }
                })
                .await?;
            return Ok(commit.into_request());
        }

        let target = current.config.as_ref().ok_or(ValidationError::EmptyField {
            field: "config",
        })?;
        let Some(guard) = self
            .acquire_namespace(current.id, &target.cluster, &target.namespace)
            .await?
        else {
            return Ok(self.store.get(current.id).await?);
        };
        let namespace_output = json!({
            "cluster": guard.cluster(),
            "namespace": guard.namespace(),
            "attempt": attempt,
        });
        lock(&self.held).insert(current.id, guard);

        let commit = self
            .commit(current, clock, false, |next| {
                next.infra_health = Some(report.clone());
                next.infra_retry_count = attempt;
                next.enter(
                    Stage::Executing,
                    StageStatus::Success,
                    namespace_output.clone(),
                    started,
                    attempt - 1,
                )
            })
            .await;
        match commit {
            Ok(Commit::Applied(stored)) => Ok(stored),
            Ok(Commit::Superseded(fresh)) => {
                self.release(current.id);
                Ok(fresh)
            }
            Err(e) => {
                self.release(current.id);
                Err(e)
            }
        }
    }

    /// Wait for the namespace, giving up if the request is cancelled meanwhile.
    async fn acquire_namespace(
        &self,
        id: Uuid,
        cluster: &str,
        namespace: &str,
    ) -> RolloutResult<Option<NamespaceGuard>> {
        let poll = self.config.timeouts.poll_interval();
        loop {
            if let Some(guard) = self.namespaces.try_acquire(cluster, namespace) {
                return Ok(Some(guard));
            }
            debug!(deployment_id = %id, cluster, namespace, "namespace busy");
            tokio::time::sleep(poll).await;
            if self.store.get(id).await?.is_terminal() {
                return Ok(None);
            }
        }
    }

    async fn execute(
        &self,
        ctx: &CallContext,
        current: &DeploymentRequest,
        started: DateTime<Utc>,
        clock: Instant,
    ) -> RolloutResult<DeploymentRequest> {
        let id = current.id;
        let (base, exec): (DeploymentRequest, ExecutionRef) = match current.execution_ref {
            Some(exec) => (current.clone(), exec),
            None => {
                let exec = self.dispatcher.dispatch(ctx, current)?;
                let commit = self
                    .commit(current, clock, false, |next| {
                        next.execution_ref = Some(exec);
                        Ok(())
                    })
                    .await?;
                match commit {
                    Commit::Applied(stored) => (stored, exec),
                    Commit::Superseded(fresh) => return Ok(fresh),
                }
            }
        };

        let deadline = self.config.timeouts.execution_deadline();
        let poll = self.config.timeouts.poll_interval();
        loop {
            let status = match self.dispatcher.poll(exec) {
                Ok(status) => status,
                Err(error) => {
                    // Released by a concurrent cancel.
                    let fresh = self.store.get(id).await?;
                    if fresh.is_terminal() {
                        return Ok(fresh);
                    }
                    return Err(error);
                }
            };
            match status.phase {
                ExecutionPhase::Succeeded => {
                    let output = json!({
                        "execution_ref": exec,
                        "retries": status.retries,
                        "logs_tail": &status.logs_tail,
                    });
                    let commit = self
                        .commit(&base, clock, false, |next| {
                            next.enter(
                                Stage::Monitoring,
                                StageStatus::Success,
                                output.clone(),
                                started,
                                status.retries,
                            )
                        })
                        .await?;
                    self.dispatcher.forget(exec);
                    return Ok(commit.into_request());
                }
                ExecutionPhase::Failed => {
                    self.process_compensations(ctx).await;
                    return Err(match status.failure {
                        Some(failure) if failure.timed_out => timeout_error(
                            &format!("{} step", failure.step),
                            self.config.timeouts.dispatch_step(),
                        ),
                        Some(failure) => RolloutError::Dispatch {
                            step: failure.step,
                            attempts: failure.attempts,
                            message: failure.message,
                        },
                        None => RolloutError::Dispatch {
                            step: status.current_step.unwrap_or(DispatchStep::Build),
                            attempts: 0,
                            message: "execution failed".to_string(),
                        },
                    });
                }
                ExecutionPhase::Running => {}
            }

            if clock.elapsed() >= deadline {
                return Err(timeout_error("execution", deadline));
            }
            tokio::time::sleep(poll).await;
            let fresh = self.store.get(id).await?;
            if fresh.is_terminal() {
                debug!(deployment_id = %id, execution_id = %exec, "execution result discarded");
                return Ok(fresh);
            }
        }
    }

    async fn complete(
        &self,
        current: &DeploymentRequest,
        started: DateTime<Utc>,
        clock: Instant,
    ) -> RolloutResult<DeploymentRequest> {
        let output = json!({
            "execution_ref": current.execution_ref,
            "namespace": current.config.as_ref().map(|c| c.namespace.as_str()),
        });
        let commit = self
            .commit(current, clock, false, |next| {
                next.enter(
                    Stage::Completed,
                    StageStatus::Success,
                    output.clone(),
                    started,
                    0,
                )
            })
            .await?;
        self.release(current.id);
        Ok(commit.into_request())
    }
}

fn blocked_at_checkpoint(request: &DeploymentRequest) -> bool {
    request.stage == Stage::InfraVerification
        && request
            .stage_history
            .last()
            .is_some_and(|entry| entry.status == StageStatus::Retried)
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{
        AnalysisReport, ChannelRequirements, Complexity, CustomResources, DetectedService,
        TargetEnvironment,
    };

    fn request_with(analysis: Option<AnalysisReport>) -> DeploymentRequest {
        let mut req = DeploymentRequest::new(NewDeployment::new(
            "Voice",
            "https://git.example.com/acme/voice.git",
            "main",
            TargetEnvironment::Staging,
        ));
        req.analysis = analysis;
        req
    }

    fn report(services: &[(&str, f64)]) -> AnalysisReport {
        AnalysisReport {
            detected_services: services
                .iter()
                .map(|(t, c)| DetectedService {
                    service_type: t.to_string(),
                    confidence: *c,
                    domain: None,
                })
                .collect(),
            framework: None,
            language: None,
            complexity: Complexity::Medium,
        }
    }

    fn requirements(input: ResourceCalculationInput) -> ChannelRequirements {
        match input {
            ResourceCalculationInput::ChannelRequirements(r) => r,
            other => panic!("unexpected input {other:?}"),
        }
    }

    #[test]
    fn test_detected_services_use_preset_defaults() {
        let req = request_with(Some(report(&[("tts", 0.9), ("qa", 0.7)])));
        let reqs = requirements(effective_input(&req).unwrap());
        assert_eq!(reqs.get(ServiceType::Tts), Some(10));
        assert_eq!(reqs.get(ServiceType::Qa), Some(5));
        assert_eq!(reqs.len(), 2);
    }

    #[test]
    fn test_low_confidence_detection_ignored() {
        let req = request_with(Some(report(&[("tts", 0.9), ("stt", 0.2)])));
        let reqs = requirements(effective_input(&req).unwrap());
        assert!(!reqs.contains(ServiceType::Stt));
    }

    #[test]
    fn test_operator_counts_override_defaults() {
        let mut req = request_with(Some(report(&[("tts", 0.9)])));
        req.inputs.channel_counts = ChannelRequirements::new().with(ServiceType::Tts, 120);
        req.inputs.declared_services = vec![ServiceType::Chatbot];
        let reqs = requirements(effective_input(&req).unwrap());
        assert_eq!(reqs.get(ServiceType::Tts), Some(120));
        assert_eq!(reqs.get(ServiceType::Chatbot), Some(20));
    }

    #[test]
    fn test_unknown_detected_type_is_unsupported() {
        let req = request_with(Some(report(&[("hologram", 0.99)])));
        assert!(matches!(
            effective_input(&req),
            Err(berth_core::PlanError::UnsupportedService { .. })
        ));
    }

    #[test]
    fn test_custom_resources_take_precedence() {
        let mut req = request_with(Some(report(&[("tts", 0.9)])));
        req.inputs.custom_resources = Some(CustomResources {
            cpu_cores: 8.0,
            memory_gb: 32.0,
            storage_gb: 100.0,
            gpu_count: 0,
            gpu_type: None,
        });
        assert!(matches!(
            effective_input(&req).unwrap(),
            ResourceCalculationInput::CustomResources(_)
        ));
    }

    #[test]
    fn test_fails_request_classification() {
        assert!(fails_request(&RolloutError::Timeout {
            operation: "analysis".to_string(),
            after_ms: 1,
        }));
        assert!(!fails_request(&RolloutError::Storage(StorageError::Backend(
            "down".to_string()
        ))));
        assert!(!fails_request(&RolloutError::InfraUnready { unready: vec![] }));
        assert!(!fails_request(&RolloutError::IssueEmission {
            id: Uuid::nil(),
            failure: "x".to_string(),
            attempts: 1,
            message: "y".to_string(),
        }));
    }

    #[test]
    fn test_failures_attributed_to_working_stage() {
        assert_eq!(working_stage(Stage::Pending), Stage::Analyzing);
        assert_eq!(working_stage(Stage::Analyzing), Stage::ResourcePlanning);
        assert_eq!(working_stage(Stage::ResourcePlanning), Stage::ConfigGeneration);
        assert_eq!(working_stage(Stage::ConfigGeneration), Stage::InfraVerification);
        assert_eq!(working_stage(Stage::InfraVerification), Stage::InfraVerification);
        assert_eq!(working_stage(Stage::Executing), Stage::Executing);
    }
}
