//! Execution dispatch: build → push → GitOps sync.
//!
//! `dispatch` spawns the pipeline and returns an [`ExecutionRef`]
//! immediately; `poll` reports progress. Each sub-step is retried with
//! exponential backoff up to the configured bound. When a step exhausts its
//! retries the execution is marked failed and a
//! [`CompensationRequest::Stop`] is sent to the workflow engine.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use berth_core::{
    CallContext, DeploymentRequest, ExecutionRef, RetryConfig, ValidationError, METRICS,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::collaborators::{
    ArtifactRef, ArtifactStore, BuildJob, BuildOutput, BuildService, GitOpsSync, SyncTarget,
};
use crate::error::{RolloutError, RolloutResult};
use crate::retry::{retry_with_backoff, AttemptError, RetryExhausted};

const LOG_TAIL: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStep {
    Build,
    Push,
    Sync,
}

impl DispatchStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStep::Build => "build",
            DispatchStep::Push => "push",
            DispatchStep::Sync => "sync",
        }
    }

    /// Progress reported once this step has completed.
    fn progress_after(&self) -> u8 {
        match self {
            DispatchStep::Build => 33,
            DispatchStep::Push => 66,
            DispatchStep::Sync => 100,
        }
    }
}

impl fmt::Display for DispatchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Running,
    Succeeded,
    Failed,
}

/// The sub-step that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: DispatchStep,
    pub attempts: u32,
    pub message: String,
    /// The last attempt hit the per-step deadline.
    #[serde(default)]
    pub timed_out: bool,
}

/// Snapshot returned by [`ExecutionDispatcher::poll`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub execution_ref: ExecutionRef,
    pub deployment_id: Uuid,
    pub phase: ExecutionPhase,
    pub progress_percent: u8,
    pub current_step: Option<DispatchStep>,
    pub logs_tail: Vec<String>,
    /// Retries spent across all sub-steps.
    pub retries: u32,
    pub failure: Option<StepFailure>,
}

impl ExecutionStatus {
    fn started(execution_ref: ExecutionRef, deployment_id: Uuid) -> Self {
        Self {
            execution_ref,
            deployment_id,
            phase: ExecutionPhase::Running,
            progress_percent: 0,
            current_step: Some(DispatchStep::Build),
            logs_tail: Vec::new(),
            retries: 0,
            failure: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.phase != ExecutionPhase::Running
    }
}

/// Compensating action the dispatcher asks the engine to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationRequest {
    Stop {
        deployment_id: Uuid,
        execution_ref: ExecutionRef,
        target: SyncTarget,
        failed_step: DispatchStep,
    },
}

#[derive(Debug)]
struct ExecutionRecord {
    status: ExecutionStatus,
    logs: VecDeque<String>,
}

type ExecutionTable = Arc<Mutex<HashMap<ExecutionRef, ExecutionRecord>>>;

fn lock(table: &ExecutionTable) -> MutexGuard<'_, HashMap<ExecutionRef, ExecutionRecord>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn record(table: &ExecutionTable, exec: ExecutionRef, f: impl FnOnce(&mut ExecutionStatus)) {
    let mut guard = lock(table);
    if let Some(rec) = guard.get_mut(&exec) {
        f(&mut rec.status);
    }
}

fn log_line(table: &ExecutionTable, exec: ExecutionRef, line: String) {
    let mut guard = lock(table);
    if let Some(rec) = guard.get_mut(&exec) {
        if rec.logs.len() == LOG_TAIL {
            rec.logs.pop_front();
        }
        rec.logs.push_back(line);
    }
}

/// Sync target derived from a request's generated configuration.
pub fn sync_target(request: &DeploymentRequest) -> RolloutResult<SyncTarget> {
    let config = request.config.as_ref().ok_or(ValidationError::EmptyField {
        field: "config",
    })?;
    Ok(SyncTarget {
        cluster: config.cluster.clone(),
        namespace: config.namespace.clone(),
        strategy: config.strategy,
        replicas: config.replicas.clone(),
        config_digest: config.digest.clone(),
    })
}

#[derive(Clone)]
pub struct ExecutionDispatcher {
    build: Arc<dyn BuildService>,
    artifacts: Arc<dyn ArtifactStore>,
    gitops: Arc<dyn GitOpsSync>,
    retry: RetryConfig,
    step_timeout: Duration,
    executions: ExecutionTable,
    compensation: mpsc::UnboundedSender<CompensationRequest>,
}

impl ExecutionDispatcher {
    /// Create a dispatcher and the receiving end of its compensation channel.
    pub fn new(
        build: Arc<dyn BuildService>,
        artifacts: Arc<dyn ArtifactStore>,
        gitops: Arc<dyn GitOpsSync>,
        retry: RetryConfig,
        step_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<CompensationRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            build,
            artifacts,
            gitops,
            retry,
            step_timeout,
            executions: Arc::new(Mutex::new(HashMap::new())),
            compensation: tx,
        };
        (dispatcher, rx)
    }

    /// Start build → push → sync for `request` and return its handle.
    pub fn dispatch(
        &self,
        ctx: &CallContext,
        request: &DeploymentRequest,
    ) -> RolloutResult<ExecutionRef> {
        let target = sync_target(request)?;
        let job = BuildJob {
            deployment_id: request.id,
            repository_url: request.repository_url.clone(),
            branch: request.branch.clone(),
        };
        let exec = ExecutionRef::new();
        lock(&self.executions).insert(
            exec,
            ExecutionRecord {
                status: ExecutionStatus::started(exec, request.id),
                logs: VecDeque::new(),
            },
        );
        info!(
            event = "dispatch.started",
            deployment_id = %request.id,
            execution_id = %exec,
            namespace = %target.namespace,
        );

        let this = self.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            this.run(ctx, exec, job, target).await;
        });
        Ok(exec)
    }

    pub fn poll(&self, exec: ExecutionRef) -> RolloutResult<ExecutionStatus> {
        let guard = lock(&self.executions);
        let rec = guard.get(&exec).ok_or(RolloutError::UnknownExecution(exec))?;
        let mut status = rec.status.clone();
        status.logs_tail = rec.logs.iter().cloned().collect();
        Ok(status)
    }

    /// Drop the bookkeeping for an execution the engine no longer polls.
    ///
    /// A pipeline still running keeps going; its later progress is not
    /// recorded.
    pub fn forget(&self, exec: ExecutionRef) -> bool {
        lock(&self.executions).remove(&exec).is_some()
    }

    /// Executions currently tracked.
    pub fn tracked(&self) -> usize {
        lock(&self.executions).len()
    }

    async fn run(&self, ctx: CallContext, exec: ExecutionRef, job: BuildJob, target: SyncTarget) {
        let deployment_id = job.deployment_id;

        let built: BuildOutput = match self
            .step(exec, DispatchStep::Build, |_| self.build.build(&ctx, &job))
            .await
        {
            Ok(out) => out,
            Err(failure) => return self.fail(exec, deployment_id, target, failure),
        };
        log_line(&self.executions, exec, format!("built {}", built.image));

        let artifact: ArtifactRef = match self
            .step(exec, DispatchStep::Push, |_| self.artifacts.push(&ctx, &built))
            .await
        {
            Ok(artifact) => artifact,
            Err(failure) => return self.fail(exec, deployment_id, target, failure),
        };
        log_line(&self.executions, exec, format!("pushed {}", artifact.uri));

        if let Err(failure) = self
            .step(exec, DispatchStep::Sync, |_| {
                self.gitops.sync(&ctx, &target, &artifact)
            })
            .await
        {
            return self.fail(exec, deployment_id, target, failure);
        }
        log_line(
            &self.executions,
            exec,
            format!("synced {}/{}", target.cluster, target.namespace),
        );

        record(&self.executions, exec, |s| {
            s.phase = ExecutionPhase::Succeeded;
            s.current_step = None;
            s.progress_percent = 100;
        });
        info!(event = "dispatch.succeeded", execution_id = %exec, deployment_id = %deployment_id);
    }

    async fn step<T, F, Fut>(
        &self,
        exec: ExecutionRef,
        step: DispatchStep,
        op: F,
    ) -> Result<T, StepFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, crate::error::CollaboratorError>>,
    {
        record(&self.executions, exec, |s| s.current_step = Some(step));
        log_line(&self.executions, exec, format!("{step}: started"));

        let table = Arc::clone(&self.executions);
        let exec_id = exec.to_string();
        let result = retry_with_backoff(
            &self.retry,
            self.step_timeout,
            |attempt, error| {
                METRICS.inc_dispatch_retries();
                berth_core::obs::emit_step_retry(&exec_id, step.as_str(), attempt, error);
                record(&table, exec, |s| s.retries += 1);
                log_line(&table, exec, format!("{step}: attempt {attempt} failed: {error}"));
            },
            op,
        )
        .await;

        match result {
            Ok((value, _attempts)) => {
                record(&self.executions, exec, |s| {
                    s.progress_percent = step.progress_after()
                });
                Ok(value)
            }
            Err(RetryExhausted { attempts, last }) => Err(StepFailure {
                step,
                attempts,
                message: last.to_string(),
                timed_out: matches!(last, AttemptError::TimedOut(_)),
            }),
        }
    }

    fn fail(
        &self,
        exec: ExecutionRef,
        deployment_id: Uuid,
        target: SyncTarget,
        failure: StepFailure,
    ) {
        warn!(
            event = "dispatch.failed",
            execution_id = %exec,
            deployment_id = %deployment_id,
            step = %failure.step,
            attempts = failure.attempts,
            error = %failure.message,
        );
        log_line(
            &self.executions,
            exec,
            format!("{}: gave up after {} attempt(s)", failure.step, failure.attempts),
        );
        let request = CompensationRequest::Stop {
            deployment_id,
            execution_ref: exec,
            target,
            failed_step: failure.step,
        };
        // Sent before the phase flips so pollers that observe `Failed`
        // always find the request queued.
        if self.compensation.send(request).is_err() {
            warn!(execution_id = %exec, "compensation receiver dropped");
        }
        record(&self.executions, exec, |s| {
            s.phase = ExecutionPhase::Failed;
            s.failure = Some(failure);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{SimulatedArtifacts, SimulatedBuild, SimulatedGitOps};
    use berth_core::{
        DeploymentConfig, DeploymentStrategy, NewDeployment, TargetEnvironment,
    };
    use std::collections::BTreeMap;

    fn request() -> DeploymentRequest {
        let mut req = DeploymentRequest::new(NewDeployment::new(
            "Voice",
            "https://git.example.com/acme/voice.git",
            "main",
            TargetEnvironment::Staging,
        ));
        req.config = Some(DeploymentConfig {
            cluster: "stg-cluster".to_string(),
            namespace: "voice-staging".to_string(),
            domains: BTreeMap::new(),
            strategy: DeploymentStrategy::RollingUpdate,
            replicas: BTreeMap::from([("tts".to_string(), 1)]),
            digest: "abc".to_string(),
        });
        req
    }

    fn dispatcher(
        artifacts: SimulatedArtifacts,
    ) -> (ExecutionDispatcher, mpsc::UnboundedReceiver<CompensationRequest>) {
        dispatcher_with(SimulatedGitOps::new(), artifacts)
    }

    fn dispatcher_with(
        gitops: SimulatedGitOps,
        artifacts: SimulatedArtifacts,
    ) -> (ExecutionDispatcher, mpsc::UnboundedReceiver<CompensationRequest>) {
        ExecutionDispatcher::new(
            Arc::new(SimulatedBuild::new()),
            Arc::new(artifacts),
            Arc::new(gitops),
            RetryConfig::default(),
            Duration::from_secs(5),
        )
    }

    async fn wait(d: &ExecutionDispatcher, exec: ExecutionRef) -> ExecutionStatus {
        loop {
            let status = d.poll(exec).unwrap();
            if status.is_finished() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_dispatch() {
        let (d, mut rx) = dispatcher(SimulatedArtifacts::new());
        let exec = d.dispatch(&CallContext::system(), &request()).unwrap();
        let status = wait(&d, exec).await;
        assert_eq!(status.phase, ExecutionPhase::Succeeded);
        assert_eq!(status.progress_percent, 100);
        assert_eq!(status.retries, 0);
        assert!(status.logs_tail.iter().any(|l| l.starts_with("synced")));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_push_failure_is_retried() {
        let (d, _rx) = dispatcher(SimulatedArtifacts::new().failing_times(2));
        let exec = d.dispatch(&CallContext::system(), &request()).unwrap();
        let status = wait(&d, exec).await;
        assert_eq!(status.phase, ExecutionPhase::Succeeded);
        assert_eq!(status.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_push_requests_stop() {
        let (d, mut rx) = dispatcher(SimulatedArtifacts::new().always_failing());
        let req = request();
        let exec = d.dispatch(&CallContext::system(), &req).unwrap();
        let status = wait(&d, exec).await;

        assert_eq!(status.phase, ExecutionPhase::Failed);
        let failure = status.failure.unwrap();
        assert_eq!(failure.step, DispatchStep::Push);
        assert_eq!(failure.attempts, 3);
        assert!(!failure.timed_out);
        assert_eq!(status.progress_percent, 33);

        match rx.try_recv().unwrap() {
            CompensationRequest::Stop {
                deployment_id,
                failed_step,
                target,
                ..
            } => {
                assert_eq!(deployment_id, req.id);
                assert_eq!(failed_step, DispatchStep::Push);
                assert_eq!(target.namespace, "voice-staging");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_sync_fails_as_timeout() {
        let (d, mut rx) = dispatcher_with(
            SimulatedGitOps::new().with_delay(Duration::from_secs(3600)),
            SimulatedArtifacts::new(),
        );
        let exec = d.dispatch(&CallContext::system(), &request()).unwrap();
        let status = wait(&d, exec).await;

        assert_eq!(status.phase, ExecutionPhase::Failed);
        let failure = status.failure.unwrap();
        assert_eq!(failure.step, DispatchStep::Sync);
        assert_eq!(failure.attempts, 3);
        assert!(failure.timed_out);
        assert!(failure.message.contains("timed out"));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_drops_execution() {
        let (d, _rx) = dispatcher(SimulatedArtifacts::new());
        let exec = d.dispatch(&CallContext::system(), &request()).unwrap();
        wait(&d, exec).await;
        assert_eq!(d.tracked(), 1);

        assert!(d.forget(exec));
        assert!(!d.forget(exec));
        assert_eq!(d.tracked(), 0);
        assert!(matches!(d.poll(exec), Err(RolloutError::UnknownExecution(_))));
    }

    #[tokio::test]
    async fn test_dispatch_requires_config() {
        let (d, _rx) = dispatcher(SimulatedArtifacts::new());
        let mut req = request();
        req.config = None;
        assert!(matches!(
            d.dispatch(&CallContext::system(), &req),
            Err(RolloutError::Validation(_))
        ));
    }

    #[test]
    fn test_poll_unknown_execution() {
        let (d, _rx) = dispatcher(SimulatedArtifacts::new());
        assert!(matches!(
            d.poll(ExecutionRef::new()),
            Err(RolloutError::UnknownExecution(_))
        ));
    }
}
