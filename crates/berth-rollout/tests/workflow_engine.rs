use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use berth_core::{
    validate_history, CallContext, ChannelRequirements, Complexity, EngineConfig, ErrorKind,
    HealthStatus, InputsEdit, Issue, NewDeployment, PlanError, RequestStatus, RetryConfig,
    ServiceType, Severity, Stage, StageStatus, SystemName, TargetEnvironment, TimeoutConfig,
    ValidationError,
};
use berth_rollout::simulated::{
    SimulatedArtifacts, SimulatedBuild, SimulatedGitOps, StaticAnalyzer, StaticProbe,
};
use berth_rollout::{
    Collaborators, DispatchStep, EngineFootprint, ExecutionPhase, HealthProbe, RolloutError,
    WorkflowEngine,
};
use berth_state::{IssueSink, MemoryDeploymentStore, MemoryIssueSink, StorageError, StorageResult};
use tokio::time::Instant;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_config() -> EngineConfig {
    EngineConfig {
        timeouts: TimeoutConfig {
            analysis_ms: 1_000,
            health_check_ms: 100,
            dispatch_step_ms: 1_000,
            poll_interval_ms: 10,
            execution_deadline_ms: 60_000,
            issue_ms: 100,
        },
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 40,
        },
        ..EngineConfig::default()
    }
}

struct Setup {
    config: EngineConfig,
    issues: Arc<dyn IssueSink>,
    analyzer: StaticAnalyzer,
    build: SimulatedBuild,
    artifacts: SimulatedArtifacts,
    gitops: SimulatedGitOps,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            config: test_config(),
            issues: Arc::new(MemoryIssueSink::new()),
            analyzer: StaticAnalyzer::detecting(&ServiceType::ALL, Complexity::Medium),
            build: SimulatedBuild::new(),
            artifacts: SimulatedArtifacts::new(),
            gitops: SimulatedGitOps::new(),
        }
    }
}

/// Issue tracker that rejects every issue.
struct RejectingIssueSink;

#[async_trait]
impl IssueSink for RejectingIssueSink {
    async fn raise(&self, _issue: &Issue) -> StorageResult<()> {
        Err(StorageError::Backend("tracker down".to_string()))
    }

    async fn issues_for(&self, _deployment_id: Uuid) -> StorageResult<Vec<Issue>> {
        Ok(Vec::new())
    }
}

/// Issue tracker that never answers.
struct HangingIssueSink;

#[async_trait]
impl IssueSink for HangingIssueSink {
    async fn raise(&self, _issue: &Issue) -> StorageResult<()> {
        std::future::pending().await
    }

    async fn issues_for(&self, _deployment_id: Uuid) -> StorageResult<Vec<Issue>> {
        Ok(Vec::new())
    }
}

fn slow_analysis() -> StaticAnalyzer {
    StaticAnalyzer::detecting(&[ServiceType::Tts], Complexity::Low)
        .with_delay(Duration::from_secs(30))
}

struct Harness {
    engine: Arc<WorkflowEngine>,
    probes: BTreeMap<SystemName, Arc<StaticProbe>>,
    gitops: Arc<SimulatedGitOps>,
    build: Arc<SimulatedBuild>,
}

impl Setup {
    fn start(self) -> Harness {
        let probes: BTreeMap<SystemName, Arc<StaticProbe>> = SystemName::ALL
            .iter()
            .map(|s| (*s, Arc::new(StaticProbe::healthy())))
            .collect();
        let gitops = Arc::new(self.gitops);
        let build = Arc::new(self.build);
        let collaborators = Collaborators {
            analyzer: Arc::new(self.analyzer),
            probes: probes
                .iter()
                .map(|(s, p)| (*s, Arc::clone(p) as Arc<dyn HealthProbe>))
                .collect(),
            build: build.clone(),
            artifacts: Arc::new(self.artifacts),
            gitops: gitops.clone(),
        };
        let engine = WorkflowEngine::new(
            self.config,
            Arc::new(MemoryDeploymentStore::new()),
            self.issues,
            collaborators,
        );
        Harness {
            engine: Arc::new(engine),
            probes,
            gitops,
            build,
        }
    }
}

fn submission(project: &str, env: TargetEnvironment) -> NewDeployment {
    NewDeployment::new(
        project,
        "https://git.example.com/acme/voice-assist.git",
        "main",
        env,
    )
}

async fn submit(h: &Harness, project: &str, env: TargetEnvironment) -> Uuid {
    h.engine
        .submit(&CallContext::system(), submission(project, env))
        .await
        .expect("submit")
        .id
}

fn stages(history: &[berth_core::StageResult]) -> Vec<Stage> {
    history.iter().map(|e| e.stage).collect()
}

async fn advance_to(h: &Harness, id: Uuid, stage: Stage) {
    let ctx = CallContext::system();
    loop {
        let r = h.engine.advance(&ctx, id).await.expect("advance");
        if r.stage == stage {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn standard_request_runs_to_completion() {
    let h = Setup::default().start();
    let id = submit(&h, "Voice Assist", TargetEnvironment::Staging).await;

    let done = h
        .engine
        .run_until_checkpoint(&CallContext::system(), id)
        .await
        .expect("run");

    assert_eq!(done.stage, Stage::Completed);
    assert_eq!(done.status, RequestStatus::Completed);
    assert_eq!(
        stages(&done.stage_history),
        vec![
            Stage::Pending,
            Stage::Analyzing,
            Stage::ResourcePlanning,
            Stage::ConfigGeneration,
            Stage::InfraVerification,
            Stage::Executing,
            Stage::Monitoring,
            Stage::Completed,
        ]
    );
    validate_history(&done.stage_history).expect("valid history");

    let bundle = done.resource_bundle.as_ref().expect("bundle");
    assert_eq!(bundle.instance_count(), 12);
    assert_eq!(done.cost_estimates.len(), 4);

    let config = done.config.as_ref().expect("config");
    assert_eq!(config.namespace, "voice-assist-staging");
    assert_eq!(config.cluster, "stg-cluster");
    assert!(done.execution_ref.is_some());

    assert_eq!(h.gitops.synced().len(), 1);
    assert_eq!(h.build.calls(), 1);
    assert!(h.engine.issues_for(id).await.expect("issues").is_empty());
}

#[tokio::test(start_paused = true)]
async fn snapshots_are_immutable_clones() {
    let h = Setup::default().start();
    let id = submit(&h, "Voice", TargetEnvironment::Development).await;
    let before = h.engine.get(id).await.expect("get");

    h.engine
        .advance(&CallContext::system(), id)
        .await
        .expect("advance");

    assert_eq!(before.stage, Stage::Pending);
    assert_eq!(h.engine.get(id).await.expect("get").stage, Stage::Analyzing);
    assert_eq!(h.engine.list().await.expect("list").len(), 1);
}

// ---------------------------------------------------------------------------
// Infrastructure checkpoint
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unreachable_subsystem_keeps_request_at_verification() {
    let h = Setup::default().start();
    h.probes[&SystemName::Gitops].set_status(HealthStatus::Unreachable);
    let ctx = CallContext::system();
    let id = submit(&h, "Voice", TargetEnvironment::Staging).await;

    let blocked = h.engine.run_until_checkpoint(&ctx, id).await.expect("run");
    assert_eq!(blocked.stage, Stage::InfraVerification);
    assert_eq!(blocked.infra_retry_count, 1);

    for attempt in 2..=4 {
        let again = h.engine.advance(&ctx, id).await.expect("retry");
        assert_eq!(again.stage, Stage::InfraVerification);
        assert_eq!(again.status, RequestStatus::Active);
        assert_eq!(again.infra_retry_count, attempt);
        let last = again.stage_history.last().expect("entry");
        assert_eq!(last.status, StageStatus::Retried);
        assert_eq!(last.retry_count, attempt - 1);
        let health = again.infra_health.as_ref().expect("health");
        assert!(!health.all_ready);
        assert_eq!(health.unready(), vec![SystemName::Gitops]);
    }

    let current = h.engine.get(id).await.expect("get");
    validate_history(&current.stage_history).expect("valid history");
    assert!(h.engine.issues_for(id).await.expect("issues").is_empty());
    assert!(h.gitops.synced().is_empty());

    h.probes[&SystemName::Gitops].set_status(HealthStatus::Healthy);
    let done = h.engine.run_until_checkpoint(&ctx, id).await.expect("resume");
    assert_eq!(done.stage, Stage::Completed);
    validate_history(&done.stage_history).expect("valid history");
}

#[tokio::test(start_paused = true)]
async fn each_verification_checks_every_subsystem_once() {
    let h = Setup::default().start();
    let ctx = CallContext::system();
    let id = submit(&h, "Voice", TargetEnvironment::Staging).await;

    advance_to(&h, id, Stage::InfraVerification).await;
    assert!(h.probes.values().all(|p| p.calls() == 1));

    let executing = h.engine.advance(&ctx, id).await.expect("advance");
    assert_eq!(executing.stage, Stage::Executing);
    assert!(h.probes.values().all(|p| p.calls() == 2));
}

#[tokio::test(start_paused = true)]
async fn degraded_subsystem_blocks_execution() {
    let h = Setup::default().start();
    let ctx = CallContext::system();
    let id = submit(&h, "Voice", TargetEnvironment::Staging).await;
    h.probes[&SystemName::Cluster].set_status(HealthStatus::Degraded);

    let blocked = h.engine.run_until_checkpoint(&ctx, id).await.expect("run");
    assert_eq!(blocked.stage, Stage::InfraVerification);
    assert_eq!(
        blocked.infra_health.expect("health").unready(),
        vec![SystemName::Cluster]
    );
}

// ---------------------------------------------------------------------------
// Failures and issues
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn artifact_push_failure_raises_exactly_one_issue() {
    let h = Setup {
        artifacts: SimulatedArtifacts::new().always_failing(),
        ..Setup::default()
    }
    .start();
    let ctx = CallContext::system();
    let id = submit(&h, "Voice", TargetEnvironment::Staging).await;

    let err = h.engine.run_until_checkpoint(&ctx, id).await.unwrap_err();
    match err {
        RolloutError::Dispatch { step, attempts, .. } => {
            assert_eq!(step, DispatchStep::Push);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected dispatch error, got {other:?}"),
    }

    let failed = h.engine.get(id).await.expect("get");
    assert_eq!(failed.stage, Stage::Failed);
    assert_eq!(failed.status, RequestStatus::Failed);
    let failure = failed.failure.as_ref().expect("failure");
    assert_eq!(failure.stage, Stage::Executing);
    assert_eq!(failure.kind, ErrorKind::Dispatch);
    validate_history(&failed.stage_history).expect("valid history");

    let issues = h.engine.issues_for(id).await.expect("issues");
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].deployment_request_id, id);
    assert_eq!(issues[0].stage, Stage::Executing);
    assert_eq!(issues[0].severity, Severity::High);
    assert!(issues[0].auto_created);

    // Compensation stopped the namespace; nothing was synced.
    assert_eq!(h.gitops.stops().len(), 1);
    assert!(h.gitops.synced().is_empty());

    assert!(matches!(
        h.engine.advance(&ctx, id).await,
        Err(RolloutError::Terminal { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn transient_push_failure_is_retried_and_counted() {
    let h = Setup {
        artifacts: SimulatedArtifacts::new().failing_times(2),
        ..Setup::default()
    }
    .start();
    let id = submit(&h, "Voice", TargetEnvironment::Staging).await;

    let done = h
        .engine
        .run_until_checkpoint(&CallContext::system(), id)
        .await
        .expect("run");
    assert_eq!(done.stage, Stage::Completed);
    let monitoring = done
        .stage_history
        .iter()
        .find(|e| e.stage == Stage::Monitoring)
        .expect("monitoring entry");
    assert_eq!(monitoring.retry_count, 2);
}

#[tokio::test(start_paused = true)]
async fn unknown_detected_service_fails_planning() {
    let h = Setup {
        analyzer: StaticAnalyzer::new(berth_core::AnalysisReport {
            detected_services: vec![berth_core::DetectedService {
                service_type: "hologram".to_string(),
                confidence: 0.9,
                domain: None,
            }],
            framework: None,
            language: None,
            complexity: Complexity::Low,
        }),
        ..Setup::default()
    }
    .start();
    let ctx = CallContext::system();
    let id = submit(&h, "Voice", TargetEnvironment::Production).await;

    let err = h.engine.run_until_checkpoint(&ctx, id).await.unwrap_err();
    assert!(matches!(
        err,
        RolloutError::Plan(PlanError::UnsupportedService { .. })
    ));

    let failed = h.engine.get(id).await.expect("get");
    validate_history(&failed.stage_history).expect("valid history");
    let last = failed.stage_history.last().expect("entry");
    assert_eq!(last.stage, Stage::ResourcePlanning);
    assert_eq!(last.status, StageStatus::Failed);
    let failure = failed.failure.expect("failure");
    assert_eq!(failure.stage, Stage::ResourcePlanning);
    assert_eq!(failure.kind, ErrorKind::UnsupportedService);
    assert!(failure.message.contains("hologram"));

    let issues = h.engine.issues_for(id).await.expect("issues");
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].severity, Severity::Critical);
    assert_eq!(issues[0].stage, Stage::ResourcePlanning);
}

#[tokio::test(start_paused = true)]
async fn no_services_is_a_validation_failure() {
    let h = Setup {
        analyzer: StaticAnalyzer::detecting(&[], Complexity::Low),
        ..Setup::default()
    }
    .start();
    let id = submit(&h, "Empty", TargetEnvironment::Development).await;

    let err = h
        .engine
        .run_until_checkpoint(&CallContext::system(), id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RolloutError::Plan(PlanError::Validation(ValidationError::NoServiceDemand))
    ));
    let issues = h.engine.issues_for(id).await.expect("issues");
    assert_eq!(issues[0].severity, Severity::Medium);
}

#[tokio::test(start_paused = true)]
async fn analysis_timeout_fails_request() {
    let h = Setup {
        analyzer: slow_analysis(),
        ..Setup::default()
    }
    .start();
    let id = submit(&h, "Voice", TargetEnvironment::Staging).await;

    let err = h
        .engine
        .advance(&CallContext::system(), id)
        .await
        .unwrap_err();
    assert!(matches!(err, RolloutError::Timeout { .. }));

    let failed = h.engine.get(id).await.expect("get");
    assert_eq!(
        stages(&failed.stage_history),
        vec![Stage::Pending, Stage::Analyzing]
    );
    validate_history(&failed.stage_history).expect("valid history");
    let failure = failed.failure.expect("failure");
    assert_eq!(failure.stage, Stage::Analyzing);
    assert_eq!(failure.kind, ErrorKind::Timeout);
    assert_eq!(h.engine.issues_for(id).await.expect("issues").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn hung_sync_step_fails_request_at_executing() {
    let h = Setup {
        gitops: SimulatedGitOps::new().with_delay(Duration::from_secs(3600)),
        ..Setup::default()
    }
    .start();
    let ctx = CallContext::system();
    let id = submit(&h, "Voice", TargetEnvironment::Staging).await;

    let err = h.engine.run_until_checkpoint(&ctx, id).await.unwrap_err();
    match err {
        RolloutError::Timeout {
            operation,
            after_ms,
        } => {
            assert_eq!(operation, "sync step");
            assert_eq!(after_ms, 1_000);
        }
        other => panic!("expected step timeout, got {other:?}"),
    }

    let failed = h.engine.get(id).await.expect("get");
    let failure = failed.failure.as_ref().expect("failure");
    assert_eq!(failure.stage, Stage::Executing);
    assert_eq!(failure.kind, ErrorKind::Timeout);
    validate_history(&failed.stage_history).expect("valid history");

    let issues = h.engine.issues_for(id).await.expect("issues");
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].severity, Severity::High);
    assert_eq!(h.gitops.stops().len(), 1);
    assert_eq!(h.engine.footprint(), EngineFootprint::default());

    // The namespace was released with the failure.
    let second = submit(&h, "Voice", TargetEnvironment::Staging).await;
    advance_to(&h, second, Stage::Executing).await;
}

#[tokio::test(start_paused = true)]
async fn execution_deadline_fails_request() {
    let mut config = test_config();
    config.timeouts.execution_deadline_ms = 500;
    let h = Setup {
        config,
        build: SimulatedBuild::new().with_delay(Duration::from_secs(5)),
        ..Setup::default()
    }
    .start();
    let ctx = CallContext::system();
    let id = submit(&h, "Voice", TargetEnvironment::Development).await;

    let err = h.engine.run_until_checkpoint(&ctx, id).await.unwrap_err();
    match err {
        RolloutError::Timeout {
            operation,
            after_ms,
        } => {
            assert_eq!(operation, "execution");
            assert_eq!(after_ms, 500);
        }
        other => panic!("expected execution timeout, got {other:?}"),
    }

    let failed = h.engine.get(id).await.expect("get");
    let failure = failed.failure.expect("failure");
    assert_eq!(failure.stage, Stage::Executing);
    assert_eq!(failure.kind, ErrorKind::Timeout);
    assert_eq!(h.engine.issues_for(id).await.expect("issues").len(), 1);
    assert_eq!(h.engine.footprint(), EngineFootprint::default());
    assert!(h.gitops.synced().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejected_issue_is_reported_and_request_stays_failed() {
    let h = Setup {
        issues: Arc::new(RejectingIssueSink),
        analyzer: slow_analysis(),
        ..Setup::default()
    }
    .start();
    let id = submit(&h, "Voice", TargetEnvironment::Staging).await;

    let err = h
        .engine
        .advance(&CallContext::system(), id)
        .await
        .unwrap_err();
    match err {
        RolloutError::IssueEmission {
            id: failed_id,
            failure,
            attempts,
            message,
        } => {
            assert_eq!(failed_id, id);
            assert!(failure.contains("repository analysis timed out"));
            assert_eq!(attempts, 3);
            assert!(message.contains("tracker down"));
        }
        other => panic!("expected issue emission error, got {other:?}"),
    }

    let failed = h.engine.get(id).await.expect("get");
    assert_eq!(failed.status, RequestStatus::Failed);
    assert_eq!(failed.failure.expect("failure").kind, ErrorKind::Timeout);
    assert_eq!(h.engine.footprint(), EngineFootprint::default());
}

#[tokio::test(start_paused = true)]
async fn hanging_issue_tracker_does_not_block_failure() {
    let h = Setup {
        issues: Arc::new(HangingIssueSink),
        analyzer: slow_analysis(),
        ..Setup::default()
    }
    .start();
    let id = submit(&h, "Voice", TargetEnvironment::Staging).await;

    let started = Instant::now();
    let err = h
        .engine
        .advance(&CallContext::system(), id)
        .await
        .unwrap_err();
    // 1 s analysis deadline, then 3 × 100 ms issue attempts plus backoff.
    assert!(started.elapsed() < Duration::from_secs(2));
    match err {
        RolloutError::IssueEmission {
            attempts, message, ..
        } => {
            assert_eq!(attempts, 3);
            assert!(message.contains("timed out"));
        }
        other => panic!("expected issue emission error, got {other:?}"),
    }
    assert_eq!(
        h.engine.get(id).await.expect("get").status,
        RequestStatus::Failed
    );
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancellation_discards_in_flight_analysis() {
    let h = Setup {
        analyzer: StaticAnalyzer::detecting(&[ServiceType::Tts], Complexity::Low)
            .with_delay(Duration::from_millis(500)),
        ..Setup::default()
    }
    .start();
    let ctx = CallContext::system();
    let id = submit(&h, "Voice", TargetEnvironment::Staging).await;

    let engine = Arc::clone(&h.engine);
    let advancing = {
        let ctx = ctx.clone();
        tokio::spawn(async move { engine.advance(&ctx, id).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cancelled = h.engine.cancel(&ctx, id, "operator abort").await.expect("cancel");
    assert_eq!(cancelled.status, RequestStatus::Cancelled);

    let after = advancing.await.expect("join").expect("advance");
    assert_eq!(after.stage, Stage::Cancelled);
    assert!(after.analysis.is_none());
    assert_eq!(
        stages(&after.stage_history),
        vec![Stage::Pending, Stage::Cancelled]
    );
    validate_history(&after.stage_history).expect("valid history");
    assert!(h.engine.issues_for(id).await.expect("issues").is_empty());

    assert!(matches!(
        h.engine.cancel(&ctx, id, "again").await,
        Err(RolloutError::Terminal { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn cancel_during_execution_releases_namespace() {
    let h = Setup {
        build: SimulatedBuild::new().with_delay(Duration::from_secs(5)),
        ..Setup::default()
    }
    .start();
    let ctx = CallContext::system();
    let first = submit(&h, "Voice", TargetEnvironment::Staging).await;

    // Drive the first request into Executing.
    loop {
        let r = h.engine.advance(&ctx, first).await.expect("advance");
        if r.stage == Stage::Executing {
            break;
        }
    }

    let engine = Arc::clone(&h.engine);
    let executing = {
        let ctx = ctx.clone();
        tokio::spawn(async move { engine.advance(&ctx, first).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.engine.cancel(&ctx, first, "stop").await.expect("cancel");
    let after = executing.await.expect("join").expect("advance");
    assert_eq!(after.stage, Stage::Cancelled);

    // The namespace is free again for a second request.
    let second = submit(&h, "Voice", TargetEnvironment::Staging).await;
    let done = h
        .engine
        .run_until_checkpoint(&ctx, second)
        .await
        .expect("second run");
    assert_eq!(done.stage, Stage::Completed);
}

#[tokio::test(start_paused = true)]
async fn execution_status_reports_progress() {
    let h = Setup {
        build: SimulatedBuild::new().with_delay(Duration::from_secs(5)),
        ..Setup::default()
    }
    .start();
    let ctx = CallContext::system();
    let id = submit(&h, "Voice", TargetEnvironment::Staging).await;
    assert!(h.engine.execution_status(id).await.expect("status").is_none());

    advance_to(&h, id, Stage::Executing).await;
    assert!(h.engine.execution_status(id).await.expect("status").is_none());

    let engine = Arc::clone(&h.engine);
    let executing = {
        let ctx = ctx.clone();
        tokio::spawn(async move { engine.advance(&ctx, id).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = h
        .engine
        .execution_status(id)
        .await
        .expect("status")
        .expect("dispatched");
    assert_eq!(status.deployment_id, id);
    assert_eq!(status.phase, ExecutionPhase::Running);
    assert_eq!(status.current_step, Some(DispatchStep::Build));
    assert_eq!(status.progress_percent, 0);
    assert!(status
        .logs_tail
        .iter()
        .any(|line| line == "build: started"));

    let after = executing.await.expect("join").expect("advance");
    assert_eq!(after.stage, Stage::Monitoring);
    assert!(h.engine.execution_status(id).await.expect("status").is_none());
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn same_namespace_executions_never_overlap() {
    let h = Setup {
        gitops: SimulatedGitOps::new().with_delay(Duration::from_millis(200)),
        ..Setup::default()
    }
    .start();
    let a = submit(&h, "Voice", TargetEnvironment::Staging).await;
    let b = submit(&h, "Voice", TargetEnvironment::Staging).await;

    let runs = [a, b].map(|id| {
        let engine = Arc::clone(&h.engine);
        tokio::spawn(async move { engine.run_until_checkpoint(&CallContext::system(), id).await })
    });
    let mut finished = Vec::new();
    for run in runs {
        finished.push(run.await.expect("join").expect("run"));
    }
    assert!(finished.iter().all(|r| r.stage == Stage::Completed));
    assert_eq!(h.gitops.max_concurrent("voice-staging"), 1);

    // Executing windows: entry into Executing until Completed.
    let window = |r: &berth_core::DeploymentRequest| {
        let start = r
            .stage_history
            .iter()
            .find(|e| e.stage == Stage::Executing)
            .expect("executing")
            .completed_at;
        let end = r.stage_history.last().expect("completed").completed_at;
        (start, end)
    };
    let (a_start, a_end) = window(&finished[0]);
    let (b_start, b_end) = window(&finished[1]);
    assert!(a_end <= b_start || b_end <= a_start);
}

#[tokio::test(start_paused = true)]
async fn different_namespaces_run_independently() {
    let h = Setup {
        gitops: SimulatedGitOps::new().with_delay(Duration::from_millis(200)),
        ..Setup::default()
    }
    .start();
    let a = submit(&h, "Voice", TargetEnvironment::Staging).await;
    let b = submit(&h, "Chat", TargetEnvironment::Staging).await;

    let runs = [a, b].map(|id| {
        let engine = Arc::clone(&h.engine);
        tokio::spawn(async move { engine.run_until_checkpoint(&CallContext::system(), id).await })
    });
    for run in runs {
        let done = run.await.expect("join").expect("run");
        assert_eq!(done.stage, Stage::Completed);
    }
    assert_eq!(h.gitops.max_concurrent("voice-staging"), 1);
    assert_eq!(h.gitops.max_concurrent("chat-staging"), 1);
}

#[tokio::test(start_paused = true)]
async fn finished_requests_leave_no_bookkeeping() {
    let h = Setup {
        gitops: SimulatedGitOps::new().with_delay(Duration::from_millis(50)),
        ..Setup::default()
    }
    .start();
    let ctx = CallContext::system();
    let ids = [
        submit(&h, "Voice", TargetEnvironment::Staging).await,
        submit(&h, "Voice", TargetEnvironment::Staging).await,
        submit(&h, "Chat", TargetEnvironment::Staging).await,
    ];
    let cancelled = submit(&h, "Notes", TargetEnvironment::Development).await;
    h.engine.advance(&ctx, cancelled).await.expect("advance");
    assert_eq!(h.engine.footprint().gates, 1);
    h.engine.cancel(&ctx, cancelled, "dropped").await.expect("cancel");

    let runs = ids.map(|id| {
        let engine = Arc::clone(&h.engine);
        tokio::spawn(async move { engine.run_until_checkpoint(&CallContext::system(), id).await })
    });
    for run in runs {
        let done = run.await.expect("join").expect("run");
        assert_eq!(done.stage, Stage::Completed);
    }

    assert_eq!(h.engine.footprint(), EngineFootprint::default());
}

// ---------------------------------------------------------------------------
// Inputs, rollback
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn inputs_are_versioned_and_frozen_after_analysis() {
    let h = Setup {
        analyzer: StaticAnalyzer::detecting(&[ServiceType::Tts], Complexity::Low),
        ..Setup::default()
    }
    .start();
    let ctx = CallContext::system();
    let id = submit(&h, "Voice", TargetEnvironment::Staging).await;

    let edited = h
        .engine
        .update_inputs(
            id,
            InputsEdit {
                declared_services: Some(vec![ServiceType::Qa]),
                ..InputsEdit::default()
            },
        )
        .await
        .expect("edit at pending");
    assert_eq!(edited.inputs.version, 2);

    h.engine.advance(&ctx, id).await.expect("analyze");
    let edited = h
        .engine
        .update_inputs(
            id,
            InputsEdit {
                channel_counts: Some(ChannelRequirements::new().with(ServiceType::Tts, 60)),
                ..InputsEdit::default()
            },
        )
        .await
        .expect("edit at analyzing");
    assert_eq!(edited.inputs.version, 3);

    // A no-op edit does not bump the version.
    let same = h
        .engine
        .update_inputs(id, InputsEdit::default())
        .await
        .expect("noop edit");
    assert_eq!(same.inputs.version, 3);

    let planned = h.engine.advance(&ctx, id).await.expect("plan");
    assert_eq!(planned.stage, Stage::ResourcePlanning);
    let entry = planned.stage_history.last().expect("entry");
    assert_eq!(entry.inputs_version, 3);
    let bundle = planned.resource_bundle.expect("bundle");
    let tts = bundle.server("tts").expect("tts role");
    assert_eq!(tts.instance_count, 2);
    assert!(bundle.server("qa").is_some());

    let err = h
        .engine
        .update_inputs(id, InputsEdit::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RolloutError::Validation(ValidationError::InputsFrozen {
            stage: Stage::ResourcePlanning
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn rollback_reverts_without_touching_request() {
    let h = Setup::default().start();
    let ctx = CallContext::system();
    let id = submit(&h, "Voice", TargetEnvironment::Production).await;

    assert!(matches!(
        h.engine.rollback(&ctx, id).await,
        Err(RolloutError::RollbackUnavailable { .. })
    ));

    let done = h.engine.run_until_checkpoint(&ctx, id).await.expect("run");
    assert_eq!(done.stage, Stage::Completed);

    h.engine.rollback(&ctx, id).await.expect("rollback");
    let reverts = h.gitops.reverts();
    assert_eq!(reverts.len(), 1);
    assert_eq!(reverts[0].namespace, "voice-production");

    let after = h.engine.get(id).await.expect("get");
    assert_eq!(after, done);
}
