//! In-process collaborators with fault injection.
//!
//! Used by the `simulate` CLI command and by tests. Each one counts calls
//! and can be configured to fail its first N calls, fail forever, or take a
//! fixed amount of (tokio) time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use berth_core::{
    AnalysisReport, CallContext, Complexity, DetectedService, HealthStatus, ServiceType,
    TargetEnvironment,
};
use tracing::debug;
use uuid::Uuid;

use crate::collaborators::{
    ArtifactRef, ArtifactStore, BuildJob, BuildOutput, BuildService, CollaboratorResult,
    GitOpsSync, HealthProbe, RepositoryAnalyzer, SyncTarget,
};
use crate::error::CollaboratorError;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct Faults {
    fail_first: u32,
    always: bool,
    delay: Duration,
    calls: AtomicU32,
}

impl Faults {
    /// Count the call, wait out the delay and decide whether it fails.
    async fn attempt(&self, what: &str) -> CollaboratorResult<u32> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.always || call <= self.fail_first {
            debug!(collaborator = what, call, "injected failure");
            return Err(CollaboratorError::new(format!(
                "{what} unavailable (call {call})"
            )));
        }
        Ok(call)
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

macro_rules! fault_builders {
    ($ty:ty) => {
        impl $ty {
            /// Fail the first `n` calls, then succeed.
            pub fn failing_times(mut self, n: u32) -> Self {
                self.faults.fail_first = n;
                self
            }

            pub fn always_failing(mut self) -> Self {
                self.faults.always = true;
                self
            }

            pub fn with_delay(mut self, delay: Duration) -> Self {
                self.faults.delay = delay;
                self
            }

            pub fn calls(&self) -> u32 {
                self.faults.calls()
            }
        }
    };
}

/// Analyzer returning a fixed report.
#[derive(Debug)]
pub struct StaticAnalyzer {
    report: AnalysisReport,
    faults: Faults,
}

impl StaticAnalyzer {
    pub fn new(report: AnalysisReport) -> Self {
        Self {
            report,
            faults: Faults::default(),
        }
    }

    /// Report detecting `services` with full confidence.
    pub fn detecting(services: &[ServiceType], complexity: Complexity) -> Self {
        let detected_services = services
            .iter()
            .map(|s| DetectedService {
                service_type: s.as_str().to_string(),
                confidence: 1.0,
                domain: None,
            })
            .collect();
        Self::new(AnalysisReport {
            detected_services,
            framework: Some("fastapi".to_string()),
            language: Some("python".to_string()),
            complexity,
        })
    }
}

fault_builders!(StaticAnalyzer);

#[async_trait]
impl RepositoryAnalyzer for StaticAnalyzer {
    async fn analyze(
        &self,
        _ctx: &CallContext,
        repository_url: &str,
        branch: &str,
    ) -> CollaboratorResult<AnalysisReport> {
        self.faults.attempt("analyzer").await?;
        debug!(repository_url, branch, "static analysis");
        Ok(self.report.clone())
    }
}

/// Probe reporting a settable status.
#[derive(Debug)]
pub struct StaticProbe {
    status: Mutex<HealthStatus>,
    faults: Faults,
}

impl StaticProbe {
    pub fn new(status: HealthStatus) -> Self {
        Self {
            status: Mutex::new(status),
            faults: Faults::default(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(HealthStatus::Healthy)
    }

    pub fn set_status(&self, status: HealthStatus) {
        *lock(&self.status) = status;
    }
}

fault_builders!(StaticProbe);

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn check(
        &self,
        _ctx: &CallContext,
        _environment: TargetEnvironment,
    ) -> CollaboratorResult<HealthStatus> {
        self.faults.attempt("probe").await?;
        Ok(*lock(&self.status))
    }
}

#[derive(Debug, Default)]
pub struct SimulatedBuild {
    faults: Faults,
}

impl SimulatedBuild {
    pub fn new() -> Self {
        Self::default()
    }
}

fault_builders!(SimulatedBuild);

#[async_trait]
impl BuildService for SimulatedBuild {
    async fn build(&self, _ctx: &CallContext, job: &BuildJob) -> CollaboratorResult<BuildOutput> {
        self.faults.attempt("build").await?;
        let tag = job.deployment_id.simple().to_string();
        let name = job
            .repository_url
            .trim_end_matches(".git")
            .rsplit('/')
            .next()
            .unwrap_or("app")
            .to_string();
        Ok(BuildOutput {
            image: format!("{name}:{}", &tag[..12]),
            digest: format!("sha256:{}", Uuid::new_v4().simple()),
        })
    }
}

#[derive(Debug, Default)]
pub struct SimulatedArtifacts {
    faults: Faults,
}

impl SimulatedArtifacts {
    pub fn new() -> Self {
        Self::default()
    }
}

fault_builders!(SimulatedArtifacts);

#[async_trait]
impl ArtifactStore for SimulatedArtifacts {
    async fn push(&self, _ctx: &CallContext, build: &BuildOutput) -> CollaboratorResult<ArtifactRef> {
        self.faults.attempt("artifact store").await?;
        Ok(ArtifactRef {
            uri: format!("registry.local/{}@{}", build.image, build.digest),
        })
    }
}

#[derive(Debug, Default)]
struct SyncLedger {
    active: HashMap<String, usize>,
    max_active: HashMap<String, usize>,
    synced: Vec<SyncTarget>,
    stops: Vec<SyncTarget>,
    reverts: Vec<SyncTarget>,
}

/// GitOps sync that records what it was asked to do.
#[derive(Debug, Default)]
pub struct SimulatedGitOps {
    faults: Faults,
    ledger: Mutex<SyncLedger>,
}

impl SimulatedGitOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn synced(&self) -> Vec<SyncTarget> {
        lock(&self.ledger).synced.clone()
    }

    pub fn stops(&self) -> Vec<SyncTarget> {
        lock(&self.ledger).stops.clone()
    }

    pub fn reverts(&self) -> Vec<SyncTarget> {
        lock(&self.ledger).reverts.clone()
    }

    /// Highest number of syncs ever in flight at once for `namespace`.
    pub fn max_concurrent(&self, namespace: &str) -> usize {
        lock(&self.ledger)
            .max_active
            .get(namespace)
            .copied()
            .unwrap_or(0)
    }
}

fault_builders!(SimulatedGitOps);

#[async_trait]
impl GitOpsSync for SimulatedGitOps {
    async fn sync(
        &self,
        _ctx: &CallContext,
        target: &SyncTarget,
        _artifact: &ArtifactRef,
    ) -> CollaboratorResult<()> {
        {
            let mut ledger = lock(&self.ledger);
            let active = ledger.active.entry(target.namespace.clone()).or_insert(0);
            *active += 1;
            let now = *active;
            let max = ledger.max_active.entry(target.namespace.clone()).or_insert(0);
            *max = (*max).max(now);
        }
        let outcome = self.faults.attempt("gitops").await;
        let mut ledger = lock(&self.ledger);
        if let Some(active) = ledger.active.get_mut(&target.namespace) {
            *active = active.saturating_sub(1);
        }
        outcome?;
        ledger.synced.push(target.clone());
        Ok(())
    }

    async fn stop(&self, _ctx: &CallContext, target: &SyncTarget) -> CollaboratorResult<()> {
        lock(&self.ledger).stops.push(target.clone());
        Ok(())
    }

    async fn revert(&self, _ctx: &CallContext, target: &SyncTarget) -> CollaboratorResult<()> {
        lock(&self.ledger).reverts.push(target.clone());
        Ok(())
    }
}
