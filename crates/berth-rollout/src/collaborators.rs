//! Contracts with the external subsystems the engine drives.
//!
//! Every call takes an explicit [`CallContext`]; there is no ambient session.

use std::collections::BTreeMap;

use async_trait::async_trait;
use berth_core::{
    AnalysisReport, CallContext, DeploymentStrategy, HealthStatus, TargetEnvironment,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CollaboratorError;

pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

/// Repository analysis: detects services, framework and complexity.
#[async_trait]
pub trait RepositoryAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        ctx: &CallContext,
        repository_url: &str,
        branch: &str,
    ) -> CollaboratorResult<AnalysisReport>;
}

/// Health check of one subsystem for one environment. Must be side-effect free.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(
        &self,
        ctx: &CallContext,
        environment: TargetEnvironment,
    ) -> CollaboratorResult<HealthStatus>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    pub deployment_id: Uuid,
    pub repository_url: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub image: String,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub uri: String,
}

/// Where and how a GitOps sync lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    pub cluster: String,
    pub namespace: String,
    pub strategy: DeploymentStrategy,
    pub replicas: BTreeMap<String, u32>,
    pub config_digest: String,
}

#[async_trait]
pub trait BuildService: Send + Sync {
    async fn build(&self, ctx: &CallContext, job: &BuildJob) -> CollaboratorResult<BuildOutput>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn push(&self, ctx: &CallContext, build: &BuildOutput) -> CollaboratorResult<ArtifactRef>;
}

#[async_trait]
pub trait GitOpsSync: Send + Sync {
    async fn sync(
        &self,
        ctx: &CallContext,
        target: &SyncTarget,
        artifact: &ArtifactRef,
    ) -> CollaboratorResult<()>;

    /// Halt reconciliation of `target` after a failed dispatch.
    async fn stop(&self, ctx: &CallContext, target: &SyncTarget) -> CollaboratorResult<()>;

    /// Revert `target` to its previous revision.
    async fn revert(&self, ctx: &CallContext, target: &SyncTarget) -> CollaboratorResult<()>;
}
