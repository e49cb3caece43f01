//! Persistence seams for deployment requests and issues.
//!
//! The [`DeploymentStore`] is the sole unit of persistence for request
//! state. Writers use versioned compare-and-swap so that every committed
//! snapshot is a whole transition; readers always get immutable clones.

use async_trait::async_trait;
use berth_core::{DeploymentRequest, Issue};
use uuid::Uuid;

use crate::error::StorageError;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Persist a new request. The stored copy is returned with `version == 1`.
    ///
    /// Fails with [`StorageError::Duplicate`] if the id already exists.
    async fn insert(&self, request: &DeploymentRequest) -> StorageResult<DeploymentRequest>;

    /// Snapshot of a request.
    async fn get(&self, id: Uuid) -> StorageResult<DeploymentRequest>;

    /// Replace a request if its stored version still equals `expected_version`.
    ///
    /// Returns the stored copy with the version bumped by one, or
    /// [`StorageError::VersionConflict`] when another writer got there first.
    async fn update(
        &self,
        request: &DeploymentRequest,
        expected_version: u64,
    ) -> StorageResult<DeploymentRequest>;

    /// All requests, oldest first.
    async fn list(&self) -> StorageResult<Vec<DeploymentRequest>>;
}

/// Issue-tracking collaborator; receives one issue per failed request.
#[async_trait]
pub trait IssueSink: Send + Sync {
    async fn raise(&self, issue: &Issue) -> StorageResult<()>;

    /// Issues raised for one request, oldest first.
    async fn issues_for(&self, deployment_id: Uuid) -> StorageResult<Vec<Issue>>;
}
