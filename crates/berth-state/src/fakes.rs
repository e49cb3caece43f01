//! In-memory implementations of the storage traits.
//!
//! `MemoryDeploymentStore` and `MemoryIssueSink` honour the same contracts
//! as the SurrealDB store and back tests and local simulation.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use berth_core::{DeploymentRequest, Issue};
use uuid::Uuid;

use crate::error::StorageError;
use crate::storage_traits::*;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// MemoryDeploymentStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryDeploymentStore {
    requests: Mutex<HashMap<Uuid, DeploymentRequest>>,
}

impl MemoryDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for MemoryDeploymentStore {
    async fn insert(&self, request: &DeploymentRequest) -> StorageResult<DeploymentRequest> {
        let mut requests = lock(&self.requests);
        if requests.contains_key(&request.id) {
            return Err(StorageError::Duplicate { id: request.id });
        }
        let mut stored = request.clone();
        stored.version = 1;
        requests.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: Uuid) -> StorageResult<DeploymentRequest> {
        lock(&self.requests)
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound { id })
    }

    async fn update(
        &self,
        request: &DeploymentRequest,
        expected_version: u64,
    ) -> StorageResult<DeploymentRequest> {
        let mut requests = lock(&self.requests);
        let current = requests
            .get_mut(&request.id)
            .ok_or(StorageError::NotFound { id: request.id })?;
        if current.version != expected_version {
            return Err(StorageError::VersionConflict {
                id: request.id,
                expected: expected_version,
                actual: current.version,
            });
        }
        let mut stored = request.clone();
        stored.version = expected_version + 1;
        *current = stored.clone();
        Ok(stored)
    }

    async fn list(&self) -> StorageResult<Vec<DeploymentRequest>> {
        let mut all: Vec<_> = lock(&self.requests).values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// MemoryIssueSink
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryIssueSink {
    issues: Mutex<Vec<Issue>>,
}

impl MemoryIssueSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every issue raised so far, in order.
    pub fn all(&self) -> Vec<Issue> {
        lock(&self.issues).clone()
    }
}

#[async_trait]
impl IssueSink for MemoryIssueSink {
    async fn raise(&self, issue: &Issue) -> StorageResult<()> {
        lock(&self.issues).push(issue.clone());
        Ok(())
    }

    async fn issues_for(&self, deployment_id: Uuid) -> StorageResult<Vec<Issue>> {
        Ok(lock(&self.issues)
            .iter()
            .filter(|i| i.deployment_request_id == deployment_id)
            .cloned()
            .collect())
    }
}
