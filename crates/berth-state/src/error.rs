//! Error types for berth-state

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by [`crate::DeploymentStore`] and [`crate::IssueSink`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("deployment not found: {id}")]
    NotFound { id: Uuid },

    #[error("deployment already exists: {id}")]
    Duplicate { id: Uuid },

    /// Compare-and-swap lost against a concurrent writer.
    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    VersionConflict { id: Uuid, expected: u64, actual: u64 },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("database connection failed: {0}")]
    Connection(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}
