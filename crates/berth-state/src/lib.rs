//! Berth state: persistence for deployment requests and issues.
//!
//! - `DeploymentStore`: versioned compare-and-swap of request snapshots
//! - `IssueSink`: failure reports for the issue-tracking collaborator
//! - `fakes`: in-memory implementations for tests and simulation
//! - `SurrealStateStore`: SurrealDB implementation of both

mod error;
pub mod fakes;
mod migrations;
pub mod storage_traits;
pub mod surreal_store;

pub use error::StorageError;
pub use fakes::{MemoryDeploymentStore, MemoryIssueSink};
pub use storage_traits::{DeploymentStore, IssueSink, StorageResult};
pub use surreal_store::SurrealStateStore;
