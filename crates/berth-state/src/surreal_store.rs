//! SurrealDB-backed [`DeploymentStore`] and [`IssueSink`].
//!
//! Each request is one row: a few scalar columns for indexing and the
//! compare-and-swap `version`, plus the full JSON snapshot in `document`.

use async_trait::async_trait;
use berth_core::{DeploymentRequest, Issue};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StorageError;
use crate::migrations;
use crate::storage_traits::{DeploymentStore, IssueSink, StorageResult};

const NAMESPACE: &str = "berth";
const DATABASE: &str = "main";

#[derive(Debug, Serialize)]
struct DeploymentRow {
    deployment_id: String,
    version: u64,
    stage: String,
    status: String,
    created_at: String,
    document: String,
}

/// Projection read back from `deployments`.
#[derive(Debug, Deserialize)]
struct DeploymentSnapshot {
    version: u64,
    document: String,
}

#[derive(Debug, Serialize)]
struct IssueRow {
    issue_id: String,
    deployment_id: String,
    created_at: String,
    document: String,
}

#[derive(Debug, Deserialize)]
struct IssueSnapshot {
    document: String,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn status_str<T: Serialize>(value: &T) -> StorageResult<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

pub struct SurrealStateStore {
    db: Surreal<Any>,
}

impl SurrealStateStore {
    /// Embedded in-memory instance (`mem://`).
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB endpoint (`mem://`, `surrealkv://path`, `ws://host`).
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        migrations::init_schema(&db).await?;
        info!(url = %url, "SurrealStateStore connected");
        Ok(Self { db })
    }

    /// `SURREALDB_URL` if set, otherwise local persistence under `.berth/db`.
    pub async fn from_env() -> StorageResult<Self> {
        if let Ok(url) = std::env::var("SURREALDB_URL") {
            return Self::connect(&url).await;
        }
        let path = ".berth/db";
        std::fs::create_dir_all(path).map_err(|e| {
            StorageError::Connection(format!("failed to create {}: {}", path, e))
        })?;
        Self::connect(&format!("surrealkv://{}", path)).await
    }

    fn row_for(request: &DeploymentRequest, version: u64) -> StorageResult<DeploymentRow> {
        let mut snapshot = request.clone();
        snapshot.version = version;
        Ok(DeploymentRow {
            deployment_id: request.id.to_string(),
            version,
            stage: request.stage.as_str().to_string(),
            status: status_str(&request.status)?,
            created_at: timestamp(request.created_at),
            document: serde_json::to_string(&snapshot)?,
        })
    }

    fn decode(snapshot: DeploymentSnapshot) -> StorageResult<DeploymentRequest> {
        let mut request: DeploymentRequest = serde_json::from_str(&snapshot.document)?;
        request.version = snapshot.version;
        Ok(request)
    }

    async fn fetch(&self, id: Uuid) -> StorageResult<Option<DeploymentSnapshot>> {
        let mut res = self
            .db
            .query("SELECT version, document FROM deployments WHERE deployment_id = $did")
            .bind(("did", id.to_string()))
            .await?;
        let rows: Vec<DeploymentSnapshot> = res.take(0)?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl DeploymentStore for SurrealStateStore {
    async fn insert(&self, request: &DeploymentRequest) -> StorageResult<DeploymentRequest> {
        if self.fetch(request.id).await?.is_some() {
            return Err(StorageError::Duplicate { id: request.id });
        }
        let row = Self::row_for(request, 1)?;
        debug!(deployment_id = %request.id, "inserting deployment");
        let created = self
            .db
            .query("CREATE deployments CONTENT $row")
            .bind(("row", row))
            .await
            .and_then(|res| res.check());
        if let Err(err) = created {
            // A concurrent insert of the same id trips the unique index.
            if self.fetch(request.id).await?.is_some() {
                return Err(StorageError::Duplicate { id: request.id });
            }
            return Err(err.into());
        }
        self.get(request.id).await
    }

    async fn get(&self, id: Uuid) -> StorageResult<DeploymentRequest> {
        let snapshot = self.fetch(id).await?.ok_or(StorageError::NotFound { id })?;
        Self::decode(snapshot)
    }

    async fn update(
        &self,
        request: &DeploymentRequest,
        expected_version: u64,
    ) -> StorageResult<DeploymentRequest> {
        let next = expected_version + 1;
        let row = Self::row_for(request, next)?;
        let mut res = self
            .db
            .query(
                "UPDATE deployments SET version = $next, stage = $stage, status = $status, \
                 document = $doc WHERE deployment_id = $did AND version = $expected \
                 RETURN version, document",
            )
            .bind(("next", next))
            .bind(("stage", row.stage))
            .bind(("status", row.status))
            .bind(("doc", row.document))
            .bind(("did", row.deployment_id))
            .bind(("expected", expected_version))
            .await?;
        let rows: Vec<DeploymentSnapshot> = res.take(0)?;

        match rows.into_iter().next() {
            Some(snapshot) => Self::decode(snapshot),
            None => match self.fetch(request.id).await? {
                Some(current) => Err(StorageError::VersionConflict {
                    id: request.id,
                    expected: expected_version,
                    actual: current.version,
                }),
                None => Err(StorageError::NotFound { id: request.id }),
            },
        }
    }

    async fn list(&self) -> StorageResult<Vec<DeploymentRequest>> {
        let mut res = self
            .db
            .query("SELECT version, document, created_at FROM deployments ORDER BY created_at ASC")
            .await?;
        let rows: Vec<DeploymentSnapshot> = res.take(0)?;
        rows.into_iter().map(Self::decode).collect()
    }
}

#[async_trait]
impl IssueSink for SurrealStateStore {
    async fn raise(&self, issue: &Issue) -> StorageResult<()> {
        let row = IssueRow {
            issue_id: issue.id.to_string(),
            deployment_id: issue.deployment_request_id.to_string(),
            created_at: timestamp(issue.created_at),
            document: serde_json::to_string(issue)?,
        };
        self.db
            .query("CREATE issues CONTENT $row")
            .bind(("row", row))
            .await?
            .check()?;
        debug!(issue_id = %issue.id, deployment_id = %issue.deployment_request_id, "issue stored");
        Ok(())
    }

    async fn issues_for(&self, deployment_id: Uuid) -> StorageResult<Vec<Issue>> {
        let mut res = self
            .db
            .query(
                "SELECT document, created_at FROM issues WHERE deployment_id = $did \
                 ORDER BY created_at ASC",
            )
            .bind(("did", deployment_id.to_string()))
            .await?;
        let rows: Vec<IssueSnapshot> = res.take(0)?;
        rows.into_iter()
            .map(|row| serde_json::from_str(&row.document).map_err(StorageError::from))
            .collect()
    }
}
