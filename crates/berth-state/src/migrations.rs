//! SurrealDB schema for deployments and issues. Idempotent.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::storage_traits::StorageResult;

pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    init_deployments_table(db).await?;
    init_issues_table(db).await?;
    info!("berth schema initialization complete");
    Ok(())
}

/// ```text
/// TABLE deployments {
///   deployment_id: STRING (unique)
///   version:       INT    (compare-and-swap counter)
///   stage:         STRING
///   status:        STRING
///   created_at:    STRING (RFC 3339, fixed width)
///   document:      STRING (JSON snapshot of the request)
/// }
/// ```
async fn init_deployments_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing deployments table");
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS deployments SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_deployment_id ON TABLE deployments COLUMNS deployment_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_deployment_status ON TABLE deployments COLUMNS status;
        DEFINE INDEX IF NOT EXISTS idx_deployment_created ON TABLE deployments COLUMNS created_at;
    "#;
    db.query(sql).await?.check()?;
    Ok(())
}

/// ```text
/// TABLE issues {
///   issue_id:      STRING (unique)
///   deployment_id: STRING (indexed)
///   created_at:    STRING
///   document:      STRING (JSON issue)
/// }
/// ```
async fn init_issues_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing issues table");
    let sql = r#"
        DEFINE TABLE IF NOT EXISTS issues SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_issue_id ON TABLE issues COLUMNS issue_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_issue_deployment ON TABLE issues COLUMNS deployment_id;
    "#;
    db.query(sql).await?.check()?;
    Ok(())
}
