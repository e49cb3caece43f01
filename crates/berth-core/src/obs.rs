//! Structured observability hooks for the deployment lifecycle.
//!
//! - Request-scoped spans via the `DeploymentSpan` RAII guard
//! - Emission functions for submission, stage commits, checkpoint retries,
//!   failures, cancellation and issue creation
//!
//! Events are emitted at `info!` (failures at `warn!`) with an `event` key,
//! so `RUST_LOG=berth=info` plus `--json` yields one JSON object per event.

use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{ErrorKind, Stage};

/// RAII guard that enters a request-scoped span.
///
/// ```ignore
/// let _span = DeploymentSpan::enter(request.id);
/// // every event in scope carries deployment_id
/// ```
pub struct DeploymentSpan {
    _span: tracing::span::EnteredSpan,
}

impl DeploymentSpan {
    pub fn enter(deployment_id: Uuid) -> Self {
        Self {
            _span: deployment_span(deployment_id).entered(),
        }
    }
}

/// The request-scoped span, for `Instrument`-ing futures that cross awaits.
pub fn deployment_span(deployment_id: Uuid) -> tracing::Span {
    tracing::info_span!("berth.deployment", deployment_id = %deployment_id)
}

pub fn emit_request_submitted(deployment_id: Uuid, project: &str, environment: &str) {
    info!(
        event = "deployment.submitted",
        deployment_id = %deployment_id,
        project = %project,
        environment = %environment,
    );
}

/// Emit event: a stage transition was committed.
pub fn emit_stage_committed(deployment_id: Uuid, from: Stage, to: Stage, duration_ms: u64) {
    info!(
        event = "deployment.stage_committed",
        deployment_id = %deployment_id,
        from = %from,
        to = %to,
        duration_ms = duration_ms,
    );
}

/// Emit event: the infra checkpoint did not pass and awaits another attempt.
pub fn emit_checkpoint_blocked(deployment_id: Uuid, attempt: u32, unready: &[String]) {
    info!(
        event = "deployment.checkpoint_blocked",
        deployment_id = %deployment_id,
        attempt = attempt,
        unready = %unready.join(","),
    );
}

pub fn emit_stage_failed(deployment_id: Uuid, stage: Stage, kind: ErrorKind, error: &str) {
    warn!(
        event = "deployment.failed",
        deployment_id = %deployment_id,
        stage = %stage,
        kind = kind.as_str(),
        error = %error,
    );
}

pub fn emit_cancelled(deployment_id: Uuid, from: Stage) {
    info!(event = "deployment.cancelled", deployment_id = %deployment_id, from = %from);
}

pub fn emit_issue_raised(deployment_id: Uuid, issue_id: Uuid, stage: Stage) {
    info!(
        event = "issue.raised",
        deployment_id = %deployment_id,
        issue_id = %issue_id,
        stage = %stage,
    );
}

/// Emit event: a dispatcher sub-step failed and will be retried.
pub fn emit_step_retry(execution_id: &str, step: &str, attempt: u32, error: &dyn std::fmt::Display) {
    warn!(
        event = "dispatch.step_retry",
        execution_id = %execution_id,
        step = %step,
        attempt = attempt,
        error = %error,
    );
}
