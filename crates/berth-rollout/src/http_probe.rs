//! HTTP health probe: `GET {endpoint}` per environment.
//!
//! 2xx → healthy, any other HTTP status → degraded, transport error →
//! collaborator error (recorded as unreachable by the verifier).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use berth_core::{CallContext, HealthStatus, TargetEnvironment};

use crate::collaborators::{CollaboratorResult, HealthProbe};
use crate::error::CollaboratorError;

pub struct HttpHealthProbe {
    client: reqwest::Client,
    default_endpoint: String,
    per_environment: BTreeMap<TargetEnvironment, String>,
}

impl HttpHealthProbe {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::new(format!("http client: {e}")))?;
        Ok(Self {
            client,
            default_endpoint: endpoint.into(),
            per_environment: BTreeMap::new(),
        })
    }

    /// Use a different endpoint for one environment.
    pub fn with_environment(mut self, env: TargetEnvironment, endpoint: impl Into<String>) -> Self {
        self.per_environment.insert(env, endpoint.into());
        self
    }

    fn endpoint(&self, env: TargetEnvironment) -> &str {
        self.per_environment
            .get(&env)
            .map(String::as_str)
            .unwrap_or(&self.default_endpoint)
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(
        &self,
        ctx: &CallContext,
        environment: TargetEnvironment,
    ) -> CollaboratorResult<HealthStatus> {
        let mut request = self
            .client
            .get(self.endpoint(environment))
            .header("x-correlation-id", ctx.correlation_id.to_string());
        if let Some(token) = ctx.token() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| CollaboratorError::new(e.to_string()))?;
        let status = response.status();
        Ok(if status.is_success() {
            HealthStatus::Healthy
        } else {
            tracing::debug!(status = %status, "health endpoint answered non-2xx");
            HealthStatus::Degraded
        })
    }
}
