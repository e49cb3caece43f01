//! Engine configuration, read from TOML.
//!
//! Every field has a default, so an empty file is a valid configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{TargetEnvironment, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Suffix of generated per-service domains.
    pub base_domain: String,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    /// Target environment name → cluster name.
    pub clusters: BTreeMap<String, String>,
}

/// External-call deadlines, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub analysis_ms: u64,
    pub health_check_ms: u64,
    pub dispatch_step_ms: u64,
    pub poll_interval_ms: u64,
    pub execution_deadline_ms: u64,
    /// Per-attempt deadline for raising an issue.
    pub issue_ms: u64,
}

/// Bounded retry with exponential backoff for dispatcher sub-steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let clusters = [
            ("development", "dev-cluster"),
            ("staging", "stg-cluster"),
            ("production", "prd-cluster"),
        ]
        .into_iter()
        .map(|(env, cluster)| (env.to_string(), cluster.to_string()))
        .collect();
        Self {
            base_domain: "example.internal".to_string(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            clusters,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            analysis_ms: 30_000,
            health_check_ms: 5_000,
            dispatch_step_ms: 60_000,
            poll_interval_ms: 1_000,
            execution_deadline_ms: 1_800_000,
            issue_ms: 5_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl TimeoutConfig {
    pub fn analysis(&self) -> Duration {
        Duration::from_millis(self.analysis_ms)
    }

    pub fn health_check(&self) -> Duration {
        Duration::from_millis(self.health_check_ms)
    }

    pub fn dispatch_step(&self) -> Duration {
        Duration::from_millis(self.dispatch_step_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn execution_deadline(&self) -> Duration {
        Duration::from_millis(self.execution_deadline_ms)
    }

    pub fn issue(&self) -> Duration {
        Duration::from_millis(self.issue_ms)
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based): `base × 2^(attempt-1)`,
    /// capped at `max_delay_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ValidationError> {
        let config: EngineConfig =
            toml::from_str(raw).map_err(|e| ValidationError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ValidationError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |msg: &str| Err(ValidationError::InvalidConfig(msg.to_string()));
        if self.base_domain.trim().is_empty() {
            return invalid("base_domain must not be empty");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return invalid("retry.max_delay_ms must be >= retry.base_delay_ms");
        }
        let t = &self.timeouts;
        for (name, value) in [
            ("timeouts.analysis_ms", t.analysis_ms),
            ("timeouts.health_check_ms", t.health_check_ms),
            ("timeouts.dispatch_step_ms", t.dispatch_step_ms),
            ("timeouts.poll_interval_ms", t.poll_interval_ms),
            ("timeouts.execution_deadline_ms", t.execution_deadline_ms),
            ("timeouts.issue_ms", t.issue_ms),
        ] {
            if value == 0 {
                return Err(ValidationError::InvalidConfig(format!(
                    "{} must be positive",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Cluster serving `env`.
    pub fn cluster_for(&self, env: TargetEnvironment) -> Result<&str, ValidationError> {
        self.clusters
            .get(env.as_str())
            .map(String::as_str)
            .ok_or_else(|| {
                ValidationError::InvalidConfig(format!("no cluster configured for {}", env))
            })
    }
}
