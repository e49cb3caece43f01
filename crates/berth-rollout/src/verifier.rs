//! Infrastructure health verification.
//!
//! One probe per subsystem, all fired concurrently, each bounded by a
//! timeout. A timeout or probe error is recorded as `unreachable`; the
//! verifier itself never fails.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use berth_core::{
    CallContext, HealthStatus, InfraReport, InfrastructureHealth, SystemName, TargetEnvironment,
};
use chrono::Utc;
use futures::future::join_all;
use tracing::debug;

use crate::collaborators::HealthProbe;
use crate::error::{RolloutError, RolloutResult};

#[derive(Clone)]
pub struct InfraVerifier {
    probes: BTreeMap<SystemName, Arc<dyn HealthProbe>>,
    timeout: Duration,
}

impl InfraVerifier {
    pub fn new(timeout: Duration) -> Self {
        Self {
            probes: BTreeMap::new(),
            timeout,
        }
    }

    pub fn with_probes(timeout: Duration, probes: BTreeMap<SystemName, Arc<dyn HealthProbe>>) -> Self {
        Self { probes, timeout }
    }

    pub fn with_probe(mut self, system: SystemName, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.insert(system, probe);
        self
    }

    /// Check every required subsystem; one entry per [`SystemName`].
    pub async fn verify(&self, ctx: &CallContext, environment: TargetEnvironment) -> InfraReport {
        let checks = SystemName::ALL.iter().map(|system| {
            let probe = self.probes.get(system).cloned();
            async move {
                let (status, detail) = match probe {
                    None => (HealthStatus::Unreachable, Some("no probe configured".to_string())),
                    Some(probe) => {
                        match tokio::time::timeout(self.timeout, probe.check(ctx, environment)).await {
                            Ok(Ok(status)) => (status, None),
                            Ok(Err(e)) => (HealthStatus::Unreachable, Some(e.to_string())),
                            Err(_) => (
                                HealthStatus::Unreachable,
                                Some(format!("timed out after {} ms", self.timeout.as_millis())),
                            ),
                        }
                    }
                };
                debug!(system = %system, status = ?status, "health probe finished");
                InfrastructureHealth {
                    system_name: *system,
                    status,
                    checked_at: Utc::now(),
                    detail,
                }
            }
        });
        InfraReport::new(environment, join_all(checks).await)
    }

    /// Like [`InfraVerifier::verify`], but an unready report is an error.
    pub async fn require_ready(
        &self,
        ctx: &CallContext,
        environment: TargetEnvironment,
    ) -> RolloutResult<InfraReport> {
        let report = self.verify(ctx, environment).await;
        if report.all_ready {
            Ok(report)
        } else {
            Err(RolloutError::InfraUnready {
                unready: report.unready(),
            })
        }
    }
}
