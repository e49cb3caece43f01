//! Capacity estimation: channel counts → raw per-service resource demand.
//!
//! Demand is `channel_count × coefficient` for every resource dimension.
//! The estimator is pure; identical requirements always produce identical
//! output, in [`ServiceType`] order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{ChannelRequirements, PlanError, PlanResult, ServiceDemand, ServiceType};

/// Per-channel resource coefficients of one service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServiceCoefficients {
    pub cpu_cores: f64,
    pub memory_gb: f64,
    pub storage_gb: f64,
    /// Fraction of one GPU consumed per channel.
    pub gpu: f64,
    /// Template capacity units consumed per channel.
    pub capacity_units: u64,
}

impl ServiceCoefficients {
    pub const fn new(
        cpu_cores: f64,
        memory_gb: f64,
        storage_gb: f64,
        gpu: f64,
        capacity_units: u64,
    ) -> Self {
        Self {
            cpu_cores,
            memory_gb,
            storage_gb,
            gpu,
            capacity_units,
        }
    }
}

/// Coefficient lookup keyed by service type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientTable {
    entries: BTreeMap<ServiceType, ServiceCoefficients>,
}

impl Default for CoefficientTable {
    fn default() -> Self {
        use ServiceType::*;
        let entries = [
            (Callbot, ServiceCoefficients::new(0.25, 0.5, 1.0, 0.02, 2)),
            (Chatbot, ServiceCoefficients::new(0.10, 0.25, 0.5, 0.01, 1)),
            (Advisor, ServiceCoefficients::new(0.30, 1.0, 2.0, 0.04, 4)),
            (Stt, ServiceCoefficients::new(0.20, 0.6, 4.0, 0.02, 2)),
            (Tts, ServiceCoefficients::new(0.20, 0.8, 2.0, 0.02, 2)),
            (Ta, ServiceCoefficients::new(0.50, 1.6, 10.0, 0.0, 5)),
            (Qa, ServiceCoefficients::new(0.40, 1.2, 20.0, 0.0, 4)),
        ];
        Self {
            entries: entries.into_iter().collect(),
        }
    }
}

impl CoefficientTable {
    /// An empty table; services must be added with [`CoefficientTable::insert`].
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, service: ServiceType, coefficients: ServiceCoefficients) {
        self.entries.insert(service, coefficients);
    }

    pub fn get(&self, service: ServiceType) -> Option<&ServiceCoefficients> {
        self.entries.get(&service)
    }
}

/// Converts channel requirements into per-service resource demand.
#[derive(Debug, Clone, Default)]
pub struct CapacityEstimator {
    table: CoefficientTable,
}

impl CapacityEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(table: CoefficientTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &CoefficientTable {
        &self.table
    }

    /// Estimate demand for every listed service, zero-channel entries included.
    ///
    /// Fails with [`PlanError::UnsupportedService`] when the table has no
    /// coefficients for a listed service.
    pub fn estimate(&self, requirements: &ChannelRequirements) -> PlanResult<Vec<ServiceDemand>> {
        requirements
            .iter()
            .map(|req| {
                let coeff =
                    self.table
                        .get(req.service_type)
                        .ok_or_else(|| PlanError::UnsupportedService {
                            service: req.service_type.to_string(),
                        })?;
                let channels = f64::from(req.channel_count);
                Ok(ServiceDemand {
                    service_type: req.service_type,
                    channel_count: req.channel_count,
                    cpu_cores: round3(channels * coeff.cpu_cores),
                    memory_gb: round3(channels * coeff.memory_gb),
                    storage_gb: round3(channels * coeff.storage_gb),
                    gpu: round3(channels * coeff.gpu),
                    capacity_units: u64::from(req.channel_count) * coeff.capacity_units,
                })
            })
            .collect()
    }

    /// Validate untrusted `(service, count)` pairs, then estimate.
    pub fn estimate_raw<I, S>(&self, entries: I) -> PlanResult<Vec<ServiceDemand>>
    where
        I: IntoIterator<Item = (S, i64)>,
        S: AsRef<str>,
    {
        let requirements = ChannelRequirements::from_raw(entries)?;
        self.estimate(&requirements)
    }
}

/// Round to three decimals so that float noise never leaks into outputs.
fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
