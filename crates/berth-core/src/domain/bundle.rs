//! Resource bundles, server allocations and cost estimates.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::error::ValidationError;
use super::service::ServiceType;

/// Raw resource demand of one service at its requested channel count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDemand {
    pub service_type: ServiceType,
    pub channel_count: u32,
    pub cpu_cores: f64,
    pub memory_gb: f64,
    pub storage_gb: f64,
    /// Fractional GPU demand (e.g. 0.2 = one fifth of a card).
    pub gpu: f64,
    /// Demand expressed in template capacity units, used for packing.
    pub capacity_units: u64,
}

impl ServiceDemand {
    pub fn is_zero(&self) -> bool {
        self.channel_count == 0 && self.capacity_units == 0
    }
}

/// Whole servers of one standardized role.
///
/// Resource fields are per instance; multiply by `instance_count` for totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAllocation {
    pub role: String,
    pub template: String,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub storage_gb: u32,
    pub gpu_type: Option<String>,
    pub gpu_count: u32,
    pub instance_count: u32,
    /// Services hosted by this role, including co-located ones.
    pub services: Vec<ServiceType>,
    pub demand_units: u64,
    pub capacity_units: u64,
    /// Fixed shared-infrastructure role appended regardless of volume.
    pub common: bool,
}

impl ServerAllocation {
    pub fn total_cpu_cores(&self) -> u64 {
        u64::from(self.cpu_cores) * u64::from(self.instance_count)
    }

    pub fn total_memory_gb(&self) -> u64 {
        u64::from(self.memory_gb) * u64::from(self.instance_count)
    }

    pub fn total_storage_gb(&self) -> u64 {
        u64::from(self.storage_gb) * u64::from(self.instance_count)
    }

    pub fn total_gpu_count(&self) -> u32 {
        self.gpu_count * self.instance_count
    }

    pub fn is_gpu_bearing(&self) -> bool {
        self.gpu_count > 0
    }
}

/// Aggregated resources required to serve a channel mix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceBundle {
    pub cpu_cores: f64,
    pub memory_gb: f64,
    pub storage_gb: f64,
    pub gpu_count: u32,
    pub per_service: Vec<ServiceDemand>,
    pub servers: Vec<ServerAllocation>,
}

impl ResourceBundle {
    /// Aggregate totals from whole-server allocations.
    pub fn from_servers(per_service: Vec<ServiceDemand>, servers: Vec<ServerAllocation>) -> Self {
        let cpu_cores = servers.iter().map(|s| s.total_cpu_cores()).sum::<u64>() as f64;
        let memory_gb = servers.iter().map(|s| s.total_memory_gb()).sum::<u64>() as f64;
        let storage_gb = servers.iter().map(|s| s.total_storage_gb()).sum::<u64>() as f64;
        let gpu_count = servers.iter().map(|s| s.total_gpu_count()).sum();
        Self {
            cpu_cores,
            memory_gb,
            storage_gb,
            gpu_count,
            per_service,
            servers,
        }
    }

    pub fn instance_count(&self) -> u32 {
        self.servers.iter().map(|s| s.instance_count).sum()
    }

    /// Instances serving workload, i.e. excluding common roles.
    pub fn workload_instances(&self) -> u32 {
        self.servers
            .iter()
            .filter(|s| !s.common)
            .map(|s| s.instance_count)
            .sum()
    }

    /// A bundle is empty when no workload role was allocated.
    pub fn is_empty(&self) -> bool {
        self.workload_instances() == 0
    }

    pub fn server(&self, role: &str) -> Option<&ServerAllocation> {
        self.servers.iter().find(|s| s.role == role)
    }
}

/// Operator-specified resources that bypass channel sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomResources {
    pub cpu_cores: f64,
    pub memory_gb: f64,
    pub storage_gb: f64,
    #[serde(default)]
    pub gpu_count: u32,
    #[serde(default)]
    pub gpu_type: Option<String>,
}

impl CustomResources {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (name, value) in [
            ("cpu_cores", self.cpu_cores),
            ("memory_gb", self.memory_gb),
            ("storage_gb", self.storage_gb),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ValidationError::InvalidCustomResources(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        if self.cpu_cores == 0.0 && self.memory_gb == 0.0 && self.gpu_count == 0 {
            return Err(ValidationError::InvalidCustomResources(
                "at least one of cpu_cores, memory_gb or gpu_count must be positive".to_string(),
            ));
        }
        if self.gpu_count > 0 && self.gpu_type.is_none() {
            return Err(ValidationError::InvalidCustomResources(
                "gpu_type is required when gpu_count is set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Supported cloud providers for cost estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Aws,
    Ncp,
    Azure,
    Gcp,
}

impl Provider {
    pub const ALL: [Provider; 4] = [Provider::Aws, Provider::Ncp, Provider::Azure, Provider::Gcp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Ncp => "ncp",
            Provider::Azure => "azure",
            Provider::Gcp => "gcp",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One priced role in a cost estimate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostLineItem {
    pub role: String,
    pub instance_class: String,
    pub instance_count: u32,
    pub monthly_amount: Decimal,
}

/// Monthly cost of a bundle on one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub provider: Provider,
    pub monthly_amount: Decimal,
    pub currency: String,
    pub compute_amount: Decimal,
    pub storage_amount: Decimal,
    pub line_items: Vec<CostLineItem>,
}

/// Output of the resource calculation interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePlan {
    pub bundle: ResourceBundle,
    pub costs: Vec<CostEstimate>,
}
