//! Resource calculation: channels or custom resources → bundle + costs.

use serde::{Deserialize, Serialize};

use crate::allocator::BundleAllocator;
use crate::capacity::CapacityEstimator;
use crate::cost::CostEstimator;
use crate::domain::{
    ChannelRequirements, CustomResources, PlanResult, ResourceBundle, ResourcePlan,
    ServerAllocation, ValidationError,
};

/// Input of the resource calculation interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceCalculationInput {
    ChannelRequirements(ChannelRequirements),
    CustomResources(CustomResources),
}

/// Estimator, allocator and cost tables wired together.
#[derive(Debug, Clone, Default)]
pub struct ResourcePlanner {
    estimator: CapacityEstimator,
    allocator: BundleAllocator,
    costs: CostEstimator,
}

impl ResourcePlanner {
    pub fn new(
        estimator: CapacityEstimator,
        allocator: BundleAllocator,
        costs: CostEstimator,
    ) -> Self {
        Self {
            estimator,
            allocator,
            costs,
        }
    }

    pub fn plan(&self, input: &ResourceCalculationInput) -> PlanResult<ResourcePlan> {
        let bundle = match input {
            ResourceCalculationInput::ChannelRequirements(reqs) => self.bundle_for(reqs)?,
            ResourceCalculationInput::CustomResources(custom) => custom_bundle(custom)?,
        };
        // Costs always follow the bundle they were computed from.
        let costs = self.costs.estimate_cost(&bundle);
        Ok(ResourcePlan { bundle, costs })
    }

    /// Estimate and allocate; at least one service must have channels.
    pub fn bundle_for(&self, requirements: &ChannelRequirements) -> PlanResult<ResourceBundle> {
        if requirements.has_no_demand() {
            return Err(ValidationError::NoServiceDemand.into());
        }
        let demand = self.estimator.estimate(requirements)?;
        self.allocator.allocate(&demand)
    }
}

/// Single-server bundle sized directly from operator-specified resources.
fn custom_bundle(custom: &CustomResources) -> PlanResult<ResourceBundle> {
    custom.validate()?;
    let server = ServerAllocation {
        role: "custom".to_string(),
        template: "custom".to_string(),
        cpu_cores: whole(custom.cpu_cores),
        memory_gb: whole(custom.memory_gb),
        storage_gb: whole(custom.storage_gb),
        gpu_type: custom.gpu_type.clone(),
        gpu_count: custom.gpu_count,
        instance_count: 1,
        services: Vec::new(),
        demand_units: 1,
        capacity_units: 1,
        common: false,
    };
    Ok(ResourceBundle::from_servers(Vec::new(), vec![server]))
}

fn whole(value: f64) -> u32 {
    value.ceil().clamp(0.0, f64::from(u32::MAX)) as u32
}
