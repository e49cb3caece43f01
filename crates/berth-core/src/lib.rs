//! Berth core library.
//!
//! Deployment data model, capacity estimation, bundle allocation, cost
//! estimation and configuration generation. Everything here is synchronous
//! and side-effect free; orchestration lives in `berth-rollout`.

pub mod allocator;
pub mod capacity;
pub mod config;
pub mod config_gen;
pub mod cost;
pub mod domain;
pub mod metrics;
pub mod obs;
pub mod planner;
pub mod telemetry;

pub use allocator::{AllocationTable, BundleAllocator, CommonRole, Placement, RoleSpec, ServerTemplate};
pub use capacity::{CapacityEstimator, CoefficientTable, ServiceCoefficients};
pub use config::{EngineConfig, RetryConfig, TimeoutConfig};
pub use config_gen::{generate_config, namespace_for, select_strategy, slugify};
pub use cost::{default_pricing, estimate_cost, CostEstimator, InstanceClass, ProviderPricing};
pub use domain::*;
pub use planner::{ResourceCalculationInput, ResourcePlanner};

pub use metrics::METRICS;
pub use obs::DeploymentSpan;
pub use telemetry::init_tracing;

/// Berth version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
