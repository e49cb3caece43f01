//! Cost estimation: price a [`ResourceBundle`] per cloud provider.
//!
//! Each role is matched to the cheapest instance class covering its vCPU,
//! memory and GPU needs. Monthly cost is `hourly × 730 × instances` plus
//! block storage. A provider with no class for some role is omitted.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{CostEstimate, CostLineItem, Provider, ResourceBundle, ServerAllocation};

/// Billing hours per month.
pub const HOURS_PER_MONTH: u32 = 730;

/// One purchasable instance class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceClass {
    pub name: String,
    pub vcpu: u32,
    pub memory_gb: u32,
    pub gpu_type: Option<String>,
    pub gpu_count: u32,
    pub hourly_price: Decimal,
}

impl InstanceClass {
    fn covers(&self, server: &ServerAllocation) -> bool {
        if self.vcpu < server.cpu_cores || self.memory_gb < server.memory_gb {
            return false;
        }
        if server.gpu_count == 0 {
            return true;
        }
        let same_model = match (&self.gpu_type, &server.gpu_type) {
            (Some(have), Some(want)) => have.eq_ignore_ascii_case(want),
            (Some(_), None) => true,
            (None, _) => false,
        };
        same_model && self.gpu_count >= server.gpu_count
    }
}

/// Price table of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPricing {
    pub provider: Provider,
    pub currency: String,
    pub classes: Vec<InstanceClass>,
    /// Block storage price per GB-month.
    pub storage_gb_month: Decimal,
}

impl ProviderPricing {
    /// Cheapest class covering `server`; ties go to the smaller class.
    pub fn cheapest_for(&self, server: &ServerAllocation) -> Option<&InstanceClass> {
        self.classes
            .iter()
            .filter(|c| c.covers(server))
            .min_by(|a, b| {
                a.hourly_price
                    .cmp(&b.hourly_price)
                    .then(a.vcpu.cmp(&b.vcpu))
                    .then(a.memory_gb.cmp(&b.memory_gb))
            })
    }

    fn minor_units(&self) -> u32 {
        if self.currency == "KRW" {
            0
        } else {
            2
        }
    }
}

fn class(
    name: &str,
    vcpu: u32,
    memory_gb: u32,
    gpu: Option<(&str, u32)>,
    hourly_price: Decimal,
) -> InstanceClass {
    InstanceClass {
        name: name.to_string(),
        vcpu,
        memory_gb,
        gpu_type: gpu.map(|(t, _)| t.to_string()),
        gpu_count: gpu.map(|(_, n)| n).unwrap_or(0),
        hourly_price,
    }
}

/// Built-in list prices for every supported provider.
pub fn default_pricing() -> Vec<ProviderPricing> {
    vec![
        ProviderPricing {
            provider: Provider::Aws,
            currency: "USD".to_string(),
            classes: vec![
                class("m6i.xlarge", 4, 16, None, Decimal::new(192, 3)),
                class("m6i.2xlarge", 8, 32, None, Decimal::new(384, 3)),
                class("r6i.2xlarge", 8, 64, None, Decimal::new(504, 3)),
                class("m6i.4xlarge", 16, 64, None, Decimal::new(768, 3)),
                class("g4dn.4xlarge", 16, 64, Some(("T4", 1)), Decimal::new(1204, 3)),
                class("g4dn.12xlarge", 48, 192, Some(("T4", 4)), Decimal::new(3912, 3)),
            ],
            storage_gb_month: Decimal::new(8, 2),
        },
        ProviderPricing {
            provider: Provider::Ncp,
            currency: "KRW".to_string(),
            classes: vec![
                class("s4-g3", 4, 16, None, Decimal::from(210)),
                class("s8-g3", 8, 32, None, Decimal::from(420)),
                class("s16-g3", 16, 64, None, Decimal::from(840)),
                class("gpu-t4.g1", 16, 80, Some(("T4", 1)), Decimal::from(1620)),
            ],
            storage_gb_month: Decimal::from(80),
        },
        ProviderPricing {
            provider: Provider::Azure,
            currency: "USD".to_string(),
            classes: vec![
                class("D4s_v5", 4, 16, None, Decimal::new(192, 3)),
                class("D8s_v5", 8, 32, None, Decimal::new(384, 3)),
                class("D16s_v5", 16, 64, None, Decimal::new(768, 3)),
                class("NC16as_T4_v3", 16, 110, Some(("T4", 1)), Decimal::new(1204, 3)),
            ],
            storage_gb_month: Decimal::new(75, 3),
        },
        ProviderPricing {
            provider: Provider::Gcp,
            currency: "USD".to_string(),
            classes: vec![
                class("n2-standard-4", 4, 16, None, Decimal::new(194, 3)),
                class("n2-standard-8", 8, 32, None, Decimal::new(388, 3)),
                class("n2-standard-16", 16, 64, None, Decimal::new(777, 3)),
                class("n1-highmem-16-t4", 16, 104, Some(("T4", 1)), Decimal::new(1296, 3)),
            ],
            storage_gb_month: Decimal::new(4, 2),
        },
    ]
}

/// Prices bundles against a set of provider tables.
#[derive(Debug, Clone)]
pub struct CostEstimator {
    tables: Vec<ProviderPricing>,
}

impl Default for CostEstimator {
    fn default() -> Self {
        Self {
            tables: default_pricing(),
        }
    }
}

impl CostEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tables(tables: Vec<ProviderPricing>) -> Self {
        Self { tables }
    }

    /// One estimate per provider that can host every role of `bundle`.
    pub fn estimate_cost(&self, bundle: &ResourceBundle) -> Vec<CostEstimate> {
        self.tables
            .iter()
            .filter_map(|pricing| self.estimate_for(pricing, bundle))
            .collect()
    }

    fn estimate_for(&self, pricing: &ProviderPricing, bundle: &ResourceBundle) -> Option<CostEstimate> {
        let hours = Decimal::from(HOURS_PER_MONTH);
        let dp = pricing.minor_units();
        let mut line_items = Vec::with_capacity(bundle.servers.len());
        let mut compute = Decimal::ZERO;
        let mut storage_gb: u64 = 0;

        for server in &bundle.servers {
            let Some(class) = pricing.cheapest_for(server) else {
                tracing::warn!(
                    provider = %pricing.provider,
                    role = %server.role,
                    cpu_cores = server.cpu_cores,
                    memory_gb = server.memory_gb,
                    gpu_count = server.gpu_count,
                    "no instance class matches role; provider omitted"
                );
                return None;
            };
            let amount = class.hourly_price * hours * Decimal::from(server.instance_count);
            compute += amount;
            storage_gb += server.total_storage_gb();
            line_items.push(CostLineItem {
                role: server.role.clone(),
                instance_class: class.name.clone(),
                instance_count: server.instance_count,
                monthly_amount: amount.round_dp(dp),
            });
        }

        let storage = pricing.storage_gb_month * Decimal::from(storage_gb);
        Some(CostEstimate {
            provider: pricing.provider,
            monthly_amount: (compute + storage).round_dp(dp),
            currency: pricing.currency.clone(),
            compute_amount: compute.round_dp(dp),
            storage_amount: storage.round_dp(dp),
            line_items,
        })
    }
}

/// Price `bundle` with the built-in tables.
pub fn estimate_cost(bundle: &ResourceBundle) -> Vec<CostEstimate> {
    CostEstimator::new().estimate_cost(bundle)
}
