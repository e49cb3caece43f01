//! Bundle allocation: pack per-service demand onto whole standardized servers.
//!
//! 1. Services are grouped into roles; each role runs on one template.
//! 2. Dedicated roles get `ceil(units / template_capacity)` instances.
//! 3. Shared roles are co-located onto the first already-allocated role of
//!    the same template whose spare units cover them, otherwise they get
//!    their own instances.
//! 4. Common infrastructure roles are appended with a fixed footprint.

use serde::{Deserialize, Serialize};

use crate::domain::{
    PlanError, PlanResult, ResourceBundle, ServerAllocation, ServiceDemand, ServiceType,
};

/// A standardized hardware profile used as the packing unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTemplate {
    pub name: String,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub storage_gb: u32,
    pub gpu_type: Option<String>,
    pub gpu_count: u32,
    /// Hard per-instance capacity ceiling in units.
    pub capacity_units: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Dedicated,
    Shared,
}

/// A deployable server role and the services it hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub name: String,
    pub template: String,
    pub placement: Placement,
    pub services: Vec<ServiceType>,
}

/// Fixed shared-infrastructure role, one instance regardless of volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonRole {
    pub name: String,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub storage_gb: u32,
}

/// Templates, roles and common roles the allocator packs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationTable {
    pub templates: Vec<ServerTemplate>,
    pub roles: Vec<RoleSpec>,
    pub common: Vec<CommonRole>,
}

impl Default for AllocationTable {
    fn default() -> Self {
        let gpu_t4 = ServerTemplate {
            name: "gpu-t4".to_string(),
            cpu_cores: 16,
            memory_gb: 64,
            storage_gb: 500,
            gpu_type: Some("T4".to_string()),
            gpu_count: 1,
            capacity_units: 100,
        };
        let cpu_std = ServerTemplate {
            name: "cpu-std".to_string(),
            cpu_cores: 8,
            memory_gb: 32,
            storage_gb: 500,
            gpu_type: None,
            gpu_count: 0,
            capacity_units: 40,
        };

        let role = |name: &str, template: &str, placement, services: &[ServiceType]| RoleSpec {
            name: name.to_string(),
            template: template.to_string(),
            placement,
            services: services.to_vec(),
        };
        let roles = vec![
            role("tts", "gpu-t4", Placement::Dedicated, &[ServiceType::Tts]),
            role(
                "nlp",
                "gpu-t4",
                Placement::Dedicated,
                &[ServiceType::Callbot, ServiceType::Chatbot],
            ),
            role("aicm", "gpu-t4", Placement::Dedicated, &[ServiceType::Advisor]),
            role("stt", "gpu-t4", Placement::Shared, &[ServiceType::Stt]),
            role("ta", "cpu-std", Placement::Dedicated, &[ServiceType::Ta]),
            role("qa", "cpu-std", Placement::Dedicated, &[ServiceType::Qa]),
        ];

        let common = [
            ("ingress", 4, 8, 100),
            ("api-gateway", 4, 8, 100),
            ("relational-store", 8, 32, 1000),
            ("vector-store", 8, 16, 500),
            ("auth", 4, 8, 100),
            ("file-storage", 4, 8, 1700),
        ]
        .into_iter()
        .map(|(name, cpu_cores, memory_gb, storage_gb)| CommonRole {
            name: name.to_string(),
            cpu_cores,
            memory_gb,
            storage_gb,
        })
        .collect();

        Self {
            templates: vec![gpu_t4, cpu_std],
            roles,
            common,
        }
    }
}

impl AllocationTable {
    pub fn template(&self, name: &str) -> Option<&ServerTemplate> {
        self.templates.iter().find(|t| t.name == name)
    }

    fn role_index(&self, service: ServiceType) -> Option<usize> {
        self.roles.iter().position(|r| r.services.contains(&service))
    }

    /// Map fixed common roles to single-instance allocations.
    pub fn common_allocations(&self) -> Vec<ServerAllocation> {
        self.common
            .iter()
            .map(|c| ServerAllocation {
                role: c.name.clone(),
                template: "common".to_string(),
                cpu_cores: c.cpu_cores,
                memory_gb: c.memory_gb,
                storage_gb: c.storage_gb,
                gpu_type: None,
                gpu_count: 0,
                instance_count: 1,
                services: Vec::new(),
                demand_units: 1,
                capacity_units: 1,
                common: true,
            })
            .collect()
    }
}

/// Packs per-service demand into a [`ResourceBundle`].
#[derive(Debug, Clone, Default)]
pub struct BundleAllocator {
    table: AllocationTable,
}

impl BundleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(table: AllocationTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &AllocationTable {
        &self.table
    }

    /// Allocate whole servers for `demand`.
    ///
    /// Services with zero units are skipped. A service with demand but no
    /// role, template or usable capacity fails with
    /// [`PlanError::UnallocatableService`].
    pub fn allocate(&self, demand: &[ServiceDemand]) -> PlanResult<ResourceBundle> {
        let mut role_units = vec![0u64; self.table.roles.len()];
        let mut role_services: Vec<Vec<ServiceType>> = vec![Vec::new(); self.table.roles.len()];

        for d in demand.iter().filter(|d| d.capacity_units > 0) {
            let unallocatable = || PlanError::UnallocatableService {
                service: d.service_type,
            };
            let idx = self.table.role_index(d.service_type).ok_or_else(unallocatable)?;
            let template = self
                .table
                .template(&self.table.roles[idx].template)
                .ok_or_else(unallocatable)?;
            if template.capacity_units == 0 {
                return Err(unallocatable());
            }
            role_units[idx] += d.capacity_units;
            role_services[idx].push(d.service_type);
        }

        let mut servers: Vec<ServerAllocation> = Vec::new();

        for placement in [Placement::Dedicated, Placement::Shared] {
            for (idx, role) in self.table.roles.iter().enumerate() {
                let units = role_units[idx];
                if role.placement != placement || units == 0 {
                    continue;
                }
                let services = &role_services[idx];

                if placement == Placement::Shared {
                    if let Some(host) = servers.iter_mut().find(|s| {
                        s.template == role.template && spare_units(s) >= units
                    }) {
                        host.demand_units += units;
                        host.services.extend(services.iter().copied());
                        tracing::debug!(
                            role = %role.name,
                            host = %host.role,
                            units = units,
                            "co-located shared role"
                        );
                        continue;
                    }
                }

                // Presence checked while summing units.
                let Some(template) = self.table.template(&role.template) else {
                    continue;
                };
                servers.push(ServerAllocation {
                    role: role.name.clone(),
                    template: template.name.clone(),
                    cpu_cores: template.cpu_cores,
                    memory_gb: template.memory_gb,
                    storage_gb: template.storage_gb,
                    gpu_type: template.gpu_type.clone(),
                    gpu_count: template.gpu_count,
                    instance_count: instances_for(units, template.capacity_units),
                    services: services.clone(),
                    demand_units: units,
                    capacity_units: template.capacity_units,
                    common: false,
                });
            }
        }

        servers.extend(self.table.common_allocations());
        Ok(ResourceBundle::from_servers(demand.to_vec(), servers))
    }
}

/// `ceil(units / capacity)`, at least one.
pub fn instances_for(units: u64, capacity: u64) -> u32 {
    let instances = units.div_ceil(capacity.max(1)).max(1);
    u32::try_from(instances).unwrap_or(u32::MAX)
}

fn spare_units(server: &ServerAllocation) -> u64 {
    (u64::from(server.instance_count) * server.capacity_units).saturating_sub(server.demand_units)
}
