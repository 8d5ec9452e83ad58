use std::collections::{BTreeMap, BTreeSet};

use futures::future::join_all;
use ipnet::IpNet;

use crate::error::{BootstrapError, Result};
use crate::models::{
    CandidateSystem, DiskInfo, DiskPurpose, DiskSelection, Exclusion, ExternalNetwork,
    NetworkPlan, ResourceReport, ServiceType, SessionKind,
};

use super::handler::{HandlerSet, ServiceHandle};
use super::strategy::{NetworkChoices, Selection, SelectionStrategy};

/// Replication needs this many storage members to be useful.
const MIN_STORAGE_MEMBERS: usize = 3;

#[derive(Debug, Clone)]
pub struct NegotiationPolicy {
    pub kind: SessionKind,
    pub wipe_allowed: bool,
    pub storage_mandatory: bool,
    pub subnet: IpNet,
    /// Current members per service. Empty on init. Members keep what they
    /// already have and are never re-planned.
    pub existing: BTreeMap<ServiceType, BTreeSet<String>>,
}

impl NegotiationPolicy {
    pub fn is_member(&self, system: &str, service: ServiceType) -> bool {
        self.existing
            .get(&service)
            .is_some_and(|members| members.contains(system))
    }
}

/// Result of plan selection beyond what is written into each system.
#[derive(Debug, Clone, Default)]
pub struct NegotiatedPlan {
    pub exclusions: Vec<Exclusion>,
    pub external: Option<ExternalNetwork>,
}

pub struct ResourceNegotiator<'a> {
    handlers: &'a HandlerSet,
}

impl<'a> ResourceNegotiator<'a> {
    pub fn new(handlers: &'a HandlerSet) -> Self {
        Self { handlers }
    }

    /// Query every system's disks and interfaces, one task per system.
    /// A system whose optional backend cannot answer leaves that service and
    /// is described by its mandatory counterpart instead.
    pub async fn query_resources(
        &self,
        systems: &mut BTreeMap<String, CandidateSystem>,
    ) -> Result<Vec<Exclusion>> {
        let queries = systems.values().map(|system| async move {
            (system.name.clone(), self.query_one(system).await)
        });
        let results = join_all(queries).await;

        let mut exclusions = Vec::new();
        for (name, result) in results {
            let (report, dropped) = result?;
            tracing::info!(
                system = %name,
                disks = report.disks.len(),
                interfaces = report.interfaces.len(),
                "resources_queried"
            );
            if let Some(system) = systems.get_mut(&name) {
                for exclusion in &dropped {
                    system.withdraw(exclusion.service);
                }
                system.resources = Some(report);
            }
            exclusions.extend(dropped);
        }
        Ok(exclusions)
    }

    async fn query_one(
        &self,
        system: &CandidateSystem,
    ) -> Result<(ResourceReport, Vec<Exclusion>)> {
        let mut dropped = Vec::new();
        let disks = self
            .query_via(system, ServiceType::Storage, self.handlers.hypervisor(), &mut dropped)
            .await?
            .disks;
        let interfaces = self
            .query_via(system, ServiceType::Network, self.handlers.core(), &mut dropped)
            .await?
            .interfaces;
        Ok((ResourceReport { disks, interfaces }, dropped))
    }

    /// Ask `preferred` when the system takes part in it, else `fallback`.
    async fn query_via(
        &self,
        system: &CandidateSystem,
        preferred: ServiceType,
        fallback: &ServiceHandle,
        dropped: &mut Vec<Exclusion>,
    ) -> Result<ResourceReport> {
        if let Some(handle) = self.handlers.get(preferred) {
            if system.participates(preferred) {
                match handle.local_resources(&system.name, system.address).await {
                    Ok(report) => return Ok(report),
                    Err(e) => {
                        tracing::warn!(
                            system = %system.name,
                            service = %preferred,
                            error = %e,
                            "resource_query_failed"
                        );
                        dropped.push(Exclusion {
                            system: system.name.clone(),
                            service: preferred,
                            reason: format!("resource query failed: {e}"),
                        });
                    }
                }
            }
        }

        fallback
            .local_resources(&system.name, system.address)
            .await
            .map_err(|source| BootstrapError::Service {
                system: system.name.clone(),
                service: fallback.service(),
                source,
            })
    }

    /// Turn operator or default choices into a validated plan, written into
    /// each system in place. Optional participation that cannot be satisfied
    /// is dropped and reported as an exclusion.
    pub async fn select_plan(
        &self,
        systems: &mut BTreeMap<String, CandidateSystem>,
        strategy: &mut dyn SelectionStrategy,
        policy: &NegotiationPolicy,
    ) -> Result<NegotiatedPlan> {
        for system in systems.values() {
            if system.resources.is_none() {
                return Err(BootstrapError::Config(format!(
                    "resources of '{}' were never queried",
                    system.name
                )));
            }
        }

        let mut plan = NegotiatedPlan::default();
        self.plan_disks(systems, strategy, policy, &mut plan).await?;
        self.plan_networks(systems, strategy, policy, &mut plan).await?;
        Ok(plan)
    }

    async fn plan_disks(
        &self,
        systems: &mut BTreeMap<String, CandidateSystem>,
        strategy: &mut dyn SelectionStrategy,
        policy: &NegotiationPolicy,
        plan: &mut NegotiatedPlan,
    ) -> Result<()> {
        match strategy.select_disks(systems, policy.wipe_allowed).await {
            Selection::Cancelled => return Err(BootstrapError::Cancelled),
            Selection::Auto => {
                for system in systems.values_mut() {
                    let report = report_of(system);
                    let needs_local = !policy.is_member(&system.name, ServiceType::Hypervisor);
                    let needs_storage = system.participates(ServiceType::Storage)
                        && !policy.is_member(&system.name, ServiceType::Storage);
                    system.disks = match (needs_local, needs_storage) {
                        (true, storage) => auto_disks(report, storage, policy.wipe_allowed),
                        (false, true) => auto_disks(report, true, policy.wipe_allowed)
                            .into_iter()
                            .map(|d| DiskSelection {
                                purpose: DiskPurpose::Distributed,
                                ..d
                            })
                            .collect(),
                        (false, false) => Vec::new(),
                    };
                }
            }
            Selection::Chosen(mut choices) => {
                for system in systems.values_mut() {
                    let chosen = choices.remove(&system.name).unwrap_or_default();
                    validate_disks(&system.name, report_of(system), &chosen, policy.wipe_allowed)?;
                    if !system.participates(ServiceType::Storage)
                        && chosen.iter().any(|d| d.purpose == DiskPurpose::Distributed)
                    {
                        return Err(BootstrapError::InvalidSelection {
                            system: system.name.clone(),
                            reason: "distributed disks chosen but storage is not selected".into(),
                        });
                    }
                    system.disks = chosen;
                }
                for unknown in choices.keys() {
                    tracing::warn!(system = %unknown, "disk_selection_for_unknown_system");
                }
            }
        }

        let sole_system = systems.len() == 1;
        for system in systems.values_mut() {
            if !system.participates(ServiceType::Storage)
                || policy.is_member(&system.name, ServiceType::Storage)
            {
                continue;
            }
            let has_usable = usable_disks(report_of(system), policy.wipe_allowed)
                .next()
                .is_some();
            if has_usable {
                continue;
            }
            if sole_system && policy.storage_mandatory {
                return Err(BootstrapError::Config(format!(
                    "storage is mandatory but '{}' has no usable disks",
                    system.name
                )));
            }
            tracing::warn!(system = %system.name, "storage_dropped_no_usable_disks");
            system.withdraw(ServiceType::Storage);
            plan.exclusions.push(Exclusion {
                system: system.name.clone(),
                service: ServiceType::Storage,
                reason: "no usable disks".into(),
            });
        }

        if self.handlers.contains(ServiceType::Storage) && policy.kind == SessionKind::Init {
            let members = systems
                .values()
                .filter(|s| s.participates(ServiceType::Storage))
                .count();
            if members > 0 && members < MIN_STORAGE_MEMBERS {
                tracing::warn!(
                    members,
                    recommended = MIN_STORAGE_MEMBERS,
                    "storage_cluster_below_replication_size"
                );
            }
        }

        Ok(())
    }

    async fn plan_networks(
        &self,
        systems: &mut BTreeMap<String, CandidateSystem>,
        strategy: &mut dyn SelectionStrategy,
        policy: &NegotiationPolicy,
        plan: &mut NegotiatedPlan,
    ) -> Result<()> {
        let choices = if self.handlers.contains(ServiceType::Network) {
            match strategy.select_networks(systems, policy.subnet).await {
                Selection::Cancelled => return Err(BootstrapError::Cancelled),
                Selection::Auto => NetworkChoices::default(),
                Selection::Chosen(choices) => choices,
            }
        } else {
            NetworkChoices::default()
        };

        if let Some(external) = &choices.external {
            external
                .validate()
                .map_err(|e| BootstrapError::Config(format!("external network: {e}")))?;
        }

        for system in systems.values_mut() {
            let report = report_of(system);
            let already = policy.is_member(&system.name, ServiceType::Network);
            let member = system.participates(ServiceType::Network) && !already;

            let internal = match choices.internal.get(&system.name) {
                Some(name) => {
                    let iface = report.interface(name).ok_or_else(|| {
                        BootstrapError::InvalidSelection {
                            system: system.name.clone(),
                            reason: format!("interface '{name}' is not reported"),
                        }
                    })?;
                    if !iface.up {
                        return Err(BootstrapError::InvalidSelection {
                            system: system.name.clone(),
                            reason: format!("interface '{name}' is down"),
                        });
                    }
                    if iface.address_in(&policy.subnet).is_none() {
                        return Err(subnet_mismatch(system, report, policy.subnet));
                    }
                    Some(iface.name.clone())
                }
                None => auto_internal_interface(report, &policy.subnet),
            };

            let Some(internal) = internal else {
                if member {
                    return Err(subnet_mismatch(system, report, policy.subnet));
                }
                system.network = None;
                continue;
            };

            let uplink = if member {
                match choices.uplinks.get(&system.name) {
                    Some(name) => {
                        validate_uplink(&system.name, report, name, &internal)?;
                        Some(name.clone())
                    }
                    None => auto_uplink(report, &internal),
                }
            } else {
                None
            };

            if member && uplink.is_none() {
                tracing::warn!(system = %system.name, "network_dropped_no_uplink");
                plan.exclusions.push(Exclusion {
                    system: system.name.clone(),
                    service: ServiceType::Network,
                    reason: "no usable uplink interface".into(),
                });
            }

            system.network = Some(NetworkPlan {
                internal_interface: internal,
                subnet: policy.subnet,
                uplink: uplink.clone(),
            });
            if member && uplink.is_none() {
                system.withdraw(ServiceType::Network);
            }
        }

        plan.external = choices.external;
        Ok(())
    }
}

/// Callers check `resources` up front, so a missing report reads as empty.
fn report_of(system: &CandidateSystem) -> &ResourceReport {
    static EMPTY: ResourceReport = ResourceReport {
        disks: Vec::new(),
        interfaces: Vec::new(),
    };
    system.resources.as_ref().unwrap_or(&EMPTY)
}

fn subnet_mismatch(
    system: &CandidateSystem,
    report: &ResourceReport,
    subnet: IpNet,
) -> BootstrapError {
    let found: Vec<String> = report
        .interfaces
        .iter()
        .flat_map(|i| i.addresses.iter().map(move |a| format!("{}={a}", i.name)))
        .collect();
    BootstrapError::SubnetMismatch {
        system: system.name.clone(),
        expected: subnet,
        found: if found.is_empty() {
            "no addresses".into()
        } else {
            found.join(", ")
        },
    }
}

/// Disks the default policy may touch: unused ones, plus in-use ones when
/// wiping is permitted.
pub fn usable_disks(
    report: &ResourceReport,
    wipe_allowed: bool,
) -> impl Iterator<Item = &DiskInfo> {
    report.disks.iter().filter(move |d| !d.in_use || wipe_allowed)
}

/// Deterministic default disk plan. The smallest usable disk backs the local
/// pool when there is more than one; everything else goes to storage.
pub fn auto_disks(
    report: &ResourceReport,
    storage: bool,
    wipe_allowed: bool,
) -> Vec<DiskSelection> {
    let mut seen = BTreeSet::new();
    let mut eligible: Vec<&DiskInfo> = usable_disks(report, wipe_allowed)
        .filter(|d| seen.insert(d.path.as_str()))
        .collect();
    eligible.sort_by(|a, b| a.size.cmp(&b.size).then_with(|| a.path.cmp(&b.path)));

    let select = |disk: &DiskInfo, purpose| DiskSelection {
        path: disk.path.clone(),
        purpose,
        wipe: disk.in_use,
    };

    match (storage, eligible.as_slice()) {
        (_, []) => Vec::new(),
        (true, [only]) => vec![select(only, DiskPurpose::Distributed)],
        (true, [smallest, rest @ ..]) => std::iter::once(select(smallest, DiskPurpose::Local))
            .chain(rest.iter().map(|d| select(d, DiskPurpose::Distributed)))
            .collect(),
        (false, [smallest, ..]) => vec![select(smallest, DiskPurpose::Local)],
    }
}

/// Check a chosen disk set against the system's own report.
pub fn validate_disks(
    system: &str,
    report: &ResourceReport,
    chosen: &[DiskSelection],
    wipe_allowed: bool,
) -> Result<()> {
    let invalid = |reason: String| BootstrapError::InvalidSelection {
        system: system.to_string(),
        reason,
    };

    let mut assigned = BTreeSet::new();
    let mut local_count = 0;
    for selection in chosen {
        let disk = report
            .disk(&selection.path)
            .ok_or_else(|| invalid(format!("disk '{}' is not reported", selection.path)))?;
        if !assigned.insert(selection.path.as_str()) {
            return Err(invalid(format!(
                "disk '{}' is assigned more than once",
                selection.path
            )));
        }
        if selection.wipe && !wipe_allowed {
            return Err(invalid(format!(
                "disk '{}' would be wiped but wiping is not permitted",
                selection.path
            )));
        }
        if disk.in_use && !selection.wipe {
            return Err(invalid(format!(
                "disk '{}' is in use and not marked for wiping",
                selection.path
            )));
        }
        if selection.purpose == DiskPurpose::Local {
            local_count += 1;
            if local_count > 1 {
                return Err(invalid("more than one local pool disk".into()));
            }
        }
    }
    Ok(())
}

fn auto_internal_interface(report: &ResourceReport, subnet: &IpNet) -> Option<String> {
    let mut matching: Vec<&str> = report
        .interfaces
        .iter()
        .filter(|i| i.up && i.address_in(subnet).is_some())
        .map(|i| i.name.as_str())
        .collect();
    matching.sort_unstable();
    matching.first().map(|s| s.to_string())
}

fn auto_uplink(report: &ResourceReport, internal: &str) -> Option<String> {
    let mut candidates: Vec<&str> = report
        .interfaces
        .iter()
        .filter(|i| i.name != internal && i.is_uplink_candidate())
        .map(|i| i.name.as_str())
        .collect();
    candidates.sort_unstable();
    candidates.first().map(|s| s.to_string())
}

fn validate_uplink(
    system: &str,
    report: &ResourceReport,
    name: &str,
    internal: &str,
) -> Result<()> {
    let invalid = |reason: String| BootstrapError::InvalidSelection {
        system: system.to_string(),
        reason,
    };
    let iface = report
        .interface(name)
        .ok_or_else(|| invalid(format!("interface '{name}' is not reported")))?;
    if name == internal {
        return Err(invalid(format!(
            "interface '{name}' already carries cluster traffic"
        )));
    }
    if !iface.is_uplink_candidate() {
        return Err(invalid(format!(
            "interface '{name}' is down, addressed, or already in use"
        )));
    }
    Ok(())
}
