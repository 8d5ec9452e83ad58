mod common;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use ipnet::IpNet;
use proptest::prelude::*;

use mc_core::error::{BootstrapError, ServiceError};
use mc_core::models::preseed::{PreseedDisk, PreseedSystem};
use mc_core::models::{
    CandidateSystem, DiskInfo, DiskPurpose, ExternalNetwork, InputMode, NetIfaceInfo, Preseed,
    ResourceReport, ServiceType, SessionKind,
};
use mc_core::services::negotiator::{auto_disks, validate_disks};
use mc_core::services::{
    AutomaticStrategy, DiskChoices, NegotiationPolicy, NetworkChoices, PreseedStrategy,
    ResourceNegotiator, Selection, SelectionStrategy,
};

use common::*;

fn policy() -> NegotiationPolicy {
    NegotiationPolicy {
        kind: SessionKind::Init,
        wipe_allowed: false,
        storage_mandatory: false,
        subnet: SUBNET.parse().unwrap(),
        existing: BTreeMap::new(),
    }
}

fn candidate(name: &str, index: u8) -> CandidateSystem {
    let mut system = CandidateSystem::new(
        name.to_string(),
        ip(index),
        ServiceType::ALL.into_iter().collect(),
    );
    for service in ServiceType::ALL {
        system.participate(service);
    }
    system.resources = Some(standard_resources(index));
    system
}

fn three_systems() -> BTreeMap<String, CandidateSystem> {
    (1..=3)
        .map(|i| {
            let name = format!("micro{i:02}");
            (name.clone(), candidate(&name, i))
        })
        .collect()
}

struct Cancelling;

/// Pins every system's internal interface.
struct PinnedInternal(BTreeMap<String, String>);

#[async_trait]
impl SelectionStrategy for PinnedInternal {
    fn mode(&self) -> InputMode {
        InputMode::Preseed
    }

    async fn select_networks(
        &mut self,
        _systems: &BTreeMap<String, CandidateSystem>,
        _subnet: IpNet,
    ) -> Selection<NetworkChoices> {
        Selection::Chosen(NetworkChoices {
            internal: self.0.clone(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl SelectionStrategy for Cancelling {
    fn mode(&self) -> InputMode {
        InputMode::Interactive
    }

    async fn select_disks(
        &mut self,
        _systems: &BTreeMap<String, CandidateSystem>,
        _wipe_allowed: bool,
    ) -> Selection<DiskChoices> {
        Selection::Cancelled
    }
}

#[tokio::test]
async fn query_resources_fills_every_system() {
    let fabric = fabric_with(3);
    let handlers = all_handlers(&fabric);
    let mut systems = three_systems();
    for system in systems.values_mut() {
        system.resources = None;
    }

    let exclusions = ResourceNegotiator::new(&handlers)
        .query_resources(&mut systems)
        .await
        .unwrap();

    assert!(exclusions.is_empty());
    for system in systems.values() {
        let report = system.resources.as_ref().unwrap();
        assert_eq!(report.disks.len(), 2);
        assert_eq!(report.interfaces.len(), 2);
    }
}

#[tokio::test]
async fn peer_without_optional_services_is_queried_through_mandatory_ones() {
    let fabric = fabric_with(3);
    let handlers = all_handlers(&fabric);
    let mut systems = three_systems();
    let mut micro02 = CandidateSystem::new(
        "micro02".into(),
        ip(2),
        [ServiceType::Core, ServiceType::Hypervisor].into_iter().collect(),
    );
    micro02.participate(ServiceType::Core);
    micro02.participate(ServiceType::Hypervisor);
    systems.insert("micro02".into(), micro02);
    for service in [ServiceType::Storage, ServiceType::Network] {
        fabric.fail(service, "local_resources", "micro02", ServiceError::ConnectionRefused);
    }

    let exclusions = ResourceNegotiator::new(&handlers)
        .query_resources(&mut systems)
        .await
        .unwrap();

    assert!(exclusions.is_empty());
    assert_eq!(systems["micro02"].resources.as_ref().unwrap().disks.len(), 2);
    let asked: BTreeSet<ServiceType> = fabric
        .calls()
        .into_iter()
        .filter(|c| c.system == "micro02" && c.op == "local_resources")
        .map(|c| c.service)
        .collect();
    assert_eq!(asked, [ServiceType::Core, ServiceType::Hypervisor].into_iter().collect());
}

#[tokio::test]
async fn failed_optional_query_excludes_only_that_service() {
    let fabric = fabric_with(3);
    let handlers = all_handlers(&fabric);
    let mut systems = three_systems();
    fabric.fail(
        ServiceType::Storage,
        "local_resources",
        "micro03",
        ServiceError::Failed("microceph down".into()),
    );

    let exclusions = ResourceNegotiator::new(&handlers)
        .query_resources(&mut systems)
        .await
        .unwrap();

    assert_eq!(exclusions.len(), 1);
    assert_eq!(exclusions[0].system, "micro03");
    assert_eq!(exclusions[0].service, ServiceType::Storage);
    assert!(exclusions[0].reason.contains("microceph down"));
    let micro03 = &systems["micro03"];
    assert!(!micro03.participates(ServiceType::Storage));
    assert!(micro03.participates(ServiceType::Network));
    assert_eq!(micro03.resources.as_ref().unwrap().disks.len(), 2);
}

#[tokio::test]
async fn failed_mandatory_query_is_fatal() {
    let fabric = fabric_with(3);
    let handlers = handlers(&fabric, &[ServiceType::Core, ServiceType::Hypervisor]);
    let mut systems = three_systems();
    fabric.fail(
        ServiceType::Hypervisor,
        "local_resources",
        "micro02",
        ServiceError::Failed("lxd down".into()),
    );

    let err = ResourceNegotiator::new(&handlers)
        .query_resources(&mut systems)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BootstrapError::Service { system, service: ServiceType::Hypervisor, .. } if system == "micro02"
    ));
}

#[tokio::test]
async fn existing_members_keep_their_resources_out_of_the_plan() {
    let fabric = fabric_with(2);
    let handlers = all_handlers(&fabric);
    let mut systems: BTreeMap<_, _> = [
        ("micro01".to_string(), candidate("micro01", 1)),
        ("micro02".to_string(), candidate("micro02", 2)),
    ]
    .into();
    let micro01 = systems.get_mut("micro01").unwrap().resources.as_mut().unwrap();
    for disk in &mut micro01.disks {
        disk.in_use = true;
    }
    micro01.interfaces[1].in_use = true;

    let mut add = policy();
    add.kind = SessionKind::Add;
    add.existing = ServiceType::ALL
        .into_iter()
        .map(|s| (s, BTreeSet::from(["micro01".to_string()])))
        .collect();

    let plan = ResourceNegotiator::new(&handlers)
        .select_plan(&mut systems, &mut AutomaticStrategy, &add)
        .await
        .unwrap();

    assert!(plan.exclusions.is_empty());
    let micro01 = &systems["micro01"];
    assert!(micro01.disks.is_empty());
    for service in ServiceType::ALL {
        assert!(micro01.participates(service));
    }
    assert_eq!(systems["micro02"].disks.len(), 2);
    assert_eq!(systems["micro02"].network.as_ref().unwrap().uplink.as_deref(), Some("eth1"));
}

#[tokio::test]
async fn existing_hypervisor_member_only_adds_storage_disks() {
    let fabric = fabric_with(1);
    let handlers = all_handlers(&fabric);
    let mut systems: BTreeMap<_, _> = [("micro01".to_string(), candidate("micro01", 1))].into();

    let mut add = policy();
    add.kind = SessionKind::Add;
    for service in [ServiceType::Core, ServiceType::Hypervisor] {
        add.existing.insert(service, BTreeSet::from(["micro01".to_string()]));
    }

    ResourceNegotiator::new(&handlers)
        .select_plan(&mut systems, &mut AutomaticStrategy, &add)
        .await
        .unwrap();

    let disks = &systems["micro01"].disks;
    assert_eq!(disks.len(), 2);
    assert!(disks.iter().all(|d| d.purpose == DiskPurpose::Distributed));
}

#[tokio::test]
async fn chosen_internal_interface_must_be_up() {
    let fabric = fabric_with(3);
    let handlers = all_handlers(&fabric);
    let mut systems = three_systems();
    systems.get_mut("micro02").unwrap().resources.as_mut().unwrap().interfaces[0].up = false;

    let pinned = [("micro02".to_string(), "eth0".to_string())].into();
    let err = ResourceNegotiator::new(&handlers)
        .select_plan(&mut systems, &mut PinnedInternal(pinned), &policy())
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::InvalidSelection { system, .. } if system == "micro02"));
}

#[tokio::test]
async fn system_without_usable_disks_leaves_storage() {
    let fabric = fabric_with(3);
    let handlers = all_handlers(&fabric);
    let mut systems = three_systems();
    let micro03 = systems.get_mut("micro03").unwrap();
    for disk in &mut micro03.resources.as_mut().unwrap().disks {
        disk.in_use = true;
    }

    let plan = ResourceNegotiator::new(&handlers)
        .select_plan(&mut systems, &mut AutomaticStrategy, &policy())
        .await
        .unwrap();

    assert_eq!(plan.exclusions.len(), 1);
    assert_eq!(plan.exclusions[0].system, "micro03");
    assert_eq!(plan.exclusions[0].service, ServiceType::Storage);
    assert!(!systems["micro03"].participates(ServiceType::Storage));
    assert!(systems["micro03"].disks.is_empty());
    assert!(systems["micro02"].participates(ServiceType::Storage));
}

#[tokio::test]
async fn mandatory_storage_on_a_sole_system_is_fatal() {
    let fabric = fabric_with(1);
    let handlers = all_handlers(&fabric);
    let mut systems: BTreeMap<_, _> = [("micro01".to_string(), candidate("micro01", 1))].into();
    systems.get_mut("micro01").unwrap().resources.as_mut().unwrap().disks.clear();

    let mut strict = policy();
    strict.storage_mandatory = true;
    let err = ResourceNegotiator::new(&handlers)
        .select_plan(&mut systems, &mut AutomaticStrategy, &strict)
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::Config(_)));
}

#[tokio::test]
async fn network_member_off_subnet_is_a_mismatch() {
    let fabric = fabric_with(3);
    let handlers = all_handlers(&fabric);
    let mut systems = three_systems();
    let micro02 = systems.get_mut("micro02").unwrap();
    micro02.resources.as_mut().unwrap().interfaces[0].addresses =
        vec!["172.16.0.2/24".parse().unwrap()];

    let err = ResourceNegotiator::new(&handlers)
        .select_plan(&mut systems, &mut AutomaticStrategy, &policy())
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::SubnetMismatch { system, .. } if system == "micro02"));
}

#[tokio::test]
async fn missing_uplink_drops_network_participation() {
    let fabric = fabric_with(3);
    let handlers = all_handlers(&fabric);
    let mut systems = three_systems();
    let micro01 = systems.get_mut("micro01").unwrap();
    micro01.resources.as_mut().unwrap().interfaces[1].in_use = true;

    let plan = ResourceNegotiator::new(&handlers)
        .select_plan(&mut systems, &mut AutomaticStrategy, &policy())
        .await
        .unwrap();

    assert_eq!(plan.exclusions.len(), 1);
    assert_eq!(plan.exclusions[0].service, ServiceType::Network);
    assert!(!systems["micro01"].participates(ServiceType::Network));
    let network = systems["micro01"].network.as_ref().unwrap();
    assert_eq!(network.internal_interface, "eth0");
    assert!(network.uplink.is_none());
    assert_eq!(systems["micro02"].network.as_ref().unwrap().uplink.as_deref(), Some("eth1"));
}

#[tokio::test]
async fn preseed_disk_must_be_reported() {
    let fabric = fabric_with(3);
    let handlers = all_handlers(&fabric);
    let mut systems = three_systems();
    let preseed = Preseed {
        systems: vec![PreseedSystem {
            name: "micro01".into(),
            disks: vec![PreseedDisk {
                path: "/dev/nvme9n1".into(),
                purpose: DiskPurpose::Distributed,
                wipe: false,
            }],
            uplink: None,
        }],
        ..Default::default()
    };

    let err = ResourceNegotiator::new(&handlers)
        .select_plan(&mut systems, &mut PreseedStrategy::new(preseed), &policy())
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::InvalidSelection { system, .. } if system == "micro01"));
}

#[tokio::test]
async fn invalid_external_network_is_rejected() {
    let fabric = fabric_with(3);
    let handlers = all_handlers(&fabric);
    let mut systems = three_systems();
    let preseed = Preseed {
        network: mc_core::models::preseed::PreseedNetwork {
            external: Some(ExternalNetwork {
                ipv4_gateway: Some("192.0.2.1/24".parse().unwrap()),
                ipv4_range: Some("192.0.2.1-192.0.2.20".parse().unwrap()),
                ..Default::default()
            }),
        },
        ..Default::default()
    };

    let err = ResourceNegotiator::new(&handlers)
        .select_plan(&mut systems, &mut PreseedStrategy::new(preseed), &policy())
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::Config(_)));
}

#[tokio::test]
async fn cancelled_selection_stops_negotiation() {
    let fabric = fabric_with(3);
    let handlers = all_handlers(&fabric);
    let mut systems = three_systems();

    let err = ResourceNegotiator::new(&handlers)
        .select_plan(&mut systems, &mut Cancelling, &policy())
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::Cancelled));
}

#[tokio::test]
async fn unqueried_systems_are_refused() {
    let fabric = fabric_with(3);
    let handlers = all_handlers(&fabric);
    let mut systems = three_systems();
    systems.get_mut("micro02").unwrap().resources = None;

    let subnet: IpNet = SUBNET.parse().unwrap();
    let err = ResourceNegotiator::new(&handlers)
        .select_plan(
            &mut systems,
            &mut AutomaticStrategy,
            &NegotiationPolicy { subnet, ..policy() },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::Config(_)));
}

fn arb_report() -> impl Strategy<Value = ResourceReport> {
    prop::collection::btree_map("/dev/sd[b-k]", (1u64..4096, any::<bool>()), 0..8).prop_map(
        |disks| ResourceReport {
            disks: disks
                .into_iter()
                .map(|(path, (size, in_use))| DiskInfo {
                    path,
                    size: size << 30,
                    model: String::new(),
                    in_use,
                })
                .collect(),
            interfaces: vec![],
        },
    )
}

fn arb_interfaces() -> impl Strategy<Value = Vec<NetIfaceInfo>> {
    prop::collection::btree_map(
        "(eth|enp)[0-5]",
        (any::<bool>(), prop::option::of(1u8..=254), any::<bool>()),
        0..6,
    )
    .prop_map(|ifaces| {
        ifaces
            .into_iter()
            .map(|(name, (up, host, in_use))| NetIfaceInfo {
                name,
                up,
                addresses: host
                    .map(|h| vec![format!("10.0.0.{h}/24").parse().unwrap()])
                    .unwrap_or_default(),
                in_use,
            })
            .collect()
    })
}

fn run_network_plan(
    interfaces: Vec<NetIfaceInfo>,
) -> (mc_core::error::Result<Vec<mc_core::models::Exclusion>>, CandidateSystem) {
    let fabric = fabric_with(1);
    let handlers = all_handlers(&fabric);
    let mut system = candidate("micro01", 1);
    system.resources = Some(ResourceReport {
        disks: vec![],
        interfaces,
    });
    let mut systems: BTreeMap<_, _> = [("micro01".to_string(), system)].into();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let result = runtime.block_on(
        ResourceNegotiator::new(&handlers).select_plan(&mut systems, &mut AutomaticStrategy, &policy()),
    );
    let system = systems.remove("micro01").unwrap();
    (result.map(|plan| plan.exclusions), system)
}

proptest! {
    #[test]
    fn network_plan_only_uses_reported_up_interfaces(interfaces in arb_interfaces()) {
        let report = ResourceReport { disks: vec![], interfaces: interfaces.clone() };
        let (result, system) = run_network_plan(interfaces);
        let subnet: IpNet = SUBNET.parse().unwrap();
        match result {
            Ok(_) => {
                let network = system.network.as_ref().unwrap();
                let internal = report.interface(&network.internal_interface).unwrap();
                prop_assert!(internal.up);
                prop_assert!(internal.address_in(&subnet).is_some());
                if let Some(uplink) = &network.uplink {
                    let uplink = report.interface(uplink).unwrap();
                    prop_assert!(uplink.is_uplink_candidate());
                    prop_assert_ne!(&uplink.name, &internal.name);
                } else {
                    prop_assert!(!system.participates(ServiceType::Network));
                }
            }
            Err(err) => {
                let is_mismatch = matches!(err, BootstrapError::SubnetMismatch { .. });
                prop_assert!(is_mismatch);
                prop_assert!(!report.interfaces.iter().any(|i| i.up && i.address_in(&subnet).is_some()));
            }
        }
    }

    #[test]
    fn auto_plan_always_validates(report in arb_report(), storage in any::<bool>(), wipe in any::<bool>()) {
        let plan = auto_disks(&report, storage, wipe);
        prop_assert!(validate_disks("micro01", &report, &plan, wipe).is_ok());
        prop_assert!(plan.iter().filter(|d| d.purpose == DiskPurpose::Local).count() <= 1);
        if !storage {
            prop_assert!(plan.iter().all(|d| d.purpose == DiskPurpose::Local));
        }
        if !wipe {
            prop_assert!(plan.iter().all(|d| !d.wipe));
        }
    }

    #[test]
    fn auto_plan_ignores_report_order(report in arb_report(), storage in any::<bool>(), wipe in any::<bool>()) {
        let mut reversed = report.clone();
        reversed.disks.reverse();
        prop_assert_eq!(auto_disks(&report, storage, wipe), auto_disks(&reversed, storage, wipe));
    }
}
