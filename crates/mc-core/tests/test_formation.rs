mod common;

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;

use mc_core::error::{BootstrapError, ServiceError};
use mc_core::models::{
    Advertisement, CandidateSystem, DiskPurpose, FormationOutcome, FormationReport, InputMode,
    JoinState, Reachability, ServiceType, SessionKind,
};
use mc_core::services::{
    AutomaticStrategy, BootstrapSession, ChannelSource, ClusterFormationSequencer,
};

use common::*;

/// Run an automatic init with micro02..micro0N advertising.
async fn run_init(
    fabric: &Fabric,
    peers: u8,
) -> mc_core::error::Result<mc_core::models::FormationReport> {
    let session = BootstrapSession::new(
        session_config(SessionKind::Init, InputMode::Automatic),
        all_handlers(fabric),
        CancellationToken::new(),
    );
    let (tx, mut source) = ChannelSource::new();
    for index in 2..=peers {
        tx.send(advertisement(&format!("micro{index:02}"), index)).unwrap();
    }
    session.run(&mut source, &mut AutomaticStrategy).await
}

async fn run_init_advertising(
    fabric: &Fabric,
    advertised: Vec<Advertisement>,
) -> mc_core::error::Result<FormationReport> {
    let session = BootstrapSession::new(
        session_config(SessionKind::Init, InputMode::Automatic),
        all_handlers(fabric),
        CancellationToken::new(),
    );
    let (tx, mut source) = ChannelSource::new();
    for ad in advertised {
        tx.send(ad).unwrap();
    }
    session.run(&mut source, &mut AutomaticStrategy).await
}

#[tokio::test]
async fn init_forms_every_service_on_every_system() {
    let fabric = fabric_with(3);
    let report = run_init(&fabric, 3).await.unwrap();

    assert_eq!(report.outcome, FormationOutcome::Success);
    assert!(report.exclusions.is_empty());
    for name in ["micro01", "micro02", "micro03"] {
        for service in ServiceType::ALL {
            assert_eq!(report.state(name, service), Some(&JoinState::Joined), "{name} {service}");
        }
    }
    for service in ServiceType::ALL {
        assert_eq!(fabric.members(service).len(), 3);
    }
}

#[tokio::test]
async fn local_system_bootstraps_and_issues_tokens() {
    let fabric = fabric_with(3);
    run_init(&fabric, 3).await.unwrap();

    let calls = fabric.formation_calls();
    let core: Vec<_> = calls.iter().filter(|c| c.service == ServiceType::Core).collect();
    assert_eq!(core[0].op, "bootstrap");
    assert_eq!(core[0].system, "micro01");
    assert!(core
        .iter()
        .filter(|c| c.op == "issue_token")
        .all(|c| c.system == "micro01"));
    assert_eq!(core.iter().filter(|c| c.op == "join").count(), 2);
}

#[tokio::test]
async fn core_finishes_before_hypervisor_before_optional_services() {
    let fabric = fabric_with(3);
    run_init(&fabric, 3).await.unwrap();

    let calls = fabric.formation_calls();
    let last_core = *position(&calls, ServiceType::Core).last().unwrap();
    let hypervisor = position(&calls, ServiceType::Hypervisor);
    let first_optional = position(&calls, ServiceType::Storage)
        .into_iter()
        .chain(position(&calls, ServiceType::Network))
        .min()
        .unwrap();

    assert!(last_core < hypervisor[0]);
    assert!(*hypervisor.last().unwrap() < first_optional);
}

#[tokio::test]
async fn auto_plan_splits_local_and_distributed_disks() {
    let fabric = fabric_with(2);
    let report = run_init(&fabric, 2).await.unwrap();
    assert!(report.is_success());

    // The smaller disk backs the local pool, the larger joins storage.
    for config in fabric.configs(ServiceType::Storage) {
        assert_eq!(config.disks.len(), 1);
        assert_eq!(config.disks[0].path, "/dev/sdc");
        assert_eq!(config.disks[0].purpose, DiskPurpose::Distributed);
    }
    for config in fabric.configs(ServiceType::Hypervisor) {
        let local: Vec<_> = config
            .disks
            .iter()
            .filter(|d| d.purpose == DiskPurpose::Local)
            .collect();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].path, "/dev/sdb");
    }
    for config in fabric.configs(ServiceType::Network) {
        let plan = config.network.unwrap();
        assert_eq!(plan.internal_interface, "eth0");
        assert_eq!(plan.uplink.as_deref(), Some("eth1"));
    }
    assert_eq!(fabric.configs(ServiceType::Storage).len(), 2);
}

#[tokio::test]
async fn storage_failure_on_one_system_degrades() {
    let fabric = fabric_with(3);
    fabric.fail(
        ServiceType::Storage,
        "join",
        "micro03",
        ServiceError::Failed("osd creation failed".into()),
    );

    let report = run_init(&fabric, 3).await.unwrap();

    assert_eq!(report.outcome, FormationOutcome::Degraded);
    assert!(report.is_success());
    assert!(matches!(
        report.state("micro03", ServiceType::Storage),
        Some(JoinState::Failed(_))
    ));
    assert_eq!(report.state("micro02", ServiceType::Storage), Some(&JoinState::Joined));
    assert_eq!(report.state("micro03", ServiceType::Network), Some(&JoinState::Joined));
    assert_eq!(report.exclusions.len(), 1);
    assert_eq!(report.exclusions[0].system, "micro03");
    assert_eq!(report.exclusions[0].service, ServiceType::Storage);
}

#[tokio::test]
async fn optional_bootstrap_failure_fails_the_whole_service() {
    let fabric = fabric_with(3);
    fabric.fail(
        ServiceType::Network,
        "bootstrap",
        "micro01",
        ServiceError::Failed("ovn northd down".into()),
    );

    let report = run_init(&fabric, 3).await.unwrap();

    assert_eq!(report.outcome, FormationOutcome::Degraded);
    for name in ["micro01", "micro02", "micro03"] {
        assert!(report.state(name, ServiceType::Network).unwrap().is_failed());
        assert!(report.state(name, ServiceType::Storage).unwrap().is_joined());
    }
    assert!(!fabric
        .formation_calls()
        .iter()
        .any(|c| c.service == ServiceType::Network && c.op == "join"));
}

#[tokio::test]
async fn core_failure_aborts_before_any_later_service() {
    let fabric = fabric_with(3);
    fabric.fail(
        ServiceType::Core,
        "join",
        "micro02",
        ServiceError::TokenRejected("expired".into()),
    );

    let err = run_init(&fabric, 3).await.unwrap_err();

    let BootstrapError::FormationAborted {
        system,
        service,
        report,
        ..
    } = &err
    else {
        panic!("expected abort, got {err}");
    };
    assert_eq!(system, "micro02");
    assert_eq!(*service, ServiceType::Core);
    assert_eq!(report.outcome, FormationOutcome::Aborted);
    assert_eq!(
        report.state("micro01", ServiceType::Hypervisor),
        Some(&JoinState::Pending)
    );
    assert!(fabric
        .formation_calls()
        .iter()
        .all(|c| c.service == ServiceType::Core));
}

#[tokio::test]
async fn init_without_peers_forms_single_node_cluster() {
    let fabric = fabric_with(1);
    let report = run_init(&fabric, 1).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.states.len(), 1);
    assert_eq!(fabric.members(ServiceType::Core).len(), 1);
}

#[tokio::test]
async fn init_refuses_initialized_core() {
    let fabric = fabric_with(2);
    fabric.seed_members(ServiceType::Core, &["micro01"]);

    let err = run_init(&fabric, 2).await.unwrap_err();
    assert!(matches!(err, BootstrapError::CoreAlreadyInitialized(name) if name == "micro01"));
    assert!(fabric.formation_calls().is_empty());
}

#[tokio::test]
async fn cancelled_session_stops_during_discovery() {
    let fabric = fabric_with(2);
    let mut config = session_config(SessionKind::Init, InputMode::Automatic);
    config.lookup_timeout = Some(std::time::Duration::from_secs(30));
    let cancel = CancellationToken::new();
    let session = BootstrapSession::new(config, all_handlers(&fabric), cancel.clone());
    let (_tx, mut source) = ChannelSource::new();

    cancel.cancel();
    let err = session
        .run(&mut source, &mut AutomaticStrategy)
        .await
        .unwrap_err();

    assert!(matches!(err, BootstrapError::Cancelled));
    assert!(fabric.formation_calls().is_empty());
}

#[tokio::test]
async fn peer_with_only_mandatory_services_joins_what_it_runs() {
    let fabric = fabric_with(3);
    for service in [ServiceType::Storage, ServiceType::Network] {
        fabric.fail(service, "local_resources", "micro02", ServiceError::ConnectionRefused);
    }
    let mut micro02 = advertisement("micro02", 2);
    micro02.services = [ServiceType::Core, ServiceType::Hypervisor].into_iter().collect();

    let report = run_init_advertising(&fabric, vec![micro02, advertisement("micro03", 3)])
        .await
        .unwrap();

    assert_eq!(report.outcome, FormationOutcome::Success);
    assert_eq!(report.state("micro02", ServiceType::Core), Some(&JoinState::Joined));
    assert_eq!(report.state("micro02", ServiceType::Hypervisor), Some(&JoinState::Joined));
    assert!(report.state("micro02", ServiceType::Storage).is_none());
    assert!(report.state("micro02", ServiceType::Network).is_none());
    assert_eq!(report.state("micro03", ServiceType::Storage), Some(&JoinState::Joined));
}

#[tokio::test]
async fn failing_optional_resource_query_degrades_instead_of_aborting() {
    let fabric = fabric_with(3);
    fabric.fail(
        ServiceType::Storage,
        "local_resources",
        "micro03",
        ServiceError::Failed("microceph down".into()),
    );

    let report = run_init(&fabric, 3).await.unwrap();

    assert_eq!(report.outcome, FormationOutcome::Degraded);
    assert_eq!(report.exclusions.len(), 1);
    assert_eq!(report.exclusions[0].system, "micro03");
    assert_eq!(report.exclusions[0].service, ServiceType::Storage);
    assert!(report.state("micro03", ServiceType::Storage).is_none());
    assert_eq!(report.state("micro03", ServiceType::Hypervisor), Some(&JoinState::Joined));
    assert_eq!(fabric.members(ServiceType::Storage).len(), 2);
}

fn formation_systems(count: u8) -> BTreeMap<String, CandidateSystem> {
    (1..=count)
        .map(|index| {
            let name = format!("micro{index:02}");
            let installed = ServiceType::ALL.into_iter().collect();
            let mut system = if index == 1 {
                CandidateSystem::local(name.clone(), ip(index), installed)
            } else {
                CandidateSystem::new(name.clone(), ip(index), installed)
            };
            system.reachability = Reachability::Confirmed;
            for service in [ServiceType::Core, ServiceType::Hypervisor] {
                system.participate(service);
            }
            (name, system)
        })
        .collect()
}

#[tokio::test]
async fn formation_marks_systems_joined() {
    let fabric = fabric_with(3);
    let handlers = handlers(&fabric, &[ServiceType::Core, ServiceType::Hypervisor]);
    let mut systems = formation_systems(3);

    ClusterFormationSequencer::new(&handlers, SessionKind::Init, CancellationToken::new())
        .form(&mut systems, None, Vec::new())
        .await
        .unwrap();

    assert!(systems
        .values()
        .all(|s| s.reachability == Reachability::Joined));
}

#[tokio::test]
async fn aborted_formation_marks_the_failed_system() {
    let fabric = fabric_with(3);
    fabric.fail(
        ServiceType::Core,
        "join",
        "micro03",
        ServiceError::TokenRejected("expired".into()),
    );
    let handlers = handlers(&fabric, &[ServiceType::Core, ServiceType::Hypervisor]);
    let mut systems = formation_systems(3);

    ClusterFormationSequencer::new(&handlers, SessionKind::Init, CancellationToken::new())
        .form(&mut systems, None, Vec::new())
        .await
        .unwrap_err();

    assert_eq!(systems["micro03"].reachability, Reachability::Failed);
    // Core joined but hypervisor never started.
    assert_eq!(systems["micro02"].reachability, Reachability::Confirmed);
}
