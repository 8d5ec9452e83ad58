// Each test binary compiles this module independently and uses a different
// subset of helpers, so unused-function warnings are expected.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use mc_core::error::ServiceError;
use mc_core::models::{
    Advertisement, DiskInfo, InputMode, NetIfaceInfo, ResourceReport, ServiceType, SessionConfig,
    SessionKind,
};
use mc_core::services::{
    ClusterConfig, HandlerSet, RetryPolicy, ServiceClient, ServiceHandle, Timeouts,
};

pub const LOCAL: &str = "micro01";
pub const SUBNET: &str = "10.0.0.0/24";

/// One backend call as observed by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub service: ServiceType,
    pub op: &'static str,
    pub system: String,
}

#[derive(Default)]
struct FabricState {
    calls: Vec<Call>,
    names: BTreeMap<IpAddr, String>,
    resources: BTreeMap<String, ResourceReport>,
    members: BTreeMap<ServiceType, BTreeSet<String>>,
    failures: Vec<(ServiceType, &'static str, String, ServiceError)>,
    configs: Vec<(ServiceType, ClusterConfig)>,
}

/// In-memory stand-in for every service daemon on every machine.
#[derive(Clone, Default)]
pub struct Fabric {
    state: Arc<Mutex<FabricState>>,
}

impl Fabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a machine with the default resource report.
    pub fn add_system(&self, name: &str, index: u8) {
        let address = ip(index);
        let mut state = self.state.lock().unwrap();
        state.names.insert(address, name.to_string());
        state.resources.insert(name.to_string(), standard_resources(index));
    }

    pub fn set_resources(&self, name: &str, report: ResourceReport) {
        self.state
            .lock()
            .unwrap()
            .resources
            .insert(name.to_string(), report);
    }

    /// Pretend `names` already form a cluster of `service`.
    pub fn seed_members(&self, service: ServiceType, names: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .members
            .insert(service, names.iter().map(|n| n.to_string()).collect());
    }

    /// Make every `op` call of `service` directed at `system` fail.
    pub fn fail(&self, service: ServiceType, op: &'static str, system: &str, error: ServiceError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((service, op, system.to_string(), error));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls that change cluster membership, in the order they were made.
    pub fn formation_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c.op, "bootstrap" | "issue_token" | "join"))
            .collect()
    }

    pub fn members(&self, service: ServiceType) -> BTreeSet<String> {
        self.state
            .lock()
            .unwrap()
            .members
            .get(&service)
            .cloned()
            .unwrap_or_default()
    }

    /// Configs handed to bootstrap and join calls of `service`.
    pub fn configs(&self, service: ServiceType) -> Vec<ClusterConfig> {
        self.state
            .lock()
            .unwrap()
            .configs
            .iter()
            .filter(|(s, _)| *s == service)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn client(&self, service: ServiceType) -> Arc<dyn ServiceClient> {
        Arc::new(FakeClient {
            service,
            fabric: self.clone(),
        })
    }

    fn enter(&self, service: ServiceType, op: &'static str, address: IpAddr) -> Result<String, ServiceError> {
        let mut state = self.state.lock().unwrap();
        let system = state
            .names
            .get(&address)
            .cloned()
            .ok_or_else(|| ServiceError::Unreachable(format!("no route to {address}")))?;
        state.calls.push(Call {
            service,
            op,
            system: system.clone(),
        });
        let failure = state
            .failures
            .iter()
            .find(|(s, o, n, _)| *s == service && *o == op && *n == system)
            .map(|(_, _, _, e)| e.clone());
        match failure {
            Some(e) => Err(e),
            None => Ok(system),
        }
    }
}

struct FakeClient {
    service: ServiceType,
    fabric: Fabric,
}

#[async_trait]
impl ServiceClient for FakeClient {
    fn service(&self) -> ServiceType {
        self.service
    }

    async fn is_available(&self, address: IpAddr) -> Result<bool, ServiceError> {
        self.fabric.enter(self.service, "is_available", address)?;
        Ok(true)
    }

    async fn local_resources(&self, address: IpAddr) -> Result<ResourceReport, ServiceError> {
        let system = self.fabric.enter(self.service, "local_resources", address)?;
        let state = self.fabric.state.lock().unwrap();
        Ok(state.resources.get(&system).cloned().unwrap_or_default())
    }

    async fn bootstrap(&self, address: IpAddr, config: &ClusterConfig) -> Result<(), ServiceError> {
        let system = self.fabric.enter(self.service, "bootstrap", address)?;
        assert_eq!(system, config.name);
        // Give concurrent formation a chance to interleave.
        tokio::time::sleep(Duration::from_millis(1)).await;
        let mut state = self.fabric.state.lock().unwrap();
        state.configs.push((self.service, config.clone()));
        state
            .members
            .insert(self.service, BTreeSet::from([system]));
        Ok(())
    }

    async fn issue_token(&self, address: IpAddr, joiner: &str) -> Result<String, ServiceError> {
        let system = self.fabric.enter(self.service, "issue_token", address)?;
        let state = self.fabric.state.lock().unwrap();
        let is_member = state
            .members
            .get(&self.service)
            .is_some_and(|m| m.contains(&system));
        if !is_member {
            return Err(ServiceError::Failed(format!("{system} is not a member")));
        }
        Ok(format!("{}:{joiner}", self.service))
    }

    async fn join(&self, address: IpAddr, token: &str, config: &ClusterConfig) -> Result<(), ServiceError> {
        let system = self.fabric.enter(self.service, "join", address)?;
        if token != format!("{}:{}", self.service, config.name) {
            return Err(ServiceError::TokenRejected(token.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        let mut state = self.fabric.state.lock().unwrap();
        state.configs.push((self.service, config.clone()));
        state.members.entry(self.service).or_default().insert(system);
        Ok(())
    }

    async fn list_own_members(&self, address: IpAddr) -> Result<BTreeSet<String>, ServiceError> {
        let system = self.fabric.enter(self.service, "list_own_members", address)?;
        let state = self.fabric.state.lock().unwrap();
        let members = state.members.get(&self.service).cloned().unwrap_or_default();
        if members.contains(&system) {
            Ok(members)
        } else {
            Ok(BTreeSet::new())
        }
    }
}

pub fn ip(index: u8) -> IpAddr {
    IpAddr::from([10, 0, 0, index])
}

/// Two free disks and an uplink-ready second interface.
pub fn standard_resources(index: u8) -> ResourceReport {
    ResourceReport {
        disks: vec![
            DiskInfo {
                path: "/dev/sdc".into(),
                size: 200 << 30,
                model: "QEMU HARDDISK".into(),
                in_use: false,
            },
            DiskInfo {
                path: "/dev/sdb".into(),
                size: 100 << 30,
                model: "QEMU HARDDISK".into(),
                in_use: false,
            },
        ],
        interfaces: vec![
            NetIfaceInfo {
                name: "eth0".into(),
                up: true,
                addresses: vec![format!("10.0.0.{index}/24").parse().unwrap()],
                in_use: true,
            },
            NetIfaceInfo {
                name: "eth1".into(),
                up: true,
                addresses: vec![],
                in_use: false,
            },
        ],
    }
}

pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        call: Duration::from_secs(2),
        retry: RetryPolicy::none(),
    }
}

pub fn handlers(fabric: &Fabric, services: &[ServiceType]) -> HandlerSet {
    let handles = services.iter().map(|&service| {
        ServiceHandle::new(
            &format!("https://{}:{}", ip(1), service.default_port()),
            fast_timeouts(),
            fabric.client(service),
        )
    });
    HandlerSet::new(LOCAL, ip(1), handles).unwrap()
}

pub fn all_handlers(fabric: &Fabric) -> HandlerSet {
    handlers(fabric, &ServiceType::ALL)
}

pub fn advertisement(name: &str, index: u8) -> Advertisement {
    Advertisement {
        name: name.to_string(),
        address: ip(index),
        version: env!("CARGO_PKG_VERSION").to_string(),
        services: ServiceType::ALL.into_iter().collect(),
    }
}

pub fn session_config(kind: SessionKind, mode: InputMode) -> SessionConfig {
    let mut config = SessionConfig::new(kind, mode, LOCAL, ip(1), SUBNET.parse().unwrap());
    config.interface = "eth0".into();
    config.lookup_timeout = Some(Duration::from_millis(200));
    config
}

/// A fabric with micro01 (local) through micro0N registered.
pub fn fabric_with(count: u8) -> Fabric {
    let fabric = Fabric::new();
    for index in 1..=count {
        fabric.add_system(&format!("micro{index:02}"), index);
    }
    fabric
}

pub fn position(calls: &[Call], service: ServiceType) -> Vec<usize> {
    calls
        .iter()
        .enumerate()
        .filter(|(_, c)| c.service == service)
        .map(|(i, _)| i)
        .collect()
}
