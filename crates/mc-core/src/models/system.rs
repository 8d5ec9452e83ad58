use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use super::formation::JoinState;
use super::service::ServiceType;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Reachability {
    Discovered,
    Confirmed,
    Joined,
    Failed,
}

/// A block device as reported by the machine that owns it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskInfo {
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub model: String,
    /// Partitioned, formatted, or already claimed by existing storage.
    #[serde(default)]
    pub in_use: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetIfaceInfo {
    pub name: String,
    #[serde(default)]
    pub up: bool,
    #[serde(default)]
    pub addresses: Vec<IpNet>,
    /// Enslaved to a bridge or already serving as an uplink.
    #[serde(default)]
    pub in_use: bool,
}

impl NetIfaceInfo {
    pub fn address_in(&self, subnet: &IpNet) -> Option<IpAddr> {
        self.addresses
            .iter()
            .map(|a| a.addr())
            .find(|addr| subnet.contains(addr))
    }

    /// Can carry the external network: up, unaddressed and unclaimed.
    pub fn is_uplink_candidate(&self) -> bool {
        self.up && self.addresses.is_empty() && !self.in_use
    }
}

/// Latest resource query answer for one machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReport {
    #[serde(default)]
    pub disks: Vec<DiskInfo>,
    #[serde(default)]
    pub interfaces: Vec<NetIfaceInfo>,
}

impl ResourceReport {
    pub fn disk(&self, path: &str) -> Option<&DiskInfo> {
        self.disks.iter().find(|d| d.path == path)
    }

    pub fn interface(&self, name: &str) -> Option<&NetIfaceInfo> {
        self.interfaces.iter().find(|i| i.name == name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum DiskPurpose {
    /// Hypervisor-local storage pool. At most one per system.
    Local,
    /// Member disk of the distributed storage cluster.
    Distributed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskSelection {
    pub path: String,
    pub purpose: DiskPurpose,
    #[serde(default)]
    pub wipe: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPlan {
    pub internal_interface: String,
    pub subnet: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink: Option<String>,
}

/// Inclusive IPv4 address range, written `start-end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Range {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl FromStr for Ipv4Range {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("invalid range '{s}', expected start-end"))?;
        let start: Ipv4Addr = start
            .trim()
            .parse()
            .map_err(|e| format!("invalid range start '{start}': {e}"))?;
        let end: Ipv4Addr = end
            .trim()
            .parse()
            .map_err(|e| format!("invalid range end '{end}': {e}"))?;
        if start > end {
            return Err(format!("range start {start} is after end {end}"));
        }
        Ok(Self { start, end })
    }
}

impl TryFrom<String> for Ipv4Range {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Range> for String {
    fn from(range: Ipv4Range) -> Self {
        range.to_string()
    }
}

impl fmt::Display for Ipv4Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// External network handed to the network service, shared by all its members.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalNetwork {
    #[serde(default, alias = "ipv4_gateway", skip_serializing_if = "Option::is_none")]
    pub ipv4_gateway: Option<Ipv4Net>,
    #[serde(default, alias = "ipv4_range", skip_serializing_if = "Option::is_none")]
    pub ipv4_range: Option<Ipv4Range>,
    #[serde(default, alias = "ipv6_gateway", skip_serializing_if = "Option::is_none")]
    pub ipv6_gateway: Option<Ipv6Net>,
    #[serde(default, alias = "dns_servers")]
    pub dns_servers: Vec<IpAddr>,
}

impl ExternalNetwork {
    pub fn validate(&self) -> Result<(), String> {
        if self.ipv4_gateway.is_none() && self.ipv6_gateway.is_none() {
            return Err("external network needs an IPv4 or IPv6 gateway".into());
        }
        if let Some(range) = self.ipv4_range {
            let Some(gateway) = self.ipv4_gateway else {
                return Err("IPv4 range given without an IPv4 gateway".into());
            };
            if !gateway.contains(&range.start) || !gateway.contains(&range.end) {
                return Err(format!("IPv4 range {range} is outside {gateway}"));
            }
            if (range.start..=range.end).contains(&gateway.addr()) {
                return Err(format!(
                    "IPv4 range {range} contains the gateway {}",
                    gateway.addr()
                ));
            }
        } else if self.ipv4_gateway.is_some() {
            return Err("IPv4 gateway given without an IPv4 range".into());
        }
        Ok(())
    }
}

/// The orchestrator's working model of one machine in the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSystem {
    pub name: String,
    pub address: IpAddr,
    pub reachability: Reachability,
    pub is_local: bool,
    /// Services confirmed installed on the machine.
    pub installed: BTreeSet<ServiceType>,
    /// Services this machine will join. Always a subset of `installed`.
    pub services: BTreeSet<ServiceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceReport>,
    #[serde(default)]
    pub disks: Vec<DiskSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkPlan>,
}

impl CandidateSystem {
    pub fn new(name: String, address: IpAddr, installed: BTreeSet<ServiceType>) -> Self {
        Self {
            name,
            address,
            reachability: Reachability::Discovered,
            is_local: false,
            installed,
            services: BTreeSet::new(),
            resources: None,
            disks: Vec::new(),
            network: None,
        }
    }

    /// The machine running the orchestrator. It is part of every session
    /// without ever being discovered.
    pub fn local(name: String, address: IpAddr, installed: BTreeSet<ServiceType>) -> Self {
        Self {
            reachability: Reachability::Confirmed,
            is_local: true,
            ..Self::new(name, address, installed)
        }
    }

    /// Opt the system into a service. Refused unless the service is installed.
    pub fn participate(&mut self, service: ServiceType) -> bool {
        if !self.installed.contains(&service) {
            return false;
        }
        self.services.insert(service)
    }

    /// Final reachability from the system's join states. A system is joined
    /// once its mandatory services are, and failed when any of them failed.
    /// Anything else leaves it where it was.
    pub fn settle(&mut self, states: &BTreeMap<ServiceType, JoinState>) {
        let mandatory = || {
            states
                .iter()
                .filter(|(service, _)| service.is_mandatory())
                .map(|(_, state)| state)
        };
        if mandatory().any(|state| matches!(state, JoinState::Failed(_))) {
            self.reachability = Reachability::Failed;
        } else if mandatory().count() > 0 && mandatory().all(|state| *state == JoinState::Joined) {
            self.reachability = Reachability::Joined;
        }
    }

    pub fn withdraw(&mut self, service: ServiceType) {
        self.services.remove(&service);
        match service {
            ServiceType::Storage => self
                .disks
                .retain(|d| d.purpose != DiskPurpose::Distributed),
            ServiceType::Network => {
                if let Some(plan) = self.network.as_mut() {
                    plan.uplink = None;
                }
            }
            ServiceType::Core | ServiceType::Hypervisor => {}
        }
    }

    pub fn participates(&self, service: ServiceType) -> bool {
        self.services.contains(&service)
    }

    pub fn disks_for(&self, purpose: DiskPurpose) -> impl Iterator<Item = &DiskSelection> {
        self.disks.iter().filter(move |d| d.purpose == purpose)
    }
}
