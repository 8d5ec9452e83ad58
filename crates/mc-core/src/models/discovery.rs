use std::collections::{BTreeSet, HashSet};
use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use super::service::ServiceType;

/// Payload an unclustered machine broadcasts to announce itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Advertisement {
    pub name: String,
    pub address: IpAddr,
    pub version: String,
    #[serde(default)]
    pub services: BTreeSet<ServiceType>,
}

/// When discovery may stop before its deadline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExpectPolicy {
    #[default]
    Unbounded,
    /// Exactly this many peers. Seeing more is an error.
    Exactly(usize),
    /// Exactly these peers. Others are ignored, missing ones are an error.
    Names(BTreeSet<String>),
}

/// Parameters of one discovery run.
#[derive(Debug, Clone)]
pub struct DiscoverySession {
    pub timeout: Duration,
    pub interface: String,
    pub subnet: IpNet,
    pub version: String,
    pub expect: ExpectPolicy,
    /// Names that must not be returned (the local machine, known members).
    pub exclude: HashSet<String>,
}

impl DiscoverySession {
    pub fn new(interface: &str, subnet: IpNet, timeout: Duration, version: &str) -> Self {
        Self {
            timeout,
            interface: interface.to_string(),
            subnet,
            version: version.to_string(),
            expect: ExpectPolicy::Unbounded,
            exclude: HashSet::new(),
        }
    }
}
