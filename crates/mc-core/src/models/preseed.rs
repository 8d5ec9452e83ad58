use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use super::system::{DiskPurpose, ExternalNetwork};

/// Declarative answers to every question an interactive session would ask.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preseed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_subnet: Option<IpNet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_interface: Option<String>,
    /// Seconds to wait for the listed systems.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_timeout: Option<u64>,
    #[serde(default)]
    pub systems: Vec<PreseedSystem>,
    #[serde(default)]
    pub storage: PreseedStorage,
    #[serde(default)]
    pub network: PreseedNetwork,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreseedSystem {
    pub name: String,
    #[serde(default)]
    pub disks: Vec<PreseedDisk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplink: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreseedDisk {
    pub path: String,
    #[serde(default = "default_purpose")]
    pub purpose: DiskPurpose,
    #[serde(default)]
    pub wipe: bool,
}

fn default_purpose() -> DiskPurpose {
    DiskPurpose::Distributed
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreseedStorage {
    #[serde(default)]
    pub wipe: bool,
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreseedNetwork {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalNetwork>,
}

impl Preseed {
    pub fn system_names(&self) -> impl Iterator<Item = &str> {
        self.systems.iter().map(|s| s.name.as_str())
    }

    /// True when at least one system lists its disks explicitly.
    pub fn has_disk_selection(&self) -> bool {
        self.systems.iter().any(|s| !s.disks.is_empty())
    }

    pub fn has_uplink_selection(&self) -> bool {
        self.systems.iter().any(|s| s.uplink.is_some())
    }
}
