use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A backend service that forms its own cluster. The derived ordering is the
/// formation order: Core before Hypervisor before the optional services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Core,
    Hypervisor,
    Storage,
    Network,
}

impl ServiceType {
    pub const ALL: [ServiceType; 4] = [
        ServiceType::Core,
        ServiceType::Hypervisor,
        ServiceType::Storage,
        ServiceType::Network,
    ];

    pub const OPTIONAL: [ServiceType; 2] = [ServiceType::Storage, ServiceType::Network];

    pub fn is_mandatory(self) -> bool {
        matches!(self, ServiceType::Core | ServiceType::Hypervisor)
    }

    /// Default API port of the service daemon.
    pub fn default_port(self) -> u16 {
        match self {
            ServiceType::Core => 9443,
            ServiceType::Hypervisor => 8443,
            ServiceType::Storage => 7443,
            ServiceType::Network => 6443,
        }
    }

    /// Snap state directory whose presence means the service is installed.
    pub fn state_dir(self) -> &'static str {
        match self {
            ServiceType::Core => "/var/snap/microcloud/common/state",
            ServiceType::Hypervisor => "/var/snap/lxd/common/lxd",
            ServiceType::Storage => "/var/snap/microceph/common/state",
            ServiceType::Network => "/var/snap/microovn/common/state",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Core => "core",
            ServiceType::Hypervisor => "hypervisor",
            ServiceType::Storage => "storage",
            ServiceType::Network => "network",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "core" => Ok(ServiceType::Core),
            "hypervisor" => Ok(ServiceType::Hypervisor),
            "storage" => Ok(ServiceType::Storage),
            "network" => Ok(ServiceType::Network),
            other => Err(format!("unknown service '{other}'")),
        }
    }
}
