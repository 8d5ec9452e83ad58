use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_AUTO_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Which bootstrap action the operator invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionKind {
    /// Form new clusters with the local machine as the first member.
    Init,
    /// Grow the clusters the local machine already belongs to.
    Add,
}

/// Where selections come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Interactive,
    Automatic,
    Preseed,
}

/// Everything the orchestrator needs from its caller for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub kind: SessionKind,
    pub mode: InputMode,
    pub local_name: String,
    pub local_address: IpAddr,
    pub version: String,
    pub interface: String,
    pub subnet: IpNet,
    /// Explicit lookup timeout. `None` picks the mode's default.
    pub lookup_timeout: Option<Duration>,
    pub wipe_allowed: bool,
    /// A sole system without usable disks is an error instead of a degradation.
    pub storage_mandatory: bool,
}

impl SessionConfig {
    pub fn new(
        kind: SessionKind,
        mode: InputMode,
        local_name: &str,
        local_address: IpAddr,
        subnet: IpNet,
    ) -> Self {
        Self {
            kind,
            mode,
            local_name: local_name.to_string(),
            local_address,
            version: env!("CARGO_PKG_VERSION").to_string(),
            interface: String::new(),
            subnet,
            lookup_timeout: None,
            wipe_allowed: false,
            storage_mandatory: false,
        }
    }

    pub fn auto_setup(&self) -> bool {
        self.mode == InputMode::Automatic
    }

    pub fn effective_lookup_timeout(&self) -> Duration {
        match (self.lookup_timeout, self.mode) {
            (Some(timeout), _) => timeout,
            (None, InputMode::Interactive) => DEFAULT_LOOKUP_TIMEOUT,
            (None, InputMode::Automatic | InputMode::Preseed) => DEFAULT_AUTO_LOOKUP_TIMEOUT,
        }
    }
}
