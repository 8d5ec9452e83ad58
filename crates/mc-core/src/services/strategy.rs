use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use ipnet::IpNet;

use crate::models::{CandidateSystem, DiskSelection, ExternalNetwork, InputMode, Preseed};

use super::discovery::DiscoveryLink;

/// Answer to a selection question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection<T> {
    /// Apply the deterministic default policy.
    Auto,
    Chosen(T),
    Cancelled,
}

/// Disk choices per system name. Systems left out get no disks.
pub type DiskChoices = BTreeMap<String, Vec<DiskSelection>>;

/// Network choices. Systems missing from a map fall back to the default policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkChoices {
    pub internal: BTreeMap<String, String>,
    pub uplinks: BTreeMap<String, String>,
    pub external: Option<ExternalNetwork>,
}

/// Supplies every operator decision of a session. The pipeline is the same
/// whether answers come from a person, a preseed document, or defaults.
#[async_trait]
pub trait SelectionStrategy: Send {
    fn mode(&self) -> InputMode;

    /// Interactive strategies hand discovery a channel pair to the front end.
    fn discovery_link(&mut self) -> Option<DiscoveryLink> {
        None
    }

    /// Exact peer names to wait for, when known up front.
    fn expected_peers(&self) -> Option<BTreeSet<String>> {
        None
    }

    async fn select_disks(
        &mut self,
        _systems: &BTreeMap<String, CandidateSystem>,
        _wipe_allowed: bool,
    ) -> Selection<DiskChoices> {
        Selection::Auto
    }

    async fn select_networks(
        &mut self,
        _systems: &BTreeMap<String, CandidateSystem>,
        _subnet: IpNet,
    ) -> Selection<NetworkChoices> {
        Selection::Auto
    }
}

/// Takes every default: all discovered peers, auto disks, auto networks.
#[derive(Debug, Default)]
pub struct AutomaticStrategy;

#[async_trait]
impl SelectionStrategy for AutomaticStrategy {
    fn mode(&self) -> InputMode {
        InputMode::Automatic
    }
}

/// Answers from a preseed document.
#[derive(Debug)]
pub struct PreseedStrategy {
    preseed: Preseed,
}

impl PreseedStrategy {
    pub fn new(preseed: Preseed) -> Self {
        Self { preseed }
    }
}

#[async_trait]
impl SelectionStrategy for PreseedStrategy {
    fn mode(&self) -> InputMode {
        InputMode::Preseed
    }

    fn expected_peers(&self) -> Option<BTreeSet<String>> {
        if self.preseed.systems.is_empty() {
            return None;
        }
        Some(self.preseed.system_names().map(str::to_string).collect())
    }

    async fn select_disks(
        &mut self,
        _systems: &BTreeMap<String, CandidateSystem>,
        _wipe_allowed: bool,
    ) -> Selection<DiskChoices> {
        if !self.preseed.has_disk_selection() {
            return Selection::Auto;
        }
        let choices = self
            .preseed
            .systems
            .iter()
            .map(|s| {
                let disks = s
                    .disks
                    .iter()
                    .map(|d| DiskSelection {
                        path: d.path.clone(),
                        purpose: d.purpose,
                        wipe: d.wipe || self.preseed.storage.wipe,
                    })
                    .collect();
                (s.name.clone(), disks)
            })
            .collect();
        Selection::Chosen(choices)
    }

    async fn select_networks(
        &mut self,
        _systems: &BTreeMap<String, CandidateSystem>,
        _subnet: IpNet,
    ) -> Selection<NetworkChoices> {
        if !self.preseed.has_uplink_selection() && self.preseed.network.external.is_none() {
            return Selection::Auto;
        }
        let uplinks = self
            .preseed
            .systems
            .iter()
            .filter_map(|s| s.uplink.clone().map(|u| (s.name.clone(), u)))
            .collect();
        Selection::Chosen(NetworkChoices {
            internal: BTreeMap::new(),
            uplinks,
            external: self.preseed.network.external.clone(),
        })
    }
}
