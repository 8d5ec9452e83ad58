use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::{mpsc, oneshot};

use mc_core::models::{CandidateSystem, InputMode};
use mc_core::services::discovery::{DiscoveryControl, DiscoveryLink, DiscoveryUpdate};
use mc_core::services::{DiskChoices, NetworkChoices, Selection, SelectionStrategy};

/// A question the session needs the operator to answer.
#[derive(Debug)]
pub enum UiRequest {
    Disks {
        systems: BTreeMap<String, CandidateSystem>,
        wipe_allowed: bool,
        reply: oneshot::Sender<Selection<DiskChoices>>,
    },
    Networks {
        systems: BTreeMap<String, CandidateSystem>,
        subnet: IpNet,
        reply: oneshot::Sender<Selection<NetworkChoices>>,
    },
}

/// The front-end ends of an interactive session.
#[derive(Debug)]
pub struct UiChannels {
    pub updates: mpsc::UnboundedReceiver<DiscoveryUpdate>,
    pub controls: mpsc::UnboundedSender<DiscoveryControl>,
    pub requests: mpsc::UnboundedReceiver<UiRequest>,
}

/// Forwards every decision to the terminal front end and waits for the answer.
pub struct InteractiveStrategy {
    link: Option<DiscoveryLink>,
    requests: mpsc::UnboundedSender<UiRequest>,
}

impl InteractiveStrategy {
    pub fn new() -> (Self, UiChannels) {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (controls_tx, controls_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let strategy = Self {
            link: Some(DiscoveryLink {
                updates: updates_tx,
                controls: controls_rx,
            }),
            requests: requests_tx,
        };
        let channels = UiChannels {
            updates: updates_rx,
            controls: controls_tx,
            requests: requests_rx,
        };
        (strategy, channels)
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Selection<T>>) -> UiRequest,
    ) -> Selection<T> {
        let (reply, answer) = oneshot::channel();
        if self.requests.send(build(reply)).is_err() {
            tracing::warn!("front_end_gone");
            return Selection::Cancelled;
        }
        answer.await.unwrap_or(Selection::Cancelled)
    }
}

#[async_trait]
impl SelectionStrategy for InteractiveStrategy {
    fn mode(&self) -> InputMode {
        InputMode::Interactive
    }

    fn discovery_link(&mut self) -> Option<DiscoveryLink> {
        self.link.take()
    }

    fn expected_peers(&self) -> Option<BTreeSet<String>> {
        None
    }

    async fn select_disks(
        &mut self,
        systems: &BTreeMap<String, CandidateSystem>,
        wipe_allowed: bool,
    ) -> Selection<DiskChoices> {
        let systems = systems.clone();
        self.ask(|reply| UiRequest::Disks {
            systems,
            wipe_allowed,
            reply,
        })
        .await
    }

    async fn select_networks(
        &mut self,
        systems: &BTreeMap<String, CandidateSystem>,
        subnet: IpNet,
    ) -> Selection<NetworkChoices> {
        let systems = systems.clone();
        self.ask(|reply| UiRequest::Networks {
            systems,
            subnet,
            reply,
        })
        .await
    }
}
