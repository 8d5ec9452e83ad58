use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{BootstrapError, Result};
use crate::models::{
    CandidateSystem, DiscoverySession, ExpectPolicy, FormationEvent, FormationOutcome,
    FormationReport, ServiceType, SessionConfig, SessionKind,
};

use super::discovery::{discover, AdvertisementSource};
use super::handler::HandlerSet;
use super::negotiator::{NegotiationPolicy, ResourceNegotiator};
use super::sequencer::ClusterFormationSequencer;
use super::strategy::SelectionStrategy;

/// One `init` or `add` run from discovery to a formation report.
pub struct BootstrapSession {
    config: SessionConfig,
    handlers: HandlerSet,
    cancel: CancellationToken,
    progress: Option<mpsc::UnboundedSender<FormationEvent>>,
}

impl BootstrapSession {
    pub fn new(config: SessionConfig, handlers: HandlerSet, cancel: CancellationToken) -> Self {
        Self {
            config,
            handlers,
            cancel,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<FormationEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn handlers(&self) -> &HandlerSet {
        &self.handlers
    }

    pub async fn run<S>(
        &self,
        source: &mut S,
        strategy: &mut dyn SelectionStrategy,
    ) -> Result<FormationReport>
    where
        S: AdvertisementSource + ?Sized,
    {
        let members = self.check_core_status().await?;
        let existing = self.existing_members(&members).await;

        let mut discovery = DiscoverySession::new(
            &self.config.interface,
            self.config.subnet,
            self.config.effective_lookup_timeout(),
            &self.config.version,
        );
        discovery.exclude.insert(self.config.local_name.clone());
        discovery.exclude.extend(members);
        if let Some(names) = strategy.expected_peers() {
            // Preseed documents list every system, the local one included.
            let peers: BTreeSet<String> = names
                .into_iter()
                .filter(|n| !discovery.exclude.contains(n))
                .collect();
            if !peers.is_empty() {
                discovery.expect = ExpectPolicy::Names(peers);
            } else {
                discovery.expect = ExpectPolicy::Exactly(0);
            }
        }

        let link = strategy.discovery_link();
        let peers = tokio::select! {
            _ = self.cancel.cancelled() => return Err(BootstrapError::Cancelled),
            peers = discover(&self.handlers, &discovery, source, link) => peers?,
        };

        if peers.is_empty() {
            match self.config.kind {
                SessionKind::Add => {
                    tracing::info!("no_new_systems_found");
                    let mut report = FormationReport::new();
                    report.finish(FormationOutcome::Success);
                    return Ok(report);
                }
                SessionKind::Init => tracing::warn!("forming_single_node_cluster"),
            }
        }

        let mut systems: BTreeMap<String, CandidateSystem> = peers;
        let local = self.local_system();
        systems.insert(local.name.clone(), local);

        let negotiator = ResourceNegotiator::new(&self.handlers);
        let mut exclusions = negotiator.query_resources(&mut systems).await?;
        let policy = NegotiationPolicy {
            kind: self.config.kind,
            wipe_allowed: self.config.wipe_allowed,
            storage_mandatory: self.config.storage_mandatory,
            subnet: self.config.subnet,
            existing,
        };
        let plan = negotiator.select_plan(&mut systems, strategy, &policy).await?;
        exclusions.extend(plan.exclusions);

        if self.cancel.is_cancelled() {
            return Err(BootstrapError::Cancelled);
        }

        let mut sequencer =
            ClusterFormationSequencer::new(&self.handlers, self.config.kind, self.cancel.clone());
        if let Some(progress) = &self.progress {
            sequencer = sequencer.with_progress(progress.clone());
        }
        let result = sequencer
            .form(&mut systems, plan.external.as_ref(), exclusions)
            .await;
        for system in systems.values() {
            tracing::debug!(
                system = %system.name,
                reachability = ?system.reachability,
                "system_settled"
            );
        }
        result
    }

    /// Init wants a fresh core service, add wants a formed one. Returns the
    /// current core members so they are never rediscovered.
    async fn check_core_status(&self) -> Result<BTreeSet<String>> {
        let core = self.handlers.core();
        let members = core
            .list_own_members(&self.config.local_name, self.config.local_address)
            .await
            .map_err(|source| BootstrapError::Service {
                system: self.config.local_name.clone(),
                service: core.service(),
                source,
            })?;

        match (self.config.kind, members.is_empty()) {
            (SessionKind::Init, false) => Err(BootstrapError::CoreAlreadyInitialized(
                self.config.local_name.clone(),
            )),
            (SessionKind::Add, true) => Err(BootstrapError::CoreNotInitialized),
            _ => Ok(members),
        }
    }

    /// Membership of every handled service as seen from the local machine.
    /// Only `add` has any. A failed listing is left empty; the sequencer asks
    /// again and records the failure.
    async fn existing_members(
        &self,
        core_members: &BTreeSet<String>,
    ) -> BTreeMap<ServiceType, BTreeSet<String>> {
        let mut existing = BTreeMap::new();
        if self.config.kind != SessionKind::Add {
            return existing;
        }
        existing.insert(ServiceType::Core, core_members.clone());
        for service in self.handlers.services().filter(|s| *s != ServiceType::Core) {
            let Some(handle) = self.handlers.get(service) else {
                continue;
            };
            match handle
                .list_own_members(&self.config.local_name, self.config.local_address)
                .await
            {
                Ok(members) => {
                    existing.insert(service, members);
                }
                Err(e) => {
                    tracing::warn!(service = %service, error = %e, "member_listing_failed");
                }
            }
        }
        existing
    }

    fn local_system(&self) -> CandidateSystem {
        let installed = self.handlers.services().collect();
        let mut local = CandidateSystem::local(
            self.config.local_name.clone(),
            self.config.local_address,
            installed,
        );
        for service in self.handlers.services() {
            local.participate(service);
        }
        local
    }
}
