use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{BootstrapError, Result};
use crate::models::{
    CandidateSystem, Exclusion, ExternalNetwork, FormationEvent, FormationOutcome,
    FormationReport, JoinState, ServiceType, SessionKind,
};

use super::client::ClusterConfig;
use super::handler::{HandlerSet, ServiceHandle};

/// Why one service's procedure stopped early.
enum Halt {
    Cancelled,
    Failed { system: String, reason: String },
}

type Step<T> = std::result::Result<T, Halt>;

/// Brings every participating system into every service cluster in
/// dependency order: core, then hypervisor, then storage and network side
/// by side.
pub struct ClusterFormationSequencer<'a> {
    handlers: &'a HandlerSet,
    kind: SessionKind,
    cancel: CancellationToken,
    progress: Option<mpsc::UnboundedSender<FormationEvent>>,
    report: Mutex<FormationReport>,
}

impl<'a> ClusterFormationSequencer<'a> {
    pub fn new(handlers: &'a HandlerSet, kind: SessionKind, cancel: CancellationToken) -> Self {
        Self {
            handlers,
            kind,
            cancel,
            progress: None,
            report: Mutex::new(FormationReport::new()),
        }
    }

    /// Stream every join state change to `progress`.
    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<FormationEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Form every service, then mark each system joined or failed by how
    /// its mandatory pairs ended.
    pub async fn form(
        self,
        systems: &mut BTreeMap<String, CandidateSystem>,
        external: Option<&ExternalNetwork>,
        exclusions: Vec<Exclusion>,
    ) -> Result<FormationReport> {
        {
            let mut report = self.lock();
            for system in systems.values() {
                for service in self.handlers.services() {
                    if system.participates(service) {
                        report.track(&system.name, service);
                    }
                }
            }
            report.exclusions.extend(exclusions);
        }

        tracing::info!(
            systems = systems.len(),
            kind = ?self.kind,
            "formation_started"
        );

        let outcome = self.run_all(systems, external).await;
        let result = outcome.map(|()| {
            let mut report = self.into_report();
            report.finish(FormationOutcome::Success);
            tracing::info!(
                outcome = ?report.outcome,
                exclusions = report.exclusions.len(),
                "formation_finished"
            );
            report
        });

        let final_report = match &result {
            Ok(report) => Some(report),
            Err(e) => e.report(),
        };
        if let Some(report) = final_report {
            for system in systems.values_mut() {
                if let Some(states) = report.states.get(&system.name) {
                    system.settle(states);
                }
            }
        }
        result
    }

    async fn run_all(
        &self,
        systems: &BTreeMap<String, CandidateSystem>,
        external: Option<&ExternalNetwork>,
    ) -> Result<()> {
        self.run_service(ServiceType::Core, systems, external).await?;
        self.run_service(ServiceType::Hypervisor, systems, external).await?;

        let (storage, network) = tokio::join!(
            self.run_service(ServiceType::Storage, systems, external),
            self.run_service(ServiceType::Network, systems, external),
        );
        storage?;
        network?;
        Ok(())
    }

    /// Form one service cluster. An `Err` is fatal for the whole session;
    /// optional-service failures are recorded and swallowed.
    async fn run_service(
        &self,
        service: ServiceType,
        systems: &BTreeMap<String, CandidateSystem>,
        external: Option<&ExternalNetwork>,
    ) -> Result<()> {
        let Some(handle) = self.handlers.get(service) else {
            return Ok(());
        };
        let participants: Vec<&CandidateSystem> = systems
            .values()
            .filter(|s| s.participates(service))
            .collect();
        if participants.is_empty() {
            return Ok(());
        }

        match self
            .form_service(handle, service, &participants, systems, external)
            .await
        {
            Ok(()) => Ok(()),
            Err(Halt::Cancelled) => {
                tracing::warn!(service = %service, "formation_cancelled");
                Err(BootstrapError::FormationCancelled {
                    report: Box::new(self.snapshot(FormationOutcome::Cancelled)),
                })
            }
            Err(Halt::Failed { system, reason }) if service.is_mandatory() => {
                tracing::error!(
                    service = %service,
                    system = %system,
                    reason = %reason,
                    "formation_aborted"
                );
                Err(BootstrapError::FormationAborted {
                    system,
                    service,
                    reason,
                    report: Box::new(self.snapshot(FormationOutcome::Aborted)),
                })
            }
            Err(Halt::Failed { system, reason }) => {
                tracing::warn!(
                    service = %service,
                    system = %system,
                    reason = %reason,
                    "optional_service_failed"
                );
                for participant in &participants {
                    let settled = matches!(
                        self.lock().state(&participant.name, service),
                        Some(JoinState::Joined | JoinState::Failed(_))
                    );
                    if !settled {
                        self.fail(&participant.name, service, &reason);
                    }
                }
                Ok(())
            }
        }
    }

    async fn form_service(
        &self,
        handle: &ServiceHandle,
        service: ServiceType,
        participants: &[&CandidateSystem],
        systems: &BTreeMap<String, CandidateSystem>,
        external: Option<&ExternalNetwork>,
    ) -> Step<()> {
        let local = self.handlers.local_name();
        let existing = match self.kind {
            SessionKind::Init => BTreeSet::new(),
            SessionKind::Add => {
                self.checkpoint()?;
                match handle
                    .list_own_members(local, self.handlers.local_address())
                    .await
                {
                    Ok(members) => members,
                    Err(e) => {
                        let reason = format!("listing members failed: {e}");
                        self.fail(local, service, &reason);
                        return Err(Halt::Failed {
                            system: local.to_string(),
                            reason,
                        });
                    }
                }
            }
        };

        let mut pending = Vec::new();
        for participant in participants {
            if existing.contains(&participant.name) {
                self.transition(&participant.name, service, JoinState::Joined);
            } else {
                pending.push(*participant);
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        let bootstrapper = if existing.is_empty() {
            let first = pending
                .iter()
                .position(|s| s.is_local)
                .unwrap_or(0);
            let system = pending.remove(first);
            self.bootstrap(handle, service, system, external).await?;
            Some(system)
        } else {
            None
        };

        let issuer = match bootstrapper {
            Some(system) => (system.name.clone(), system.address),
            None => pick_issuer(&existing, local, systems).ok_or_else(|| Halt::Failed {
                system: local.to_string(),
                reason: "no known cluster member can issue join tokens".into(),
            })?,
        };

        let joins = pending
            .iter()
            .map(|joiner| self.join(handle, service, &issuer, joiner, external));
        let results = join_all(joins).await;

        let mut first_failure = None;
        for result in results {
            match result {
                Ok(()) => {}
                Err(Halt::Cancelled) => return Err(Halt::Cancelled),
                Err(failure) => {
                    first_failure.get_or_insert(failure);
                }
            }
        }
        match first_failure {
            Some(failure) if service.is_mandatory() => Err(failure),
            _ => Ok(()),
        }
    }

    async fn bootstrap(
        &self,
        handle: &ServiceHandle,
        service: ServiceType,
        system: &CandidateSystem,
        external: Option<&ExternalNetwork>,
    ) -> Step<()> {
        self.checkpoint()?;
        self.transition(&system.name, service, JoinState::Joining);
        let config = cluster_config(system, service, external);
        match handle.bootstrap(&config).await {
            Ok(()) => {
                tracing::info!(system = %system.name, service = %service, "service_bootstrapped");
                self.transition(&system.name, service, JoinState::Joined);
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.fail(&system.name, service, &reason);
                Err(Halt::Failed {
                    system: system.name.clone(),
                    reason,
                })
            }
        }
    }

    /// Token and join for one system. Failures are recorded before being
    /// returned so optional services keep their per-pair reason.
    async fn join(
        &self,
        handle: &ServiceHandle,
        service: ServiceType,
        issuer: &(String, IpAddr),
        joiner: &CandidateSystem,
        external: Option<&ExternalNetwork>,
    ) -> Step<()> {
        self.checkpoint()?;
        self.transition(&joiner.name, service, JoinState::Joining);

        let token = match handle.issue_token(&issuer.0, issuer.1, &joiner.name).await {
            Ok(token) => token,
            Err(e) => return Err(self.join_failed(&joiner.name, service, e.to_string())),
        };

        self.checkpoint()?;
        let config = cluster_config(joiner, service, external);
        match handle.join(&token, &config).await {
            Ok(()) => {
                tracing::info!(
                    system = %joiner.name,
                    service = %service,
                    issuer = %issuer.0,
                    "service_joined"
                );
                self.transition(&joiner.name, service, JoinState::Joined);
                Ok(())
            }
            Err(e) => Err(self.join_failed(&joiner.name, service, e.to_string())),
        }
    }

    fn join_failed(&self, system: &str, service: ServiceType, reason: String) -> Halt {
        self.fail(system, service, &reason);
        Halt::Failed {
            system: system.to_string(),
            reason,
        }
    }

    fn checkpoint(&self) -> Step<()> {
        if self.cancel.is_cancelled() {
            Err(Halt::Cancelled)
        } else {
            Ok(())
        }
    }

    fn fail(&self, system: &str, service: ServiceType, reason: &str) {
        if !service.is_mandatory() {
            self.lock().exclude(system, service, reason);
        }
        self.transition(system, service, JoinState::Failed(reason.to_string()));
    }

    fn transition(&self, system: &str, service: ServiceType, state: JoinState) {
        self.lock().set(system, service, state.clone());
        tracing::debug!(system, service = %service, state = ?state, "join_state_changed");
        if let Some(progress) = &self.progress {
            let _ = progress.send(FormationEvent {
                system: system.to_string(),
                service,
                state,
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, FormationReport> {
        self.report.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self, outcome: FormationOutcome) -> FormationReport {
        let mut report = self.lock().clone();
        report.finish(outcome);
        report
    }

    fn into_report(self) -> FormationReport {
        self.report
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Prefer the local machine, then any other known member in name order.
fn pick_issuer(
    existing: &BTreeSet<String>,
    local: &str,
    systems: &BTreeMap<String, CandidateSystem>,
) -> Option<(String, IpAddr)> {
    let known = |name: &str| systems.get(name).map(|s| (s.name.clone(), s.address));
    if existing.contains(local) {
        if let Some(issuer) = known(local) {
            return Some(issuer);
        }
    }
    existing.iter().find_map(|name| known(name))
}

fn cluster_config(
    system: &CandidateSystem,
    service: ServiceType,
    external: Option<&ExternalNetwork>,
) -> ClusterConfig {
    let (disks, network, external) = match service {
        ServiceType::Core => (Vec::new(), None, None),
        ServiceType::Hypervisor => (
            system.disks.clone(),
            system.network.clone(),
            external.cloned(),
        ),
        ServiceType::Storage => (
            system
                .disks_for(crate::models::DiskPurpose::Distributed)
                .cloned()
                .collect(),
            None,
            None,
        ),
        ServiceType::Network => (Vec::new(), system.network.clone(), external.cloned()),
    };
    ClusterConfig {
        name: system.name.clone(),
        address: system.address,
        disks,
        network,
        external,
    }
}
