use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::service::ServiceType;

/// Progress of one (system, service) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "state", content = "reason")]
pub enum JoinState {
    Pending,
    Joining,
    Joined,
    Failed(String),
}

impl JoinState {
    pub fn is_joined(&self) -> bool {
        matches!(self, JoinState::Joined)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, JoinState::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FormationOutcome {
    InProgress,
    Success,
    /// Mandatory services formed, some optional participation was dropped.
    Degraded,
    Aborted,
    Cancelled,
}

/// A system left out of one service's cluster, and why.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Exclusion {
    pub system: String,
    pub service: ServiceType,
    pub reason: String,
}

/// Emitted on every state transition so a front end can follow along.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormationEvent {
    pub system: String,
    pub service: ServiceType,
    pub state: JoinState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormationReport {
    pub states: BTreeMap<String, BTreeMap<ServiceType, JoinState>>,
    pub exclusions: Vec<Exclusion>,
    pub outcome: FormationOutcome,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl FormationReport {
    pub fn new() -> Self {
        Self {
            states: BTreeMap::new(),
            exclusions: Vec::new(),
            outcome: FormationOutcome::InProgress,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Register a pair as Pending.
    pub fn track(&mut self, system: &str, service: ServiceType) {
        self.states
            .entry(system.to_string())
            .or_default()
            .insert(service, JoinState::Pending);
    }

    pub fn set(&mut self, system: &str, service: ServiceType, state: JoinState) {
        self.states
            .entry(system.to_string())
            .or_default()
            .insert(service, state);
    }

    pub fn state(&self, system: &str, service: ServiceType) -> Option<&JoinState> {
        self.states.get(system).and_then(|s| s.get(&service))
    }

    /// Systems whose pair for `service` satisfies `predicate`, in name order.
    pub fn systems_where(
        &self,
        service: ServiceType,
        predicate: impl Fn(&JoinState) -> bool,
    ) -> Vec<&str> {
        self.states
            .iter()
            .filter(|(_, services)| services.get(&service).is_some_and(&predicate))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn exclude(&mut self, system: &str, service: ServiceType, reason: impl Into<String>) {
        self.exclusions.push(Exclusion {
            system: system.to_string(),
            service,
            reason: reason.into(),
        });
    }

    pub fn finish(&mut self, outcome: FormationOutcome) {
        self.outcome = match outcome {
            FormationOutcome::Success if !self.exclusions.is_empty() => FormationOutcome::Degraded,
            other => other,
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.outcome,
            FormationOutcome::Success | FormationOutcome::Degraded
        )
    }
}

impl Default for FormationReport {
    fn default() -> Self {
        Self::new()
    }
}
