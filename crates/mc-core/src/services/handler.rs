use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BootstrapError, Result, ServiceError};
use crate::models::{ResourceReport, ServiceType};

use super::client::{ClusterConfig, ServiceClient};
use super::retry::{with_retry, RetryPolicy};

/// Per-call limits shared by every handle in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub call: Duration,
    pub retry: RetryPolicy,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            call: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// One backend service as seen by the session: where it lives, how long to
/// wait for it, and the client used to talk to it.
#[derive(Clone)]
pub struct ServiceHandle {
    service: ServiceType,
    base: String,
    timeouts: Timeouts,
    client: Arc<dyn ServiceClient>,
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("service", &self.service)
            .field("base", &self.base)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl ServiceHandle {
    pub fn new(base: &str, timeouts: Timeouts, client: Arc<dyn ServiceClient>) -> Self {
        Self {
            service: client.service(),
            base: base.to_string(),
            timeouts,
            client,
        }
    }

    pub fn service(&self) -> ServiceType {
        self.service
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Every attempt is bounded by the call timeout; transient failures are
    /// retried per the handle's policy.
    async fn call<T, F, Fut>(
        &self,
        operation: &str,
        system: &str,
        op: F,
    ) -> std::result::Result<T, ServiceError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, ServiceError>>,
    {
        let limit = self.timeouts.call;
        let op = &op;
        with_retry(&self.timeouts.retry, operation, system, || async move {
            match tokio::time::timeout(limit, op()).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::Timeout(limit)),
            }
        })
        .await
    }

    pub async fn is_available(
        &self,
        system: &str,
        address: IpAddr,
    ) -> std::result::Result<bool, ServiceError> {
        let client = &self.client;
        self.call("is_available", system, || client.is_available(address))
            .await
    }

    pub async fn local_resources(
        &self,
        system: &str,
        address: IpAddr,
    ) -> std::result::Result<ResourceReport, ServiceError> {
        let client = &self.client;
        self.call("local_resources", system, || client.local_resources(address))
            .await
    }

    pub async fn bootstrap(&self, config: &ClusterConfig) -> std::result::Result<(), ServiceError> {
        let client = &self.client;
        self.call("bootstrap", &config.name, || {
            client.bootstrap(config.address, config)
        })
        .await
    }

    pub async fn issue_token(
        &self,
        issuer: &str,
        address: IpAddr,
        joiner: &str,
    ) -> std::result::Result<String, ServiceError> {
        let client = &self.client;
        self.call("issue_token", issuer, || client.issue_token(address, joiner))
            .await
    }

    pub async fn join(
        &self,
        token: &str,
        config: &ClusterConfig,
    ) -> std::result::Result<(), ServiceError> {
        let client = &self.client;
        self.call("join", &config.name, || {
            client.join(config.address, token, config)
        })
        .await
    }

    pub async fn list_own_members(
        &self,
        system: &str,
        address: IpAddr,
    ) -> std::result::Result<BTreeSet<String>, ServiceError> {
        let client = &self.client;
        self.call("list_own_members", system, || {
            client.list_own_members(address)
        })
        .await
    }
}

/// The handles selected for one session, keyed in formation order.
#[derive(Debug, Clone)]
pub struct HandlerSet {
    local_name: String,
    local_address: IpAddr,
    handles: BTreeMap<ServiceType, ServiceHandle>,
}

impl HandlerSet {
    /// Build a set from already-chosen handles. Core and Hypervisor are required.
    pub fn new(
        local_name: &str,
        local_address: IpAddr,
        handles: impl IntoIterator<Item = ServiceHandle>,
    ) -> Result<Self> {
        let handles: BTreeMap<ServiceType, ServiceHandle> = handles
            .into_iter()
            .map(|h| (h.service(), h))
            .collect();

        for required in [ServiceType::Core, ServiceType::Hypervisor] {
            if !handles.contains_key(&required) {
                return Err(BootstrapError::Config(format!(
                    "{required} service handle is required"
                )));
            }
        }

        Ok(Self {
            local_name: local_name.to_string(),
            local_address,
            handles,
        })
    }

    /// Build a set, keeping optional services only when they answer locally
    /// and the operator did not opt out. Presence is decided here, once.
    pub async fn resolve(
        local_name: &str,
        local_address: IpAddr,
        candidates: Vec<ServiceHandle>,
        opted_out: &BTreeSet<ServiceType>,
    ) -> Result<Self> {
        let mut selected = Vec::new();
        for handle in candidates {
            let service = handle.service();
            if service.is_mandatory() {
                selected.push(handle);
                continue;
            }
            if opted_out.contains(&service) {
                tracing::info!(service = %service, "optional_service_skipped_by_operator");
                continue;
            }
            match handle.is_available(local_name, local_address).await {
                Ok(true) => selected.push(handle),
                Ok(false) => {
                    tracing::warn!(service = %service, "optional_service_not_installed")
                }
                Err(e) => {
                    tracing::warn!(service = %service, error = %e, "optional_service_unreachable")
                }
            }
        }
        Self::new(local_name, local_address, selected)
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn local_address(&self) -> IpAddr {
        self.local_address
    }

    pub fn get(&self, service: ServiceType) -> Option<&ServiceHandle> {
        self.handles.get(&service)
    }

    pub fn contains(&self, service: ServiceType) -> bool {
        self.handles.contains_key(&service)
    }

    pub fn core(&self) -> &ServiceHandle {
        &self.handles[&ServiceType::Core]
    }

    pub fn hypervisor(&self) -> &ServiceHandle {
        &self.handles[&ServiceType::Hypervisor]
    }

    /// Services in formation order.
    pub fn services(&self) -> impl Iterator<Item = ServiceType> + '_ {
        self.handles.keys().copied()
    }

    pub fn handles(&self) -> impl Iterator<Item = &ServiceHandle> {
        self.handles.values()
    }
}
