use std::collections::BTreeSet;
use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::models::{DiskSelection, ExternalNetwork, NetworkPlan, ResourceReport, ServiceType};

/// What a machine contributes when it bootstraps or joins a service cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub name: String,
    pub address: IpAddr,
    #[serde(default)]
    pub disks: Vec<DiskSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalNetwork>,
}

/// Narrow capability interface every backend service is driven through.
///
/// `address` is always the machine the call is directed at. Implementations
/// must not retry; retry and timeout policy belong to the
/// [`ServiceHandle`](super::handler::ServiceHandle) wrapping the client.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    fn service(&self) -> ServiceType;

    /// Whether the service is installed and answering on `address`.
    async fn is_available(&self, address: IpAddr) -> Result<bool, ServiceError>;

    async fn local_resources(&self, address: IpAddr) -> Result<ResourceReport, ServiceError>;

    /// Form a new single-member cluster on `address`.
    async fn bootstrap(&self, address: IpAddr, config: &ClusterConfig) -> Result<(), ServiceError>;

    /// Ask the member on `address` for a join token naming `joiner`.
    async fn issue_token(&self, address: IpAddr, joiner: &str) -> Result<String, ServiceError>;

    async fn join(
        &self,
        address: IpAddr,
        token: &str,
        config: &ClusterConfig,
    ) -> Result<(), ServiceError>;

    /// Names of the cluster members as seen from `address`. Empty when the
    /// service has not formed a cluster there yet.
    async fn list_own_members(&self, address: IpAddr) -> Result<BTreeSet<String>, ServiceError>;
}
