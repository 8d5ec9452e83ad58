use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;

use crate::models::{FormationReport, ServiceType};

/// Failure of a single call against a backend service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection refused")]
    ConnectionRefused,

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("join token rejected: {0}")]
    TokenRejected(String),

    #[error("incompatible version: {0}")]
    Incompatible(String),

    #[error("request failed: {0}")]
    Failed(String),
}

impl ServiceError {
    /// Transport-level failures worth another attempt. Everything else is a
    /// logical answer from the backend and is reported as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::Timeout(_) | ServiceError::ConnectionRefused | ServiceError::Unreachable(_)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("core service is uninitialized, run 'init' first")]
    CoreNotInitialized,

    #[error("core service on '{0}' is already initialized")]
    CoreAlreadyInitialized(String),

    #[error("{service} service on '{system}' failed: {source}")]
    Service {
        system: String,
        service: ServiceType,
        #[source]
        source: ServiceError,
    },

    #[error("discovery interface '{interface}' is unusable: {reason}")]
    DiscoveryInterface { interface: String, reason: String },

    #[error("expected {expected} systems but found {found}")]
    TooManyPeers { expected: usize, found: usize },

    #[error("systems not found before the lookup timeout: {}", .0.join(", "))]
    MissingPeers(Vec<String>),

    #[error("invalid selection for '{system}': {reason}")]
    InvalidSelection { system: String, reason: String },

    #[error("system '{system}' has no interface on subnet {expected} (found: {found})")]
    SubnetMismatch {
        system: String,
        expected: IpNet,
        found: String,
    },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("preseed file not found at {0}")]
    PreseedNotFound(PathBuf),

    #[error("{service} formation failed on '{system}': {reason}")]
    FormationAborted {
        system: String,
        service: ServiceType,
        reason: String,
        report: Box<FormationReport>,
    },

    #[error("session cancelled during formation")]
    FormationCancelled { report: Box<FormationReport> },

    #[error("selection cancelled by operator")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl BootstrapError {
    /// The partial formation report carried by formation failures, if any.
    pub fn report(&self) -> Option<&FormationReport> {
        match self {
            BootstrapError::FormationAborted { report, .. }
            | BootstrapError::FormationCancelled { report } => Some(report),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BootstrapError>;
