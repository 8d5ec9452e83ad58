use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::models::{ResourceReport, ServiceType};

use super::client::{ClusterConfig, ServiceClient};

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Serialize)]
struct JoinRequest<'a> {
    token: &'a str,
    config: &'a ClusterConfig,
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    #[serde(default)]
    members: Vec<String>,
}

/// JSON-over-HTTPS client for one service daemon. Each call targets the
/// daemon listening on the given address and the service's port.
#[derive(Debug, Clone)]
pub struct HttpServiceClient {
    service: ServiceType,
    port: u16,
    scheme: &'static str,
    timeout: Duration,
    client: Client,
}

impl HttpServiceClient {
    pub fn new(service: ServiceType, timeout: Duration) -> Result<Self, ServiceError> {
        // Cluster daemons serve self-signed certificates until they are joined.
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ServiceError::Failed(e.to_string()))?;
        Ok(Self {
            service,
            port: service.default_port(),
            scheme: "https",
            timeout,
            client,
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Plain HTTP, for daemons behind a local proxy.
    pub fn insecure(mut self) -> Self {
        self.scheme = "http";
        self
    }

    fn url(&self, address: IpAddr, path: &str) -> String {
        format!("{}://{}{path}", self.scheme, SocketAddr::new(address, self.port))
    }

    fn transport_error(&self, e: reqwest::Error) -> ServiceError {
        if e.is_timeout() {
            ServiceError::Timeout(self.timeout)
        } else if e.is_connect() {
            ServiceError::ConnectionRefused
        } else if e.is_decode() {
            ServiceError::Failed(format!("malformed response: {e}"))
        } else {
            ServiceError::Unreachable(e.to_string())
        }
    }

    async fn check(&self, response: Response) -> Result<Response, ServiceError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, body.trim()))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        address: IpAddr,
        path: &str,
    ) -> Result<T, ServiceError> {
        let response = self
            .client
            .get(self.url(address, path))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.check(response)
            .await?
            .json()
            .await
            .map_err(|e| self.transport_error(e))
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        address: IpAddr,
        path: &str,
        body: &B,
    ) -> Result<Response, ServiceError> {
        let response = self
            .client
            .post(self.url(address, path))
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.check(response).await
    }
}

fn status_error(status: StatusCode, body: &str) -> ServiceError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        body.to_string()
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServiceError::TokenRejected(detail),
        StatusCode::CONFLICT => ServiceError::Incompatible(detail),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
            ServiceError::Unreachable(detail)
        }
        _ => ServiceError::Failed(detail),
    }
}

#[async_trait]
impl ServiceClient for HttpServiceClient {
    fn service(&self) -> ServiceType {
        self.service
    }

    async fn is_available(&self, address: IpAddr) -> Result<bool, ServiceError> {
        let response = self
            .client
            .get(self.url(address, "/1.0/status"))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => self.check(response).await.map(|_| false),
        }
    }

    async fn local_resources(&self, address: IpAddr) -> Result<ResourceReport, ServiceError> {
        self.get_json(address, "/1.0/resources").await
    }

    async fn bootstrap(&self, address: IpAddr, config: &ClusterConfig) -> Result<(), ServiceError> {
        self.post(address, "/1.0/cluster", config).await.map(|_| ())
    }

    async fn issue_token(&self, address: IpAddr, joiner: &str) -> Result<String, ServiceError> {
        let response = self
            .post(address, "/1.0/tokens", &TokenRequest { name: joiner })
            .await?;
        let body: TokenResponse = response.json().await.map_err(|e| self.transport_error(e))?;
        Ok(body.token)
    }

    async fn join(
        &self,
        address: IpAddr,
        token: &str,
        config: &ClusterConfig,
    ) -> Result<(), ServiceError> {
        self.post(address, "/1.0/cluster/join", &JoinRequest { token, config })
            .await
            .map(|_| ())
    }

    async fn list_own_members(&self, address: IpAddr) -> Result<BTreeSet<String>, ServiceError> {
        let body: MembersResponse = self.get_json(address, "/1.0/cluster").await?;
        Ok(body.members.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_bracket_ipv6_addresses() {
        let client = HttpServiceClient::new(ServiceType::Storage, Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.url("10.0.0.2".parse().unwrap(), "/1.0/status"),
            "https://10.0.0.2:7443/1.0/status"
        );
        assert_eq!(
            client.insecure().with_port(8080).url("fd00::2".parse().unwrap(), "/1.0/cluster"),
            "http://[fd00::2]:8080/1.0/cluster"
        );
    }

    #[test]
    fn status_codes_map_to_service_errors() {
        assert_eq!(
            status_error(StatusCode::FORBIDDEN, "token expired"),
            ServiceError::TokenRejected("token expired".into())
        );
        assert!(matches!(
            status_error(StatusCode::CONFLICT, ""),
            ServiceError::Incompatible(_)
        ));
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(!status_error(StatusCode::INTERNAL_SERVER_ERROR, "boom").is_transient());
    }
}
