//! Provision manager reached over HTTP/JSON.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cybernode_id::{LeaseId, ProvisionManagerId};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::lease::ProvisionMonitorLease;
use super::manager::{MonitorUpdate, ProvisionManager, Registration, ServiceFailure};
use crate::error::RemoteError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct LeaseGrant {
    lease_id: LeaseId,
    expiration: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct RenewRequest {
    duration_secs: u64,
}

#[derive(Debug, Deserialize)]
struct RenewResponse {
    expiration: DateTime<Utc>,
}

/// HTTP client for one provision manager.
pub struct HttpProvisionManager {
    id: ProvisionManagerId,
    client: reqwest::Client,
    base_url: String,
}

impl HttpProvisionManager {
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            id: ProvisionManagerId::new(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and classify any failure.
    async fn send(
        &self,
        call: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RemoteError> {
        let response = request.send().await.map_err(|e| {
            debug!(manager = %self.base_url, call, error = %e, "Provision manager unreachable");
            RemoteError::retryable(format!("{call}: {e}"))
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        error!(manager = %self.base_url, call, status = %status, body = %body, "Provision manager call failed");
        Err(classify_status(status, format!("{call}: {status} - {body}")))
    }
}

/// Map an HTTP status to how the failed call should be treated.
pub fn classify_status(status: StatusCode, message: String) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::fatal(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::retryable(message)
        }
        s if s.is_server_error() => RemoteError::retryable(message),
        _ => RemoteError::permanent(message),
    }
}

fn decode_error(call: &str, e: reqwest::Error) -> RemoteError {
    RemoteError::permanent(format!("{call}: invalid response: {e}"))
}

#[async_trait]
impl ProvisionManager for HttpProvisionManager {
    fn id(&self) -> ProvisionManagerId {
        self.id
    }

    async fn register(
        &self,
        registration: &Registration,
    ) -> Result<ProvisionMonitorLease, RemoteError> {
        let request = self
            .client
            .post(self.url("/v1/cybernodes"))
            .json(registration);
        let grant: LeaseGrant = self
            .send("register", request)
            .await?
            .json()
            .await
            .map_err(|e| decode_error("register", e))?;

        debug!(manager = %self.base_url, lease = %grant.lease_id, expiration = %grant.expiration, "Registered");
        Ok(ProvisionMonitorLease {
            id: grant.lease_id,
            manager: self.id,
            expiration: grant.expiration,
            duration_secs: registration.lease_duration_secs,
        })
    }

    async fn renew(
        &self,
        lease: &ProvisionMonitorLease,
        duration: Duration,
    ) -> Result<DateTime<Utc>, RemoteError> {
        let request = self
            .client
            .post(self.url(&format!("/v1/leases/{}/renew", lease.id)))
            .json(&RenewRequest {
                duration_secs: duration.as_secs(),
            });
        let renewed: RenewResponse = self
            .send("renew", request)
            .await?
            .json()
            .await
            .map_err(|e| decode_error("renew", e))?;
        Ok(renewed.expiration)
    }

    async fn cancel(&self, lease: &ProvisionMonitorLease) -> Result<(), RemoteError> {
        let request = self
            .client
            .delete(self.url(&format!("/v1/leases/{}", lease.id)));
        self.send("cancel", request).await?;
        Ok(())
    }

    async fn update(&self, update: &MonitorUpdate) -> Result<(), RemoteError> {
        let request = self
            .client
            .put(self.url(&format!("/v1/cybernodes/{}", update.node.node_id)))
            .json(update);
        self.send("update", request).await?;
        Ok(())
    }

    async fn service_failed(&self, failure: &ServiceFailure) -> Result<(), RemoteError> {
        let request = self
            .client
            .post(self.url(&format!("/v1/cybernodes/{}/failures", failure.node_id)))
            .json(failure);
        self.send("service_failed", request).await?;
        Ok(())
    }
}
