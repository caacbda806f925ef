//! Directory Gateway
//!
//! Client for the downstream application's provisioning API. Errors are
//! classified at the seam: transport failures, 5xx, 408/429 and auth
//! hiccups are retryable; validation rejections are fatal. The
//! `external_ref` carried on create requests is the idempotency key the
//! downstream uses to de-duplicate replays.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Expected to succeed on retry (transport, 5xx, rate limiting).
    #[error("retryable gateway failure: {0}")]
    Retryable(String),
    /// The downstream rejected the request as invalid; retrying is useless.
    #[error("gateway rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationSpec {
    /// Idempotency key for the downstream create.
    pub external_ref: String,
    pub name: String,
    pub plan: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationRecord {
    pub organization_id: String,
    /// False when the external_ref matched an existing organization.
    #[serde(default)]
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    pub user_id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[async_trait]
pub trait DirectoryGateway: Send + Sync {
    async fn create_organization(
        &self,
        tenant_id: &str,
        spec: &OrganizationSpec,
    ) -> Result<OrganizationRecord, GatewayError>;

    /// Upsert the given users into the downstream directory; returns the
    /// number of users the downstream reported as synced.
    async fn sync_users(
        &self,
        tenant_id: &str,
        users: &[UserSpec],
    ) -> Result<u32, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct HttpDirectoryGatewayConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpDirectoryGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrganizationRequest<'a> {
    tenant_id: &'a str,
    #[serde(flatten)]
    spec: &'a OrganizationSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncUsersRequest<'a> {
    users: &'a [UserSpec],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncUsersResponse {
    synced_count: u32,
}

pub struct HttpDirectoryGateway {
    config: HttpDirectoryGatewayConfig,
    client: reqwest::Client,
}

impl HttpDirectoryGateway {
    pub fn new(config: HttpDirectoryGatewayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.base_url, path);
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.config.api_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn classify(response: reqwest::Response) -> GatewayError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_client_error()
            && status != reqwest::StatusCode::REQUEST_TIMEOUT
            && status != reqwest::StatusCode::TOO_MANY_REQUESTS
            && status != reqwest::StatusCode::UNAUTHORIZED
        {
            GatewayError::Rejected(format!("{}: {}", status, body))
        } else {
            GatewayError::Retryable(format!("{}: {}", status, body))
        }
    }
}

#[async_trait]
impl DirectoryGateway for HttpDirectoryGateway {
    async fn create_organization(
        &self,
        tenant_id: &str,
        spec: &OrganizationSpec,
    ) -> Result<OrganizationRecord, GatewayError> {
        debug!(tenant_id, external_ref = %spec.external_ref, "Creating downstream organization");
        let response = self
            .request(reqwest::Method::POST, "/api/organizations")
            .json(&CreateOrganizationRequest { tenant_id, spec })
            .send()
            .await
            .map_err(|e| GatewayError::Retryable(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }
        response
            .json::<OrganizationRecord>()
            .await
            .map_err(|e| GatewayError::Retryable(format!("invalid response body: {}", e)))
    }

    async fn sync_users(
        &self,
        tenant_id: &str,
        users: &[UserSpec],
    ) -> Result<u32, GatewayError> {
        debug!(tenant_id, user_count = users.len(), "Syncing downstream users");
        let path = format!("/api/organizations/{}/users", tenant_id);
        let response = self
            .request(reqwest::Method::PUT, &path)
            .json(&SyncUsersRequest { users })
            .send()
            .await
            .map_err(|e| GatewayError::Retryable(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }
        let body = response
            .json::<SyncUsersResponse>()
            .await
            .map_err(|e| GatewayError::Retryable(format!("invalid response body: {}", e)))?;
        Ok(body.synced_count)
    }
}
