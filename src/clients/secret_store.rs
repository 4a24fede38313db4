//! Credential Store Client: the secret store's HTTP API.

use crate::clients::http::{ClientSettings, HttpTransport};
use crate::clients::SecretStoreApi;
use crate::errors::{CutoverError, Result};
use crate::secrets::SecretString;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

const TOKEN_HEADER: &str = "X-Vault-Token";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHealth {
    pub initialized: bool,
    pub sealed: bool,
    #[serde(default)]
    pub standby: bool,
    #[serde(default)]
    pub replication_performance_mode: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl StoreHealth {
    /// Initialized, unsealed and able to serve requests
    pub fn is_serving(&self) -> bool {
        self.initialized && !self.sealed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealStatus {
    pub initialized: bool,
    pub sealed: bool,
    #[serde(default)]
    pub t: u32,
    #[serde(default)]
    pub n: u32,
    #[serde(default)]
    pub progress: u32,
}

/// Performance replication status of one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationInfo {
    /// "primary", "secondary" or "disabled"
    pub mode: String,
    #[serde(default)]
    pub last_wal: Option<u64>,
    #[serde(default)]
    pub last_remote_wal: Option<u64>,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenCreateRequest {
    pub policies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Detach from the creating token so revoking the parent keeps it alive
    pub no_parent: bool,
}

#[derive(Debug, Clone)]
pub struct CreatedToken {
    pub client_token: SecretString,
    pub accessor: String,
    pub policies: Vec<String>,
    pub lease_duration: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLookup {
    #[serde(default)]
    pub accessor: String,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub ttl: u64,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct AuthEnvelope {
    auth: AuthBody,
}

#[derive(Deserialize)]
struct AuthBody {
    client_token: String,
    #[serde(default)]
    accessor: String,
    #[serde(default)]
    policies: Vec<String>,
    #[serde(default)]
    lease_duration: u64,
}

/// reqwest implementation of [`SecretStoreApi`]
#[derive(Debug, Clone)]
pub struct HttpSecretStore {
    transport: HttpTransport,
}

impl HttpSecretStore {
    pub fn new(address: &str, settings: &ClientSettings) -> Result<Self> {
        Ok(Self { transport: HttpTransport::new("secret-store", address, settings)? })
    }

    fn authed(&self, method: Method, path: &str, token: &SecretString) -> Result<reqwest::RequestBuilder> {
        Ok(self.transport.request(method, path)?.header(TOKEN_HEADER, token.expose_secret()))
    }
}

#[async_trait]
impl SecretStoreApi for HttpSecretStore {
    fn address(&self) -> &str {
        self.transport.base_url()
    }

    /// Health is requested with codes forced to 200 so sealed and
    /// uninitialized nodes still return a body to inspect.
    #[instrument(skip(self), fields(address = %self.transport.base_url()))]
    async fn health(&self) -> Result<StoreHealth> {
        self.transport
            .get_json(
                "/v1/sys/health?standbyok=true&perfstandbyok=true&sealedcode=200&uninitcode=200",
            )
            .await
    }

    async fn seal_status(&self) -> Result<SealStatus> {
        self.transport.get_json("/v1/sys/seal-status").await
    }

    async fn replication_status(&self) -> Result<ReplicationInfo> {
        let envelope: DataEnvelope<ReplicationInfo> =
            self.transport.get_json("/v1/sys/replication/performance/status").await?;
        Ok(envelope.data)
    }

    #[instrument(skip(self, token), fields(address = %self.transport.base_url()))]
    async fn promote_secondary(&self, token: &SecretString) -> Result<()> {
        let request = self
            .authed(Method::POST, "/v1/sys/replication/performance/secondary/promote", token)?
            .json(&json!({}));
        self.transport.expect_success(request).await
    }

    async fn create_token(
        &self,
        token: &SecretString,
        request: &TokenCreateRequest,
    ) -> Result<CreatedToken> {
        let builder = self.authed(Method::POST, "/v1/auth/token/create", token)?.json(request);
        let response = self.transport.send(builder).await?;
        let envelope: AuthEnvelope = self.transport.json(response).await?;
        Ok(CreatedToken {
            client_token: SecretString::new(envelope.auth.client_token),
            accessor: envelope.auth.accessor,
            policies: envelope.auth.policies,
            lease_duration: envelope.auth.lease_duration,
        })
    }

    async fn revoke_token(&self, token: &SecretString, target: &SecretString) -> Result<()> {
        let request = self
            .authed(Method::POST, "/v1/auth/token/revoke", token)?
            .json(&json!({ "token": target.expose_secret() }));
        self.transport.expect_success(request).await
    }

    async fn lookup_self(&self, token: &SecretString) -> Result<TokenLookup> {
        let request = self.authed(Method::GET, "/v1/auth/token/lookup-self", token)?;
        let response = self.transport.send(request).await?;
        let envelope: DataEnvelope<TokenLookup> = self.transport.json(response).await?;
        Ok(envelope.data)
    }

    async fn kv_write(&self, token: &SecretString, path: &str, data: &serde_json::Value) -> Result<()> {
        let request = self
            .authed(Method::POST, &format!("/v1/{}", path.trim_start_matches('/')), token)?
            .json(&json!({ "data": data }));
        self.transport.expect_success(request).await
    }

    async fn kv_read(&self, token: &SecretString, path: &str) -> Result<Option<serde_json::Value>> {
        let request =
            self.authed(Method::GET, &format!("/v1/{}", path.trim_start_matches('/')), token)?;
        let response = self.transport.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let envelope: DataEnvelope<serde_json::Value> = self.transport.json(response).await?;
        envelope
            .data
            .get("data")
            .cloned()
            .map(Some)
            .ok_or_else(|| CutoverError::internal(format!("KV response for '{path}' has no data")))
    }
}
