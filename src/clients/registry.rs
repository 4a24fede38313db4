//! Service registry and KV client.

use crate::clients::http::{ClientSettings, HttpTransport};
use crate::clients::RegistryApi;
use crate::errors::{CutoverError, Result};
use crate::secrets::SecretString;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

const TOKEN_HEADER: &str = "X-Consul-Token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
    pub address: String,
    pub port: u16,
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct HttpRegistry {
    transport: HttpTransport,
}

impl HttpRegistry {
    pub fn new(address: &str, token: Option<SecretString>, settings: &ClientSettings) -> Result<Self> {
        let transport =
            HttpTransport::new("registry", address, settings)?.with_auth_header(TOKEN_HEADER, token);
        Ok(Self { transport })
    }
}

#[async_trait]
impl RegistryApi for HttpRegistry {
    fn address(&self) -> &str {
        self.transport.base_url()
    }

    async fn leader(&self) -> Result<Option<String>> {
        let leader: String = self.transport.get_json("/v1/status/leader").await?;
        Ok(Some(leader).filter(|l| !l.is_empty()))
    }

    async fn register_service(&self, registration: &ServiceRegistration) -> Result<()> {
        let request = self
            .transport
            .request(Method::PUT, "/v1/agent/service/register")?
            .json(registration);
        self.transport.expect_success(request).await
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let request = self
            .transport
            .request(Method::PUT, &format!("/v1/agent/service/deregister/{service_id}"))?;
        self.transport.expect_success(request).await
    }

    async fn healthy_instances(&self, service: &str) -> Result<usize> {
        let entries: Vec<Value> =
            self.transport.get_json(&format!("/v1/health/service/{service}?passing=true")).await?;
        Ok(entries.len())
    }

    async fn kv_put(&self, key: &str, value: &str) -> Result<()> {
        let request = self
            .transport
            .request(Method::PUT, &format!("/v1/kv/{key}"))?
            .body(value.to_string());
        let response = self.transport.send(request).await?;
        let accepted: bool = self.transport.json(response).await?;
        if !accepted {
            return Err(CutoverError::conflict(format!("registry refused write to '{key}'"), "kv"));
        }
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let request = self.transport.request(Method::GET, &format!("/v1/kv/{key}?raw"))?;
        let response = self.transport.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = self.transport.check(response).await?;
        response
            .text()
            .await
            .map(Some)
            .map_err(|e| CutoverError::transport("registry", format!("failed to read '{key}': {e}")))
    }
}
