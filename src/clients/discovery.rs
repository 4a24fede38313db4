//! DNS-style discovery record client.

use crate::clients::http::{ClientSettings, HttpTransport};
use crate::clients::DiscoveryApi;
use crate::errors::Result;
use crate::secrets::SecretString;
use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct RecordBody<'a> {
    target: &'a str,
    ttl: u64,
}

#[derive(Debug, Clone)]
pub struct HttpDiscovery {
    transport: HttpTransport,
}

impl HttpDiscovery {
    pub fn new(address: &str, token: Option<SecretString>, settings: &ClientSettings) -> Result<Self> {
        let token = token.map(|t| SecretString::new(format!("Bearer {}", t.expose_secret())));
        let transport =
            HttpTransport::new("discovery", address, settings)?.with_auth_header("Authorization", token);
        Ok(Self { transport })
    }
}

#[async_trait]
impl DiscoveryApi for HttpDiscovery {
    async fn upsert(&self, name: &str, target: &str, ttl_secs: u64) -> Result<()> {
        let request = self
            .transport
            .request(Method::PUT, &format!("/v1/records/{name}"))?
            .json(&RecordBody { target, ttl: ttl_secs });
        self.transport.expect_success(request).await
    }
}
