//! Shared reqwest transport for the external service clients.

use crate::errors::{CutoverError, Result};
use crate::secrets::SecretString;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

/// Longest error body carried into an error message
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10), connect_timeout: Duration::from_secs(3) }
    }
}

/// Base URL, service label and optional static auth header
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base: Url,
    service: &'static str,
    auth: Option<(&'static str, SecretString)>,
}

impl HttpTransport {
    pub fn new(service: &'static str, base_url: &str, settings: &ClientSettings) -> Result<Self> {
        let mut base = Url::parse(base_url).map_err(|e| {
            CutoverError::config(format!("invalid {service} address '{base_url}': {e}"))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|e| CutoverError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, base, service, auth: None })
    }

    /// Send `value` in `header` on every request
    pub fn with_auth_header(mut self, header: &'static str, value: Option<SecretString>) -> Self {
        self.auth = value.filter(|v| !v.is_empty()).map(|v| (header, v));
        self
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    pub fn url(&self, path: &str) -> Result<Url> {
        self.base.join(path.trim_start_matches('/')).map_err(|e| {
            CutoverError::internal(format!("invalid {} path '{path}': {e}", self.service))
        })
    }

    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.url(path)?;
        trace!(service = self.service, %method, %url, "request");
        let mut builder = self.client.request(method, url);
        if let Some((header, value)) = &self.auth {
            builder = builder.header(*header, value.expose_secret());
        }
        Ok(builder)
    }

    pub async fn send(&self, request: RequestBuilder) -> Result<Response> {
        request.send().await.map_err(|e| {
            debug!(service = self.service, error = %e, "request failed");
            CutoverError::transport(self.service, e.to_string())
        })
    }

    /// Fail on a non-success status, keeping a truncated body for context
    pub async fn check(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(self.status_error(status, &body))
    }

    pub fn status_error(&self, status: StatusCode, body: &str) -> CutoverError {
        let mut message: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
        if message.is_empty() {
            message = status.canonical_reason().unwrap_or("request failed").to_string();
        }
        CutoverError::http(self.service, message, status.as_u16())
    }

    pub async fn json<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        let response = self.check(response).await?;
        let body = response
            .text()
            .await
            .map_err(|e| CutoverError::transport(self.service, format!("failed to read body: {e}")))?;
        serde_json::from_str(&body).map_err(|e| {
            CutoverError::serialization(e, format!("unexpected {} response body", self.service))
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(self.request(Method::GET, path)?).await?;
        self.json(response).await
    }

    /// GET that maps 404 to `None`
    pub async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self.send(self.request(Method::GET, path)?).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.json(response).await.map(Some)
    }

    pub async fn expect_success(&self, request: RequestBuilder) -> Result<()> {
        let response = self.send(request).await?;
        self.check(response).await.map(|_| ())
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("service", &self.service)
            .field("base", &self.base.as_str())
            .field("auth", &self.auth.as_ref().map(|(header, _)| *header))
            .finish()
    }
}
