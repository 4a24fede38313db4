//! Operator paging for failures that need a human.

use crate::config::PagingConfig;
use crate::errors::{CutoverError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: Severity,
    pub environment: String,
    pub summary: String,
    pub remediation: Option<String>,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn critical(environment: &str, summary: impl Into<String>) -> Self {
        Self {
            severity: Severity::Critical,
            environment: environment.to_string(),
            summary: summary.into(),
            remediation: None,
            raised_at: Utc::now(),
        }
    }

    pub fn warning(environment: &str, summary: impl Into<String>) -> Self {
        Self { severity: Severity::Warning, ..Self::critical(environment, summary) }
    }

    pub fn with_remediation(mut self, remediation: Option<String>) -> Self {
        self.remediation = remediation;
        self
    }
}

#[async_trait]
pub trait Pager: Send + Sync {
    async fn page(&self, alert: &Alert) -> Result<()>;
}

/// Emits alerts as error-level log events
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPager;

#[async_trait]
impl Pager for LogPager {
    async fn page(&self, alert: &Alert) -> Result<()> {
        error!(
            severity = ?alert.severity,
            environment = %alert.environment,
            remediation = alert.remediation.as_deref().unwrap_or("-"),
            "PAGE: {}",
            alert.summary
        );
        Ok(())
    }
}

/// Posts alerts as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookPager {
    client: reqwest::Client,
    url: String,
}

impl WebhookPager {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CutoverError::config(format!("Failed to build pager client: {e}")))?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl Pager for WebhookPager {
    async fn page(&self, alert: &Alert) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| CutoverError::transport("pager", e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CutoverError::http("pager", "webhook rejected alert", status.as_u16()));
        }
        info!(environment = %alert.environment, "operator paged");
        Ok(())
    }
}

/// Webhook pager when a URL is configured, otherwise log-only
pub fn from_config(config: &PagingConfig) -> Result<Arc<dyn Pager>> {
    match &config.webhook_url {
        Some(url) if !url.trim().is_empty() => Ok(Arc::new(WebhookPager::new(url.trim())?)),
        _ => Ok(Arc::new(LogPager)),
    }
}

/// Page, logging instead of failing when the pager itself is down
pub async fn page_or_log(pager: &dyn Pager, alert: &Alert) {
    if let Err(e) = pager.page(alert).await {
        error!(error = %e, summary = %alert.summary, "failed to page operator");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn test_log_pager_emits_summary() {
        let alert = Alert::critical("production", "failover halted at update_discovery")
            .with_remediation(Some("update DNS manually".to_string()));
        LogPager.page(&alert).await.unwrap();
        assert!(logs_contain("failover halted at update_discovery"));
    }

    #[test]
    fn test_from_config_defaults_to_log() {
        assert!(from_config(&PagingConfig::default()).is_ok());
        let config = PagingConfig { webhook_url: Some("http://127.0.0.1:9/hook".to_string()) };
        assert!(from_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_logged_not_raised() {
        let pager = WebhookPager::new("http://127.0.0.1:9/hook").unwrap();
        page_or_log(&pager, &Alert::warning("develop", "probe")).await;
    }
}
