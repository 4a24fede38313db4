//! # Configuration Settings
//!
//! Defines the configuration structure for the cutover orchestrator. Every
//! section has defaults so a config file only needs to name environments.

use crate::errors::{CutoverError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct AppConfig {
    #[validate(nested)]
    pub database: DatabaseConfig,

    #[validate(nested)]
    pub observability: ObservabilityConfig,

    #[validate(nested)]
    pub backup: BackupConfig,

    #[validate(nested)]
    pub bootstrap: BootstrapConfig,

    #[validate(nested)]
    pub replication: ReplicationConfig,

    #[validate(nested)]
    pub failover: FailoverConfig,

    #[validate(nested)]
    pub rollout: RolloutConfig,

    #[validate(nested)]
    pub lock: LockConfig,

    #[validate(nested)]
    pub health: HealthConfig,

    pub encryption: EncryptionConfig,

    pub paging: PagingConfig,

    /// Environments the orchestrator manages
    #[validate(nested)]
    pub environments: Vec<EnvironmentConfig>,

    /// Secret-store replication links watched by the replication monitor
    #[validate(nested)]
    pub links: Vec<ReplicationLinkConfig>,
}

impl AppConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(CutoverError::from)?;
        self.validate_custom()
    }

    /// Cross-section checks the validator derive cannot express
    fn validate_custom(&self) -> Result<()> {
        let mut names = HashSet::new();
        for env in &self.environments {
            if !names.insert(env.name.as_str()) {
                return Err(CutoverError::validation_field(
                    format!("environment '{}' is defined more than once", env.name),
                    "environments",
                ));
            }
        }

        for link in &self.links {
            if !names.contains(link.environment.as_str()) {
                return Err(CutoverError::validation_field(
                    format!(
                        "replication link '{}' references unknown environment '{}'",
                        link.id, link.environment
                    ),
                    "links",
                ));
            }
        }

        let steps = &self.rollout.ramp_steps;
        if steps.is_empty() || steps.last() != Some(&100) {
            return Err(CutoverError::validation_field(
                "rollout ramp steps must end at 100",
                "rollout.ramp_steps",
            ));
        }
        if steps.windows(2).any(|w| w[0] >= w[1]) {
            return Err(CutoverError::validation_field(
                "rollout ramp steps must be strictly increasing",
                "rollout.ramp_steps",
            ));
        }
        if self.rollout.canary_initial_weight >= steps[0] {
            return Err(CutoverError::validation_field(
                "canary initial weight must be below the first ramp step",
                "rollout.canary_initial_weight",
            ));
        }

        Ok(())
    }

    /// Look up an environment by name
    pub fn environment(&self, name: &str) -> Result<&EnvironmentConfig> {
        self.environments
            .iter()
            .find(|env| env.name == name)
            .ok_or_else(|| CutoverError::not_found("environment", name))
    }

    /// Replication links belonging to an environment
    pub fn links_for(&self, environment: &str) -> Vec<&ReplicationLinkConfig> {
        self.links.iter().filter(|link| link.environment == environment).collect()
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL
    #[validate(length(min = 1, message = "Database URL cannot be empty"))]
    pub url: String,

    /// Maximum number of connections in the pool
    #[validate(range(min = 1, max = 100, message = "Max connections must be between 1 and 100"))]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[validate(range(min = 0, max = 50, message = "Min connections must be between 0 and 50"))]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[validate(range(min = 1, max = 60, message = "Connect timeout must be between 1 and 60 seconds"))]
    pub connect_timeout_seconds: u64,

    /// Idle timeout in seconds (0 = no timeout)
    pub idle_timeout_seconds: u64,

    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/cutover.db".to_string(),
            max_connections: 5,
            min_connections: 0,
            connect_timeout_seconds: 10,
            idle_timeout_seconds: 600,
            auto_migrate: true,
        }
    }
}

impl DatabaseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Get idle timeout as Duration (None if 0)
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.idle_timeout_seconds))
        }
    }

    /// Check if this is a SQLite configuration
    pub fn is_sqlite(&self) -> bool {
        self.url.starts_with("sqlite:")
    }
}

/// Logging and metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Service name attached to metrics
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,

    /// Prometheus exporter port (0 = disabled)
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "cutover".to_string(),
            log_level: "info".to_string(),
            json_logging: false,
            metrics_port: 0,
        }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }
}

/// Snapshot storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BackupConfig {
    /// Directory snapshot documents are written to
    pub directory: PathBuf,

    /// How long a snapshot is retained before GC may delete it
    #[validate(range(min = 1, message = "Retention must be at least one hour"))]
    pub retention_hours: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { directory: PathBuf::from("./data/backups"), retention_hours: 168 }
    }
}

impl BackupConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }
}

/// Phase controller configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Attempts per readiness gate
    #[validate(range(min = 1, max = 50, message = "Gate attempts must be between 1 and 50"))]
    pub gate_attempts: u32,

    /// First backoff delay between gate attempts
    pub initial_backoff_ms: u64,

    /// Upper bound on the backoff delay
    pub max_backoff_ms: u64,

    /// Job used as the phase 1 smoke test
    #[validate(length(min = 1))]
    pub smoke_job_id: String,
    pub smoke_image: String,

    /// Secret-store service deployed during migration
    #[validate(length(min = 1))]
    pub secret_store_job_id: String,
    pub secret_store_image: String,

    /// Job rendered from a secret-store-backed template in phase 2
    #[validate(length(min = 1))]
    pub secret_backed_job_id: String,
    pub secret_backed_image: String,
    pub secret_backed_path: String,

    /// Policies attached to the scheduler's integration token
    pub integration_policies: Vec<String>,

    /// TTL of the scheduler's integration token
    pub integration_token_ttl: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            gate_attempts: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            smoke_job_id: "cutover-smoke".to_string(),
            smoke_image: "busybox:1.36".to_string(),
            secret_store_job_id: "vault".to_string(),
            secret_store_image: "hashicorp/vault:1.15".to_string(),
            secret_backed_job_id: "cutover-secret-probe".to_string(),
            secret_backed_image: "busybox:1.36".to_string(),
            secret_backed_path: "secret/data/cutover/probe".to_string(),
            integration_policies: vec!["nomad-server".to_string()],
            integration_token_ttl: "72h".to_string(),
        }
    }
}

/// Replication monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReplicationConfig {
    #[validate(range(min = 1, max = 3600))]
    pub poll_interval_seconds: u64,

    /// Consecutive primary failures before a degraded signal is emitted
    #[validate(range(min = 1, max = 100))]
    pub failure_threshold: u32,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self { poll_interval_seconds: 30, failure_threshold: 3 }
    }
}

/// Failover orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct FailoverConfig {
    /// Highest replication lag at which promotion may start without --force
    pub max_safe_lag: u64,

    /// Discovery record re-pointed at the promoted store
    #[validate(length(min = 1))]
    pub discovery_name: String,
    pub discovery_ttl_seconds: u32,

    /// Attempts for the discovery update and each dependent restart
    #[validate(range(min = 1, max = 10))]
    pub step_attempts: u32,
    pub step_backoff_ms: u64,

    /// Jobs restarted after promotion; verification checks their scheduler job summary
    pub dependents: Vec<String>,

    /// KV path written and read back by the verification probe
    pub probe_path: String,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_safe_lag: 10,
            discovery_name: "vault.service.consul".to_string(),
            discovery_ttl_seconds: 30,
            step_attempts: 3,
            step_backoff_ms: 1_000,
            dependents: Vec::new(),
            probe_path: "secret/data/cutover/failover-probe".to_string(),
        }
    }
}

/// Rollout controller configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RolloutConfig {
    #[validate(range(min = 1))]
    pub poll_interval_seconds: u64,
    #[validate(range(min = 1))]
    pub metrics_window_seconds: u64,
    #[validate(range(min = 1, max = 99))]
    pub canary_initial_weight: u8,
    pub ramp_steps: Vec<u8>,
    pub step_hold_seconds: u64,
    #[validate(range(min = 0.0, max = 1.0))]
    pub abort_error_threshold: f64,
    pub abort_latency_threshold_ms: f64,
    #[validate(range(min = 1))]
    pub max_parallel: u32,
    pub min_healthy_time_seconds: u64,
    #[validate(range(min = 1))]
    pub health_attempts: u32,
    #[validate(range(min = 1))]
    pub canary_count: u32,

    /// PromQL templates; `{app}` and `{version}` are substituted
    pub error_rate_query: String,
    pub latency_query: String,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 10,
            metrics_window_seconds: 300,
            canary_initial_weight: 10,
            ramp_steps: vec![25, 50, 100],
            step_hold_seconds: 60,
            abort_error_threshold: 0.05,
            abort_latency_threshold_ms: 500.0,
            max_parallel: 1,
            min_healthy_time_seconds: 10,
            health_attempts: 10,
            canary_count: 1,
            error_rate_query: concat!(
                "sum(rate(http_requests_total{service=\"{app}\",version=\"{version}\",code=~\"5..\"}[1m]))",
                " / sum(rate(http_requests_total{service=\"{app}\",version=\"{version}\"}[1m]))"
            )
            .to_string(),
            latency_query: concat!(
                "histogram_quantile(0.99, sum(rate(http_request_duration_seconds_bucket",
                "{service=\"{app}\",version=\"{version}\"}[1m])) by (le)) * 1000"
            )
            .to_string(),
        }
    }
}

/// Advisory lock configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LockConfig {
    #[validate(range(min = 1, max = 300))]
    pub acquire_timeout_seconds: u64,

    /// Lease lifetime; a crashed holder's lock becomes free after this
    #[validate(range(min = 1))]
    pub lease_ttl_seconds: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { acquire_timeout_seconds: 5, lease_ttl_seconds: 900 }
    }
}

/// Health probing configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HealthConfig {
    #[validate(range(min = 1, max = 64))]
    pub max_concurrency: usize,
    #[validate(range(min = 1, max = 120))]
    pub probe_timeout_seconds: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { max_concurrency: 4, probe_timeout_seconds: 5 }
    }
}

/// Where the token encryption key comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Environment variable holding the base64-encoded 32-byte key
    pub key_env: String,
    pub key_version: String,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self { key_env: "CUTOVER_ENCRYPTION_KEY".to_string(), key_version: "default".to_string() }
    }
}

/// Operator paging
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PagingConfig {
    /// Webhook receiving failover pages; pages are only logged when unset
    pub webhook_url: Option<String>,
}

/// One managed environment
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EnvironmentConfig {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    #[validate(length(min = 1))]
    pub region: String,
    #[validate(length(min = 1))]
    pub datacenter: String,
    #[validate(url)]
    pub secret_store_addr: String,
    #[validate(url)]
    pub cluster_addr: String,
    #[validate(url)]
    pub registry_addr: String,
    #[validate(url)]
    pub metrics_addr: Option<String>,
    #[validate(url)]
    pub discovery_addr: Option<String>,
}

impl EnvironmentConfig {
    pub fn to_environment(&self) -> crate::domain::Environment {
        crate::domain::Environment {
            name: self.name.clone(),
            region: self.region.clone(),
            datacenter: self.datacenter.clone(),
            secret_store_addr: self.secret_store_addr.clone(),
            cluster_addr: self.cluster_addr.clone(),
        }
    }
}

/// A primary/secondary secret-store pair
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReplicationLinkConfig {
    #[validate(length(min = 1))]
    pub id: String,
    pub environment: String,
    #[validate(url)]
    pub primary_addr: String,
    #[validate(url)]
    pub secondary_addr: String,
}
