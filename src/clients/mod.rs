//! # External Service Clients
//!
//! Thin reqwest transports for the collaborators the orchestrator drives:
//! the secret store, the workload scheduler, the service registry, the
//! metrics backend and the discovery (DNS) provider. Each is reached through
//! an `async_trait` so services can be exercised against in-memory
//! implementations (the `memory` module, built for tests and behind the
//! `test-utils` feature).

pub mod cluster;
pub mod discovery;
pub mod http;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod metrics;
pub mod registry;
pub mod secret_store;

use crate::config::{AppConfig, EnvironmentConfig};
use crate::domain::{Allocation, Environment, JobSpec, JobStatus, JobSummary};
use crate::errors::{CutoverError, Result};
use crate::secrets::SecretString;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use cluster::HttpCluster;
pub use discovery::HttpDiscovery;
pub use http::{ClientSettings, HttpTransport};
pub use metrics::{render_query, HttpMetrics};
pub use registry::{HttpRegistry, ServiceRegistration};
pub use secret_store::{
    CreatedToken, HttpSecretStore, ReplicationInfo, SealStatus, StoreHealth, TokenCreateRequest,
    TokenLookup,
};

#[async_trait]
pub trait SecretStoreApi: Send + Sync {
    fn address(&self) -> &str;

    async fn health(&self) -> Result<StoreHealth>;

    async fn seal_status(&self) -> Result<SealStatus>;

    async fn replication_status(&self) -> Result<ReplicationInfo>;

    async fn promote_secondary(&self, token: &SecretString) -> Result<()>;

    async fn create_token(
        &self,
        token: &SecretString,
        request: &TokenCreateRequest,
    ) -> Result<CreatedToken>;

    /// Revoke `target`, authenticated as `token`
    async fn revoke_token(&self, token: &SecretString, target: &SecretString) -> Result<()>;

    async fn lookup_self(&self, token: &SecretString) -> Result<TokenLookup>;

    async fn kv_write(&self, token: &SecretString, path: &str, data: &serde_json::Value) -> Result<()>;

    async fn kv_read(&self, token: &SecretString, path: &str) -> Result<Option<serde_json::Value>>;
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    fn address(&self) -> &str;

    /// Current leader address, `None` while no leader is elected
    async fn leader(&self) -> Result<Option<String>>;

    async fn job_status(&self, job_id: &str) -> Result<Option<JobStatus>>;

    async fn job_summary(&self, job_id: &str) -> Result<Option<JobSummary>>;

    async fn submit_job(&self, spec: &JobSpec) -> Result<()>;

    async fn stop_job(&self, job_id: &str, purge: bool) -> Result<()>;

    async fn scale_job(&self, job_id: &str, group: &str, count: u32) -> Result<()>;

    async fn job_allocations(&self, job_id: &str) -> Result<Vec<Allocation>>;

    async fn restart_allocation(&self, allocation_id: &str) -> Result<()>;
}

#[async_trait]
pub trait RegistryApi: Send + Sync {
    fn address(&self) -> &str;

    async fn leader(&self) -> Result<Option<String>>;

    async fn register_service(&self, registration: &ServiceRegistration) -> Result<()>;

    async fn deregister_service(&self, service_id: &str) -> Result<()>;

    /// Number of instances passing all health checks
    async fn healthy_instances(&self, service: &str) -> Result<usize>;

    async fn kv_put(&self, key: &str, value: &str) -> Result<()>;

    async fn kv_get(&self, key: &str) -> Result<Option<String>>;
}

#[async_trait]
pub trait MetricsApi: Send + Sync {
    async fn query(&self, expr: &str) -> Result<Option<f64>>;

    async fn query_range(
        &self,
        expr: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step_secs: u64,
    ) -> Result<Vec<(DateTime<Utc>, f64)>>;

    async fn ready(&self) -> Result<bool>;
}

#[async_trait]
pub trait DiscoveryApi: Send + Sync {
    async fn upsert(&self, name: &str, target: &str, ttl_secs: u64) -> Result<()>;
}

/// Everything needed to drive one environment
#[derive(Clone)]
pub struct EnvironmentClients {
    pub environment: Environment,
    pub secret_store: Arc<dyn SecretStoreApi>,
    pub cluster: Arc<dyn ClusterApi>,
    pub registry: Arc<dyn RegistryApi>,
    pub metrics: Option<Arc<dyn MetricsApi>>,
    pub discovery: Option<Arc<dyn DiscoveryApi>>,
}

impl EnvironmentClients {
    pub fn metrics(&self) -> Result<&Arc<dyn MetricsApi>> {
        self.metrics.as_ref().ok_or_else(|| {
            CutoverError::config(format!(
                "environment '{}' has no metrics_addr configured",
                self.environment.name
            ))
        })
    }

    pub fn discovery(&self) -> Result<&Arc<dyn DiscoveryApi>> {
        self.discovery.as_ref().ok_or_else(|| {
            CutoverError::config(format!(
                "environment '{}' has no discovery_addr configured",
                self.environment.name
            ))
        })
    }
}

/// A primary/secondary secret-store pair watched for failover
#[derive(Clone)]
pub struct ReplicationLink {
    pub id: String,
    pub environment: String,
    pub primary: Arc<dyn SecretStoreApi>,
    pub secondary: Arc<dyn SecretStoreApi>,
}

/// Client handles for every configured environment and link
#[derive(Clone, Default)]
pub struct Clients {
    environments: BTreeMap<String, EnvironmentClients>,
    links: Vec<ReplicationLink>,
}

/// Ambient credentials for the scheduler, registry and discovery APIs
#[derive(Debug, Clone, Default)]
pub struct ServiceTokens {
    pub cluster: Option<SecretString>,
    pub registry: Option<SecretString>,
    pub discovery: Option<SecretString>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build HTTP clients for every environment and link in `config`
    pub fn from_config(config: &AppConfig, tokens: &ServiceTokens, settings: &ClientSettings) -> Result<Self> {
        let mut clients = Self::new();
        for env in &config.environments {
            clients = clients.with_environment(http_environment(env, tokens, settings)?);
        }
        for link in &config.links {
            clients = clients.with_link(ReplicationLink {
                id: link.id.clone(),
                environment: link.environment.clone(),
                primary: Arc::new(HttpSecretStore::new(&link.primary_addr, settings)?),
                secondary: Arc::new(HttpSecretStore::new(&link.secondary_addr, settings)?),
            });
        }
        Ok(clients)
    }

    pub fn with_environment(mut self, clients: EnvironmentClients) -> Self {
        self.environments.insert(clients.environment.name.clone(), clients);
        self
    }

    pub fn with_link(mut self, link: ReplicationLink) -> Self {
        self.links.push(link);
        self
    }

    pub fn environment(&self, name: &str) -> Result<&EnvironmentClients> {
        self.environments.get(name).ok_or_else(|| CutoverError::not_found("environment", name))
    }

    pub fn links(&self) -> &[ReplicationLink] {
        &self.links
    }

    pub fn link(&self, id: &str) -> Result<&ReplicationLink> {
        self.links
            .iter()
            .find(|l| l.id == id)
            .ok_or_else(|| CutoverError::not_found("replication_link", id))
    }

    /// First link configured for `environment`
    pub fn link_for(&self, environment: &str) -> Result<&ReplicationLink> {
        self.links
            .iter()
            .find(|l| l.environment == environment)
            .ok_or_else(|| CutoverError::not_found("replication_link", environment))
    }
}

fn http_environment(
    env: &EnvironmentConfig,
    tokens: &ServiceTokens,
    settings: &ClientSettings,
) -> Result<EnvironmentClients> {
    let metrics: Option<Arc<dyn MetricsApi>> = match &env.metrics_addr {
        Some(addr) => Some(Arc::new(HttpMetrics::new(addr, settings)?)),
        None => None,
    };
    let discovery: Option<Arc<dyn DiscoveryApi>> = match &env.discovery_addr {
        Some(addr) => Some(Arc::new(HttpDiscovery::new(addr, tokens.discovery.clone(), settings)?)),
        None => None,
    };

    Ok(EnvironmentClients {
        environment: env.to_environment(),
        secret_store: Arc::new(HttpSecretStore::new(&env.secret_store_addr, settings)?),
        cluster: Arc::new(HttpCluster::new(&env.cluster_addr, tokens.cluster.clone(), settings)?),
        registry: Arc::new(HttpRegistry::new(&env.registry_addr, tokens.registry.clone(), settings)?),
        metrics,
        discovery,
    })
}
