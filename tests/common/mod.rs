//! Common test utilities for all integration tests.
//!
//! A [`Harness`] is a fully wired [`App`] over a fresh SQLite file and the
//! in-memory collaborators: one environment (`develop`) with a replication
//! link (`develop-dr`) to a separate secondary store.

#![allow(dead_code)]
#![allow(clippy::duplicate_mod)]

use base64::{engine::general_purpose::STANDARD, Engine as _};
use cutover::clients::memory::{MemoryEnvironment, MemorySecretStore};
use cutover::clients::{Clients, ReplicationLink};
use cutover::config::{
    AppConfig, BackupConfig, BootstrapConfig, DatabaseConfig, EnvironmentConfig, FailoverConfig,
    ReplicationConfig, ReplicationLinkConfig, RolloutConfig,
};
use cutover::domain::TokenRecord;
use cutover::secrets::{SecretString, TokenCipher};
use cutover::startup::App;
use cutover::storage::create_pool;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub const ROOT: &str = "s.bootstrap-root";
pub const ENVIRONMENT: &str = "develop";
pub const LINK: &str = "develop-dr";

pub fn environment_config() -> EnvironmentConfig {
    EnvironmentConfig {
        name: ENVIRONMENT.to_string(),
        region: "eu-west-1".to_string(),
        datacenter: "dc1".to_string(),
        secret_store_addr: "http://vault-a.develop:8200".to_string(),
        cluster_addr: "http://nomad.develop:4646".to_string(),
        registry_addr: "http://consul.develop:8500".to_string(),
        metrics_addr: Some("http://prometheus.develop:9090".to_string()),
        discovery_addr: Some("http://dns.develop:8080".to_string()),
    }
}

/// Configuration with short backoffs and zero hold times, rooted in `dir`
pub fn test_config(dir: &Path) -> AppConfig {
    AppConfig {
        database: DatabaseConfig {
            url: format!("sqlite://{}", dir.join("cutover.db").display()),
            auto_migrate: true,
            ..Default::default()
        },
        backup: BackupConfig { directory: dir.join("backups"), retention_hours: 24 },
        bootstrap: BootstrapConfig { initial_backoff_ms: 1, max_backoff_ms: 2, ..Default::default() },
        replication: ReplicationConfig { poll_interval_seconds: 1, failure_threshold: 3 },
        failover: FailoverConfig { step_backoff_ms: 1, ..Default::default() },
        rollout: RolloutConfig {
            metrics_window_seconds: 0,
            min_healthy_time_seconds: 0,
            step_hold_seconds: 0,
            health_attempts: 5,
            max_parallel: 2,
            ..Default::default()
        },
        environments: vec![environment_config()],
        links: vec![ReplicationLinkConfig {
            id: LINK.to_string(),
            environment: ENVIRONMENT.to_string(),
            primary_addr: "http://vault-a.develop:8200".to_string(),
            secondary_addr: "http://vault-b.develop:8200".to_string(),
        }],
        ..Default::default()
    }
}

pub struct Harness {
    pub app: App,
    pub fakes: MemoryEnvironment,
    pub secondary: Arc<MemorySecretStore>,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let config = test_config(dir.path());

        let environment = config.environments[0].to_environment();
        let fakes = MemoryEnvironment::new(&environment, ROOT);
        let secondary = Arc::new(
            MemorySecretStore::secondary(&config.links[0].secondary_addr).with_token(ROOT, &["root"]),
        );
        let clients = Clients::new().with_environment(fakes.clients(&environment)).with_link(
            ReplicationLink {
                id: LINK.to_string(),
                environment: ENVIRONMENT.to_string(),
                primary: fakes.secret_store.clone(),
                secondary: secondary.clone(),
            },
        );

        let pool = create_pool(&config.database).await.expect("create test pool");
        let cipher =
            TokenCipher::from_base64(&STANDARD.encode([7u8; 32]), "test").expect("32-byte test key");

        Self { app: App::from_parts(config, pool, clients, cipher), fakes, secondary, _dir: dir }
    }

    /// Record the bootstrap credential as the environment's active root
    pub async fn migrate_root(&self) -> TokenRecord {
        self.app.tokens.migrate(SecretString::new(ROOT), ENVIRONMENT).await.expect("migrate root token")
    }
}
