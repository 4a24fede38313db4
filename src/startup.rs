//! Process startup: environment files, configuration, the database and the
//! wiring of every service against one set of clients.

use crate::clients::{ClientSettings, Clients, ServiceTokens};
use crate::config::AppConfig;
use crate::domain::DegradedPrimary;
use crate::errors::{CutoverError, Result};
use crate::secrets::{SecretString, TokenCipher, BOOTSTRAP_TOKEN_VARS};
use crate::services::{
    pager, BackupManager, FailoverOrchestrator, HealthProber, LockManager, PhaseController,
    ReplicationMonitor, RolloutController, TokenManager,
};
use crate::storage::{create_pool, DbPool, LockRepository, Repositories};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Config file path variable
pub const ENV_CONFIG_PATH: &str = "CUTOVER_CONFIG";

/// Used when neither `--config` nor `CUTOVER_CONFIG` is given and the file exists
pub const DEFAULT_CONFIG_FILE: &str = "cutover.toml";

const CLUSTER_TOKEN_VARS: [&str; 2] = ["CUTOVER_CLUSTER_TOKEN", "NOMAD_TOKEN"];
const REGISTRY_TOKEN_VARS: [&str; 2] = ["CUTOVER_REGISTRY_TOKEN", "CONSUL_HTTP_TOKEN"];
const DISCOVERY_TOKEN_VARS: [&str; 1] = ["CUTOVER_DISCOVERY_TOKEN"];

/// Load `.env` when present. Only a malformed file is reported.
pub fn load_dotenv() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Error loading .env file: {e}");
        }
    }
}

/// `--config`, then `CUTOVER_CONFIG`, then `./cutover.toml` if it exists
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit
        .or_else(|| std::env::var(ENV_CONFIG_PATH).ok().filter(|v| !v.trim().is_empty()).map(PathBuf::from))
        .or_else(|| Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()))
}

pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = AppConfig::load(path)?;
    debug!(path = ?path, "configuration loaded");
    Ok(config)
}

fn service_tokens() -> ServiceTokens {
    ServiceTokens {
        cluster: SecretString::from_env(&CLUSTER_TOKEN_VARS),
        registry: SecretString::from_env(&REGISTRY_TOKEN_VARS),
        discovery: SecretString::from_env(&DISCOVERY_TOKEN_VARS),
    }
}

/// Everything a command needs, built once per process
#[derive(Clone)]
pub struct App {
    pub config: AppConfig,
    pub pool: DbPool,
    pub repos: Repositories,
    pub clients: Arc<Clients>,
    pub locks: LockManager,
    pub backups: BackupManager,
    pub tokens: TokenManager,
}

impl App {
    /// Connect the database and build HTTP clients from `config`
    pub async fn build(config: AppConfig) -> Result<Self> {
        let pool = create_pool(&config.database).await?;
        let cipher = TokenCipher::from_config(&config.encryption)?;
        let clients = Clients::from_config(&config, &service_tokens(), &ClientSettings::default())?;
        info!(
            environments = config.environments.len(),
            links = config.links.len(),
            "orchestrator wired"
        );
        Ok(Self::from_parts(config, pool, clients, cipher))
    }

    /// Assemble from prebuilt parts; used with in-memory clients in tests
    pub fn from_parts(config: AppConfig, pool: DbPool, clients: Clients, cipher: TokenCipher) -> Self {
        let repos = Repositories::new(pool.clone());
        let clients = Arc::new(clients);
        let locks = LockManager::new(LockRepository::new(pool.clone()), &config.lock);
        let backups = BackupManager::new(repos.clone(), config.backup.clone());
        let tokens = TokenManager::new(repos.clone(), clients.clone(), cipher, locks.clone());
        Self { config, pool, repos, clients, locks, backups, tokens }
    }

    /// The ambient bootstrap credential, read once
    pub fn bootstrap_token() -> Option<SecretString> {
        SecretString::from_env(&BOOTSTRAP_TOKEN_VARS)
    }

    pub fn phase_controller(&self) -> PhaseController {
        PhaseController::new(
            self.repos.clone(),
            self.clients.clone(),
            self.tokens.clone(),
            self.backups.clone(),
            self.locks.clone(),
            self.config.bootstrap.clone(),
        )
    }

    pub fn health_prober(&self) -> HealthProber {
        HealthProber::new(&self.config.health)
    }

    pub fn failover_orchestrator(&self) -> Result<FailoverOrchestrator> {
        Ok(FailoverOrchestrator::new(
            self.repos.clone(),
            self.clients.clone(),
            self.tokens.clone(),
            self.backups.clone(),
            self.locks.clone(),
            self.health_prober(),
            pager::from_config(&self.config.paging)?,
            self.config.failover.clone(),
        ))
    }

    pub fn rollout_controller(&self) -> RolloutController {
        RolloutController::new(
            self.repos.clone(),
            self.clients.clone(),
            self.locks.clone(),
            self.config.rollout.clone(),
        )
    }

    /// Monitor over the links of `environment`, or all links when `None`
    pub fn replication_monitor(&self, environment: Option<&str>) -> (ReplicationMonitor, mpsc::Receiver<DegradedPrimary>) {
        let links = self
            .clients
            .links()
            .iter()
            .filter(|link| environment.map_or(true, |env| link.environment == env))
            .cloned()
            .collect();
        ReplicationMonitor::new(links, self.config.replication.clone())
    }

    /// `requested`, or the only configured environment
    pub fn environment_name(&self, requested: Option<String>) -> Result<String> {
        match requested {
            Some(name) => {
                self.config.environment(&name)?;
                Ok(name)
            }
            None => match self.config.environments.as_slice() {
                [only] => Ok(only.name.clone()),
                [] => Err(CutoverError::config("no environments configured")),
                _ => Err(CutoverError::validation_field(
                    "several environments are configured; pass --environment",
                    "environment",
                )),
            },
        }
    }
}
