//! # Configuration Management
//!
//! Layered configuration: built-in defaults, then an optional YAML/TOML file,
//! then `CUTOVER__SECTION__FIELD` environment variables. The merged result is
//! validated before it is handed to the rest of the crate.

pub mod settings;

use crate::errors::Result;
use std::path::Path;

pub use settings::{
    AppConfig, BackupConfig, BootstrapConfig, DatabaseConfig, EncryptionConfig, EnvironmentConfig,
    FailoverConfig, HealthConfig, LockConfig, ObservabilityConfig, PagingConfig,
    ReplicationConfig, ReplicationLinkConfig, RolloutConfig,
};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "CUTOVER";

impl AppConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("rollout.ramp_steps")
                .with_list_parse_key("failover.dependents")
                .with_list_parse_key("bootstrap.integration_policies"),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load using defaults and environment only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
database:
  url: "sqlite://./test.db"
failover:
  max_safe_lag: 25
  dependents: ["api", "worker"]
environments:
  - name: production
    region: eu-west
    datacenter: dc1
    secret_store_addr: "http://10.0.0.1:8200"
    cluster_addr: "http://10.0.0.1:4646"
    registry_addr: "http://10.0.0.1:8500"
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.database.url, "sqlite://./test.db");
        assert_eq!(config.failover.max_safe_lag, 25);
        assert_eq!(config.failover.dependents, vec!["api", "worker"]);
        assert_eq!(config.environments.len(), 1);
        // untouched sections keep their defaults
        assert_eq!(config.replication.failure_threshold, 3);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = AppConfig::load(Some(Path::new("/nonexistent/cutover.yaml")));
        assert!(result.is_err());
    }
}
