//! # Structured Logging
//!
//! Subscriber setup plus span macros for the long-running operations. Every
//! span carries an `operation_id` so interleaved CLI output from concurrent
//! runs can be told apart.

use crate::config::ObservabilityConfig;
use crate::errors::{CutoverError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Create a span for an environment-scoped operation (bootstrap, failover,
/// token rotation).
///
/// ```rust,ignore
/// let span = environment_span!("bootstrap", "production");
/// let span = environment_span!("failover", "production", forced = true);
/// ```
#[macro_export]
macro_rules! environment_span {
    ($operation:expr, $environment:expr) => {
        tracing::info_span!(
            "environment_operation",
            operation = %$operation,
            environment = %$environment,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $environment:expr, $($field:tt)*) => {
        tracing::info_span!(
            "environment_operation",
            operation = %$operation,
            environment = %$environment,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a span for a rollout of one application
#[macro_export]
macro_rules! rollout_span {
    ($application:expr, $strategy:expr) => {
        tracing::info_span!(
            "rollout",
            application = %$application,
            strategy = %$strategy,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($application:expr, $strategy:expr, $($field:tt)*) => {
        tracing::info_span!(
            "rollout",
            application = %$application,
            strategy = %$strategy,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level; `verbose` raises the default
/// to `debug`. A subscriber installed earlier (tests) is left in place.
pub fn init_logging(config: &ObservabilityConfig, verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { config.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| CutoverError::config(format!("invalid log level '{default_level}': {e}")))?;

    // try_init fails when a subscriber is already set, e.g. by a test harness
    let _ = if config.json_logging {
        fmt().with_env_filter(filter).with_writer(std::io::stderr).json().try_init()
    } else {
        fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false).try_init()
    };
    Ok(())
}

/// Log the effective configuration at startup. Never includes secrets.
pub fn log_config_info(config: &crate::config::AppConfig) {
    tracing::debug!(
        database = %config.database.url,
        environments = config.environments.len(),
        links = config.links.len(),
        backup_dir = %config.backup.directory.display(),
        metrics_port = config.observability.metrics_port,
        json_logging = config.observability.json_logging,
        "cutover configuration"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macros_compile() {
        let _span = environment_span!("bootstrap", "production");
        let _span = environment_span!("failover", "production", forced = true);
        let _span = rollout_span!("web", "canary");
        let _span = rollout_span!("web", "canary", version = "v2");
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_init_logging_twice_is_harmless() {
        let config = ObservabilityConfig::default();
        assert!(init_logging(&config, false).is_ok());
        assert!(init_logging(&config, true).is_ok());
    }
}
