//! Integration tests for configuration loading
//!
//! These tests validate layering of the config file and `CUTOVER__` environment
//! overrides, and the cross-section validation applied after merging.

use cutover::startup::{resolve_config_path, ENV_CONFIG_PATH};
use cutover::{AppConfig, CutoverError};
use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

// Serialize tests that modify environment variables
static ENV_MUTEX: Mutex<()> = Mutex::new(());

fn config_file(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

const TOML_CONFIG: &str = r#"
[failover]
max_safe_lag = 5
dependents = ["api"]

[[environments]]
name = "production"
region = "eu-west-1"
datacenter = "dc1"
secret_store_addr = "http://10.0.0.1:8200"
cluster_addr = "http://10.0.0.1:4646"
registry_addr = "http://10.0.0.1:8500"

[[links]]
id = "prod-dr"
environment = "production"
primary_addr = "http://10.0.0.1:8200"
secondary_addr = "http://10.1.0.1:8200"
"#;

#[test]
fn test_environment_overrides_file_values() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let file = config_file(".toml", TOML_CONFIG);

    env::set_var("CUTOVER__FAILOVER__MAX_SAFE_LAG", "25");
    env::set_var("CUTOVER__ROLLOUT__RAMP_STEPS", "20,60,100");
    let result = AppConfig::load(Some(file.path()));
    env::remove_var("CUTOVER__FAILOVER__MAX_SAFE_LAG");
    env::remove_var("CUTOVER__ROLLOUT__RAMP_STEPS");

    let config = result.unwrap();
    assert_eq!(config.failover.max_safe_lag, 25);
    assert_eq!(config.failover.dependents, vec!["api"]);
    assert_eq!(config.rollout.ramp_steps, vec![20, 60, 100]);
    assert_eq!(config.links_for("production").len(), 1);
    assert_eq!(config.environment("production").unwrap().datacenter, "dc1");
}

#[test]
fn test_unparseable_override_is_rejected() {
    let _guard = ENV_MUTEX.lock().unwrap();

    env::set_var("CUTOVER__FAILOVER__MAX_SAFE_LAG", "plenty");
    let result = AppConfig::from_env();
    env::remove_var("CUTOVER__FAILOVER__MAX_SAFE_LAG");

    assert!(matches!(result, Err(CutoverError::Config { .. })));
}

#[test]
fn test_defaults_without_file() {
    let _guard = ENV_MUTEX.lock().unwrap();

    let config = AppConfig::from_env().unwrap();
    assert!(config.environments.is_empty());
    assert_eq!(config.failover.max_safe_lag, 10);
    assert_eq!(config.replication.failure_threshold, 3);
    assert_eq!(config.rollout.ramp_steps, vec![25, 50, 100]);
}

#[test]
fn test_link_to_unknown_environment_fails_validation() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let file = config_file(
        ".yaml",
        r#"
links:
  - id: stray
    environment: staging
    primary_addr: "http://10.0.0.1:8200"
    secondary_addr: "http://10.1.0.1:8200"
"#,
    );

    let err = AppConfig::load(Some(file.path())).unwrap_err();
    match err {
        CutoverError::Validation { field, .. } => assert_eq!(field.as_deref(), Some("links")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_ramp_must_end_at_100() {
    let _guard = ENV_MUTEX.lock().unwrap();
    let file = config_file(".yaml", "rollout:\n  ramp_steps: [10, 50]\n");

    assert!(matches!(AppConfig::load(Some(file.path())), Err(CutoverError::Validation { .. })));
}

#[test]
fn test_config_path_resolution_order() {
    let _guard = ENV_MUTEX.lock().unwrap();

    env::set_var(ENV_CONFIG_PATH, "/etc/cutover/from-env.toml");
    let explicit = resolve_config_path(Some(PathBuf::from("/tmp/explicit.toml")));
    let from_env = resolve_config_path(None);
    env::remove_var(ENV_CONFIG_PATH);

    assert_eq!(explicit, Some(PathBuf::from("/tmp/explicit.toml")));
    assert_eq!(from_env, Some(PathBuf::from("/etc/cutover/from-env.toml")));
}
