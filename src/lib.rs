//! # Cutover
//!
//! Orchestrates the lifecycle of a secret-store backed platform: bootstraps
//! an environment through its readiness phases, keeps the credentials it
//! manages rotated and backed up, fails the secret store over to its
//! replication secondary, and rolls applications out with rolling, blue/green
//! or canary strategies.
//!
//! ## Architecture
//!
//! ```text
//! CLI (clap) → services (phase, tokens, backup, failover, rollout, health)
//!                 ↓                        ↓
//!        domain state machines      clients (secret store, scheduler,
//!                 ↓                 registry, metrics, discovery)
//!        storage (SQLite via sqlx)
//! ```
//!
//! Transitions of the three state machines are pure functions in [`domain`];
//! [`services`] apply their effects through the [`clients`] traits, which
//! have reqwest implementations and in-memory fakes.

pub mod cli;
pub mod clients;
pub mod config;
pub mod domain;
pub mod errors;
pub mod observability;
pub mod secrets;
pub mod services;
pub mod startup;
pub mod storage;

pub use config::AppConfig;
pub use errors::{CutoverError, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "cutover");
    }
}
