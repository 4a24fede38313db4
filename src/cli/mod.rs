//! # Command Line Interface
//!
//! The `cutover` binary: bootstrap and rollback of an environment, secret
//! store failover, application rollouts, token and backup administration and
//! an infrastructure health report.
//!
//! Orchestration failures map onto distinct exit codes so wrappers can react
//! without parsing output:
//!
//! | code | meaning |
//! |------|---------|
//! | 0 | success |
//! | 1 | any other failure |
//! | 2 | a readiness gate timed out (state rolled back) |
//! | 3 | another operation holds the lock |
//! | 4 | the snapshot is not verified |
//! | 5 | replication lag too high to promote |
//! | 6 | a failover or rollout step exhausted its retries |
//! | 7 | canary metrics breached an abort threshold |
//! | 8 | a failover is in progress |

pub mod backup;
pub mod bootstrap;
pub mod failover;
pub mod health;
pub mod output;
pub mod rollout;
pub mod tokens;

use crate::errors::CutoverError;
use crate::observability::{init_observability, log_config_info};
use crate::startup::{self, App};
use clap::{Parser, Subcommand};
use output::OutputFormat;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "cutover")]
#[command(about = "Bootstrap, failover and rollout orchestration")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (YAML or TOML)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    pub output: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive an environment from its current phase to PHASE2_READY
    #[command(
        after_help = "EXAMPLES:\n    CUTOVER_BOOTSTRAP_TOKEN=s.xxxx cutover bootstrap --environment production\n\n    # accept a changed environment definition\n    cutover bootstrap --environment production --migrate-environment"
    )]
    Bootstrap(bootstrap::BootstrapArgs),

    /// Roll an environment back to its previous ready phase
    Rollback(bootstrap::RollbackArgs),

    /// Secret store failover commands
    Failover {
        #[command(subcommand)]
        command: failover::FailoverCommands,
    },

    /// Application rollout commands
    Rollout {
        #[command(subcommand)]
        command: rollout::RolloutCommands,
    },

    /// Managed token commands
    Token {
        #[command(subcommand)]
        command: tokens::TokenCommands,
    },

    /// Backup snapshot commands
    Backup {
        #[command(subcommand)]
        command: backup::BackupCommands,
    },

    /// Probe the infrastructure services of an environment
    Health(health::HealthArgs),
}

/// Exit code for an error, by the first orchestration error in its chain
pub fn exit_code(err: &anyhow::Error) -> u8 {
    match err.chain().find_map(|e| e.downcast_ref::<CutoverError>()) {
        Some(CutoverError::ReadinessTimeout { .. }) => 2,
        Some(CutoverError::LockContention { .. }) => 3,
        Some(CutoverError::NotVerified { .. }) => 4,
        Some(CutoverError::ReplicationUnsafe { .. }) => 5,
        Some(CutoverError::StepExhausted { .. }) => 6,
        Some(CutoverError::AbortThresholdBreached { .. }) => 7,
        Some(CutoverError::FailoverInProgress { .. }) => 8,
        _ => 1,
    }
}

/// Parse arguments, run the command and turn the outcome into an exit code
pub async fn run_cli() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            output::report_error(&err);
            ExitCode::from(exit_code(&err))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    startup::load_dotenv();
    let config_path = startup::resolve_config_path(cli.config);
    let config = startup::load_config(config_path.as_deref())?;
    init_observability(&config.observability, cli.verbose)?;
    log_config_info(&config);

    let app = App::build(config).await?;
    let format = cli.output;

    match cli.command {
        Commands::Bootstrap(args) => bootstrap::handle_bootstrap(&app, args, format).await,
        Commands::Rollback(args) => bootstrap::handle_rollback(&app, args, format).await,
        Commands::Failover { command } => failover::handle_failover_command(&app, command, format).await,
        Commands::Rollout { command } => rollout::handle_rollout_command(&app, command, format).await,
        Commands::Token { command } => tokens::handle_token_command(&app, command, format).await,
        Commands::Backup { command } => backup::handle_backup_command(&app, command, format).await,
        Commands::Health(args) => health::handle_health(&app, args, format).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_rollout_start() {
        let cli = Cli::try_parse_from([
            "cutover",
            "rollout",
            "start",
            "--application",
            "web",
            "--strategy",
            "blue-green",
            "--version",
            "v2",
            "--output",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Rollout { .. }));
    }

    #[test]
    fn test_exit_codes() {
        let lock = anyhow::Error::new(CutoverError::LockContention {
            scope: "environment".into(),
            key: "environment:production".into(),
            holder: "pid-1".into(),
        });
        assert_eq!(exit_code(&lock), 3);

        let wrapped = anyhow::Error::new(CutoverError::NotVerified { snapshot_id: "s1".into() })
            .context("restore failed");
        assert_eq!(exit_code(&wrapped), 4);

        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
        assert_eq!(exit_code(&anyhow::Error::new(CutoverError::internal("x"))), 1);
    }
}
