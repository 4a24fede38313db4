//! `bootstrap` and `rollback`

use super::output::{emit, status, OutputFormat};
use crate::domain::Phase;
use crate::services::BootstrapOptions;
use crate::startup::App;
use anyhow::Result;
use clap::Args;
use serde::Serialize;

#[derive(Args)]
pub struct BootstrapArgs {
    /// Target environment (defaults to the only configured one)
    #[arg(short, long, value_name = "ENV")]
    pub environment: Option<String>,

    /// Accept a configured definition that differs from the recorded one
    #[arg(long)]
    pub migrate_environment: bool,
}

#[derive(Args)]
pub struct RollbackArgs {
    #[arg(short, long, value_name = "ENV")]
    pub environment: Option<String>,
}

#[derive(Serialize)]
struct PhaseOutcome {
    environment: String,
    phase: Phase,
}

fn print_phase(outcome: &PhaseOutcome) {
    println!("{}: {}", outcome.environment, status(outcome.phase.as_str()));
}

pub async fn handle_bootstrap(app: &App, args: BootstrapArgs, format: OutputFormat) -> Result<()> {
    let environment = app.environment_name(args.environment)?;
    let options = BootstrapOptions {
        bootstrap_token: App::bootstrap_token(),
        migrate_environment: args.migrate_environment,
    };

    let phase = app.phase_controller().bootstrap(&environment, options).await?;
    emit(&PhaseOutcome { environment, phase }, format, print_phase)
}

pub async fn handle_rollback(app: &App, args: RollbackArgs, format: OutputFormat) -> Result<()> {
    let environment = app.environment_name(args.environment)?;
    let phase = app.phase_controller().rollback(&environment).await?;
    emit(&PhaseOutcome { environment, phase }, format, print_phase)
}
