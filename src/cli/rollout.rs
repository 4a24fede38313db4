//! `rollout start|abort|status`

use super::output::{emit, status, OutputFormat};
use crate::domain::{RolloutPlan, Strategy};
use crate::services::RolloutRequest;
use crate::startup::App;
use anyhow::Result;
use clap::Subcommand;

#[derive(Subcommand)]
pub enum RolloutCommands {
    /// Roll an application out to a new version
    #[command(
        after_help = "EXAMPLES:\n    cutover rollout start --application web --strategy canary --version v2\n\n    cutover rollout start --application web --strategy blue_green --version v2 --environment staging"
    )]
    Start {
        #[arg(short, long, value_name = "APP")]
        application: String,

        /// rolling, blue_green or canary
        #[arg(short, long)]
        strategy: Strategy,

        #[arg(long, value_name = "VERSION")]
        version: String,

        #[arg(short, long, value_name = "ENV")]
        environment: Option<String>,
    },

    /// Abort the running rollout and restore the previous traffic split
    Abort {
        #[arg(short, long, value_name = "APP")]
        application: String,
    },

    /// Show the latest rollout plan of an application
    Status {
        #[arg(short, long, value_name = "APP")]
        application: String,
    },
}

pub async fn handle_rollout_command(app: &App, command: RolloutCommands, format: OutputFormat) -> Result<()> {
    let controller = app.rollout_controller();
    let plan = match command {
        RolloutCommands::Start { application, strategy, version, environment } => {
            let request = RolloutRequest {
                application,
                environment: app.environment_name(environment)?,
                strategy,
                version,
            };
            controller.start(&request).await?
        }
        RolloutCommands::Abort { application } => controller.abort(&application).await?,
        RolloutCommands::Status { application } => controller.status(&application).await?,
    };
    emit(&plan, format, print_plan)
}

fn print_plan(plan: &RolloutPlan) {
    println!(
        "{} {} -> {} ({}, {})",
        plan.application,
        plan.baseline_version,
        plan.target_version,
        plan.strategy,
        status(plan.status.as_str())
    );
    println!("environment: {}", plan.environment);
    println!("traffic:     {}", plan.weights);
    if plan.abort_requested {
        println!("abort requested");
    }
    if let Some(error) = &plan.last_error {
        println!("last error:  {error}");
    }
}
