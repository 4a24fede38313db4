//! `failover status|promote|watch`

use super::output::{emit, print_table_header, print_table_row, status, OutputFormat};
use crate::domain::FailoverEvent;
use crate::services::FailoverReport;
use crate::startup::App;
use anyhow::{Context, Result};
use clap::Subcommand;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Subcommand)]
pub enum FailoverCommands {
    /// Show the derived failover state and a fresh replication sample
    Status {
        #[arg(short, long, value_name = "ENV")]
        environment: Option<String>,
    },

    /// Promote the environment's secondary secret store
    #[command(
        after_help = "EXAMPLES:\n    cutover failover promote --environment production\n\n    # promote even though replication lag is above the threshold\n    cutover failover promote --environment production --force"
    )]
    Promote {
        #[arg(short, long, value_name = "ENV")]
        environment: Option<String>,

        /// Promote even when replication lag exceeds the safety threshold
        #[arg(long)]
        force: bool,

        /// Reason recorded on the failover event
        #[arg(long, default_value = "operator request")]
        reason: String,
    },

    /// Monitor replication and fail over automatically when a primary degrades
    Watch {
        /// Only watch links of this environment
        #[arg(short, long, value_name = "ENV")]
        environment: Option<String>,
    },
}

pub async fn handle_failover_command(app: &App, command: FailoverCommands, format: OutputFormat) -> Result<()> {
    let orchestrator = app.failover_orchestrator()?;
    match command {
        FailoverCommands::Status { environment } => {
            let environment = app.environment_name(environment)?;
            let report = orchestrator.status(&environment).await?;
            emit(&report, format, print_report)
        }
        FailoverCommands::Promote { environment, force, reason } => {
            let environment = app.environment_name(environment)?;
            let event = orchestrator.promote(&environment, force, &reason).await?;
            emit(&event, format, print_event)
        }
        FailoverCommands::Watch { environment } => {
            if let Some(name) = &environment {
                app.config.environment(name)?;
            }
            let (monitor, signals) = app.replication_monitor(environment.as_deref());
            let cancel = CancellationToken::new();

            let shutdown = cancel.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("shutdown requested");
                        shutdown.cancel();
                    }
                    Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
                }
            });

            let monitor_task = tokio::spawn(monitor.run(cancel.clone()));
            orchestrator.watch(signals, cancel.clone()).await?;
            cancel.cancel();
            monitor_task.await.context("replication monitor task failed")?;
            Ok(())
        }
    }
}

fn print_report(report: &FailoverReport) {
    println!("environment: {}", report.environment);
    println!("state:       {}", status(&report.state.to_string()));
    match &report.replication {
        Some(sample) => println!(
            "replication: link {} lag {} (primary {})",
            sample.link_id,
            sample.lag,
            if sample.primary_healthy { status("healthy") } else { status("unhealthy") }
        ),
        None => println!("replication: unavailable"),
    }
    if let Some(event) = &report.latest_event {
        print_event(event);
    }
}

fn print_event(event: &FailoverEvent) {
    println!(
        "\nevent {} ({}, started {}{})",
        event.id,
        status(event.status.as_str()),
        event.started_at.format("%Y-%m-%d %H:%M:%S"),
        if event.forced { ", forced" } else { "" }
    );
    let columns = [("Step", 20), ("Status", 12), ("Attempts", 9), ("Detail", 50)];
    print_table_header(&columns);
    for step in &event.steps {
        print_table_row(
            &columns,
            &[
                step.name.as_str().to_string(),
                format!("{:?}", step.status).to_lowercase(),
                step.attempts.to_string(),
                step.detail.clone().unwrap_or_default(),
            ],
        );
    }
}
