//! `health`

use super::output::{emit, print_table_header, print_table_row, status, OutputFormat};
use crate::services::{HealthReport, OverallHealth};
use crate::startup::App;
use anyhow::{bail, Result};
use clap::Args;

#[derive(Args)]
pub struct HealthArgs {
    /// Environment to probe; all configured environments when omitted
    #[arg(short, long, value_name = "ENV")]
    pub environment: Option<String>,
}

pub async fn handle_health(app: &App, args: HealthArgs, format: OutputFormat) -> Result<()> {
    let names = match args.environment {
        Some(name) => vec![app.environment_name(Some(name))?],
        None => app.config.environments.iter().map(|env| env.name.clone()).collect(),
    };

    let prober = app.health_prober();
    let mut reports = Vec::with_capacity(names.len());
    for name in &names {
        reports.push(prober.environment_report(app.clients.environment(name)?).await);
    }
    emit(&reports, format, |r| print_reports(r))?;

    let unhealthy: Vec<&str> = reports
        .iter()
        .filter(|r| r.status == OverallHealth::Unhealthy)
        .map(|r| r.environment.as_str())
        .collect();
    if !unhealthy.is_empty() {
        bail!("unhealthy: {}", unhealthy.join(", "));
    }
    Ok(())
}

fn print_reports(reports: &[HealthReport]) {
    let columns = [("Probe", 16), ("Healthy", 8), ("Time (ms)", 10), ("Detail", 50)];
    for report in reports {
        println!("\n{}: {}", report.environment, status(&report.status.to_string()));
        print_table_header(&columns);
        for probe in &report.probes {
            print_table_row(
                &columns,
                &[
                    probe.name.clone(),
                    if probe.healthy { "yes" } else { "no" }.to_string(),
                    probe.elapsed_ms.to_string(),
                    probe.detail.clone().unwrap_or_default(),
                ],
            );
        }
    }
}
