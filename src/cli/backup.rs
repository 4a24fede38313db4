//! `backup create|list|gc|restore`

use super::output::{emit, print_table_header, print_table_row, OutputFormat};
use crate::domain::{BackupSnapshot, SnapshotId};
use crate::startup::App;
use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Capture the environment's state and tokens into a verified snapshot
    Create {
        #[arg(short, long, value_name = "ENV")]
        environment: Option<String>,

        #[arg(long, default_value = "manual")]
        reason: String,
    },

    /// List snapshots of an environment, newest first
    List {
        #[arg(short, long, value_name = "ENV")]
        environment: Option<String>,
    },

    /// Delete expired snapshots, keeping each environment's newest verified one
    Gc,

    /// Replace live state with a verified snapshot
    #[command(after_help = "EXAMPLES:\n    cutover backup restore --snapshot 6f1c0a4e-3b7d-4d3e-9a55-0d3f1e2b7c11")]
    Restore {
        #[arg(long, value_name = "SNAPSHOT_ID")]
        snapshot: SnapshotId,
    },
}

#[derive(Serialize)]
struct Restored {
    snapshot_id: SnapshotId,
    environment: String,
    phase: Option<String>,
    tokens: usize,
}

#[derive(Serialize)]
struct Collected {
    deleted: Vec<SnapshotId>,
}

pub async fn handle_backup_command(app: &App, command: BackupCommands, format: OutputFormat) -> Result<()> {
    match command {
        BackupCommands::Create { environment, reason } => {
            let environment = app.environment_name(environment)?;
            let snapshot = app.backups.create_snapshot(&environment, &reason).await?;
            emit(&vec![snapshot], format, |s| print_snapshots(s))
        }
        BackupCommands::List { environment } => {
            let environment = app.environment_name(environment)?;
            let snapshots = app.backups.list(&environment).await?;
            emit(&snapshots, format, |s| print_snapshots(s))
        }
        BackupCommands::Gc => {
            let deleted = app.backups.gc().await?;
            emit(&Collected { deleted }, format, |c| {
                println!("{} snapshot(s) deleted", c.deleted.len());
                for id in &c.deleted {
                    println!("  {id}");
                }
            })
        }
        BackupCommands::Restore { snapshot } => {
            let contents = app.backups.restore(&snapshot).await?;
            let restored = Restored {
                snapshot_id: snapshot,
                environment: contents.environment,
                phase: contents.state.map(|s| s.phase.to_string()),
                tokens: contents.tokens.len(),
            };
            emit(&restored, format, |r| {
                println!(
                    "restored {} into '{}': phase {}, {} token record(s)",
                    r.snapshot_id,
                    r.environment,
                    r.phase.as_deref().unwrap_or("UNINITIALIZED"),
                    r.tokens
                );
            })
        }
    }
}

fn print_snapshots(snapshots: &[BackupSnapshot]) {
    if snapshots.is_empty() {
        println!("No snapshots");
        return;
    }
    let columns = [("ID", 38), ("Reason", 24), ("Verified", 9), ("Created", 20), ("Expires", 20)];
    print_table_header(&columns);
    for snapshot in snapshots {
        print_table_row(
            &columns,
            &[
                snapshot.id.to_string(),
                snapshot.reason.clone(),
                if snapshot.verified { "yes" } else { "NO" }.to_string(),
                snapshot.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                snapshot.retention_expiry.format("%Y-%m-%d %H:%M:%S").to_string(),
            ],
        );
    }
}
