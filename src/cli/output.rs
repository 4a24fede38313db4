//! Output formatting shared by every command
//!
//! Results print as JSON, YAML or a plain table; errors go to stderr with the
//! last completed step and the recommended manual action.

use crate::errors::CutoverError;
use anyhow::{Context, Result};
use clap::ValueEnum;
use owo_colors::OwoColorize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    Json,
    Yaml,
    #[default]
    Table,
}

/// Print `data` as JSON or YAML, or hand it to `table` for the table format
pub fn emit<T: Serialize>(data: &T, format: OutputFormat, table: impl FnOnce(&T)) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(data),
        OutputFormat::Yaml => print_yaml(data),
        OutputFormat::Table => {
            table(data);
            Ok(())
        }
    }
}

pub fn print_json<T: Serialize>(data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data).context("Failed to serialize to JSON")?;
    println!("{json}");
    Ok(())
}

pub fn print_yaml<T: Serialize>(data: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(data).context("Failed to serialize to YAML")?;
    println!("{yaml}");
    Ok(())
}

/// Truncate string to maximum length with ellipsis
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

pub fn print_table_header(columns: &[(&str, usize)]) {
    println!();
    let header: Vec<String> = columns.iter().map(|(name, width)| format!("{name:<width$}")).collect();
    println!("{}", header.join(" ").trim_end().bold());

    let total_width: usize = columns.iter().map(|(_, w)| w + 1).sum();
    println!("{}", "-".repeat(total_width.saturating_sub(1)));
}

pub fn print_table_row(columns: &[(&str, usize)], values: &[String]) {
    let cells: Vec<String> = columns
        .iter()
        .zip(values)
        .map(|((_, width), value)| format!("{:<width$}", truncate(value, *width)))
        .collect();
    println!("{}", cells.join(" ").trim_end());
}

/// Colour a status word by how an operator should read it
pub fn status(word: &str) -> String {
    match word {
        "healthy" | "completed" | "succeeded" | "active" | "PHASE1_READY" | "PHASE2_READY" => {
            word.green().to_string()
        }
        "degraded" | "in_progress" | "monitoring" | "promoting" | "pending" | "failover_initiated" => {
            word.yellow().to_string()
        }
        "unhealthy" | "failed" | "aborted" | "aborting" | "revoked" => word.red().to_string(),
        other => other.to_string(),
    }
}

/// Write an error report to stderr
pub fn report_error(err: &anyhow::Error) {
    eprintln!("{} {err:#}", "error:".red().bold());
    if let Some(cause) = err.chain().find_map(|e| e.downcast_ref::<CutoverError>()) {
        if let Some(step) = cause.last_completed_step() {
            eprintln!("{} {step}", "last completed step:".bold());
        }
        if let Some(action) = cause.remediation() {
            eprintln!("{} {action}", "remediation:".yellow().bold());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Row {
        name: String,
        value: i32,
    }

    #[test]
    fn test_emit_formats() {
        let row = Row { name: "test".into(), value: 42 };
        assert!(emit(&row, OutputFormat::Json, |_| {}).is_ok());
        assert!(emit(&row, OutputFormat::Yaml, |_| {}).is_ok());

        let mut called = false;
        emit(&row, OutputFormat::Table, |_| called = true).unwrap();
        assert!(called);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world", 8), "hello...");
        assert_eq!(truncate("hello", 3), "...");
    }

    #[test]
    fn test_unknown_status_is_uncoloured() {
        assert_eq!(status("UNINITIALIZED"), "UNINITIALIZED");
        assert!(status("healthy").contains("healthy"));
    }
}
