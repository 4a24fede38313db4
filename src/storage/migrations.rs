//! # Embedded schema migrations
//!
//! Schema migrations are embedded in the binary and applied in filename order,
//! each in its own transaction, with a SHA-256 checksum recorded in
//! `_cutover_migrations`. A migration whose recorded checksum no longer
//! matches the embedded SQL is reported rather than silently re-applied.

use crate::errors::{CutoverError, Result};
use crate::storage::DbPool;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::Row;
use tracing::{error, info, warn};

/// Embedded migrations as (file stem, SQL)
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "20250301000001_create_bootstrap_tables",
        include_str!("../../migrations/20250301000001_create_bootstrap_tables.sql"),
    ),
    (
        "20250301000002_create_token_records",
        include_str!("../../migrations/20250301000002_create_token_records.sql"),
    ),
    (
        "20250301000003_create_backup_snapshots",
        include_str!("../../migrations/20250301000003_create_backup_snapshots.sql"),
    ),
    (
        "20250301000004_create_failover_events",
        include_str!("../../migrations/20250301000004_create_failover_events.sql"),
    ),
    (
        "20250301000005_create_rollout_plans",
        include_str!("../../migrations/20250301000005_create_rollout_plans.sql"),
    ),
    (
        "20250301000006_create_audit_and_locks",
        include_str!("../../migrations/20250301000006_create_audit_and_locks.sql"),
    ),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationInfo {
    pub version: i64,
    pub description: String,
    pub checksum: String,
    pub execution_time: i64,
    pub installed_on: chrono::DateTime<chrono::Utc>,
}

/// Run all pending database migrations
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    create_migration_table(pool).await?;
    let applied = applied_checksums(pool).await?;

    let mut migrations_run = 0;
    for (filename, sql) in MIGRATIONS {
        let version = extract_version_from_filename(filename)?;
        let checksum = calculate_checksum(sql);

        if let Some(recorded) = applied.iter().find(|(v, _)| *v == version).map(|(_, c)| c) {
            if *recorded != checksum {
                warn!(version, migration = filename, "Applied migration checksum differs");
            }
            continue;
        }

        info!(version, "Running migration: {}", filename);
        let start_time = std::time::Instant::now();

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| CutoverError::database(e, "Failed to start migration transaction"))?;

        sqlx::raw_sql(sql).execute(&mut *tx).await.map_err(|e| {
            error!(error = %e, migration = filename, "Migration failed");
            CutoverError::database(e, format!("Migration failed: {filename}"))
        })?;

        let execution_time = start_time.elapsed().as_millis() as i64;
        sqlx::query(
            "INSERT INTO _cutover_migrations (version, description, checksum, execution_time, installed_on) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(version)
        .bind(*filename)
        .bind(&checksum)
        .bind(execution_time)
        .bind(chrono::Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| CutoverError::database(e, format!("Failed to record migration: {filename}")))?;

        tx.commit()
            .await
            .map_err(|e| CutoverError::database(e, "Failed to commit migration transaction"))?;

        migrations_run += 1;
    }

    if migrations_run > 0 {
        info!(count = migrations_run, "Database migrations completed");
    }

    Ok(())
}

async fn create_migration_table(pool: &DbPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _cutover_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            checksum TEXT NOT NULL,
            execution_time INTEGER NOT NULL,
            installed_on TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| CutoverError::database(e, "Failed to create migration tracking table"))?;

    Ok(())
}

async fn applied_checksums(pool: &DbPool) -> Result<Vec<(i64, String)>> {
    let rows = sqlx::query("SELECT version, checksum FROM _cutover_migrations ORDER BY version")
        .fetch_all(pool)
        .await
        .map_err(|e| CutoverError::database(e, "Failed to get applied migrations"))?;

    Ok(rows.into_iter().map(|row| (row.get("version"), row.get("checksum"))).collect())
}

fn extract_version_from_filename(filename: &str) -> Result<i64> {
    filename
        .split('_')
        .next()
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or_else(|| CutoverError::validation(format!("Invalid migration filename: {filename}")))
}

fn calculate_checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// List all applied migrations
pub async fn list_applied_migrations(pool: &DbPool) -> Result<Vec<MigrationInfo>> {
    let rows = sqlx::query(
        "SELECT version, description, checksum, execution_time, installed_on \
         FROM _cutover_migrations ORDER BY version",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| CutoverError::database(e, "Failed to list applied migrations"))?;

    Ok(rows
        .into_iter()
        .map(|row| MigrationInfo {
            version: row.get("version"),
            description: row.get("description"),
            checksum: row.get("checksum"),
            execution_time: row.get("execution_time"),
            installed_on: row.get("installed_on"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::TestDatabase;

    #[test]
    fn test_extract_version_from_filename() {
        assert_eq!(
            extract_version_from_filename("20250301000001_create_bootstrap_tables").unwrap(),
            20250301000001
        );
        assert!(extract_version_from_filename("invalid_filename").is_err());
    }

    #[test]
    fn test_embedded_migrations_are_ordered() {
        let versions: Vec<i64> =
            MIGRATIONS.iter().map(|(f, _)| extract_version_from_filename(f).unwrap()).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = TestDatabase::new().await;
        run_migrations(&db.pool).await.unwrap();
        run_migrations(&db.pool).await.unwrap();

        let applied = list_applied_migrations(&db.pool).await.unwrap();
        assert_eq!(applied.len(), MIGRATIONS.len());
    }
}
