use crate::domain::{BackupSnapshot, SnapshotId};
use crate::errors::{CutoverError, Result};
use crate::storage::DbPool;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

const SELECT_COLUMNS: &str = "SELECT id, environment, reason, path, contents_digest, verified, \
     created_at, retention_expiry FROM backup_snapshots";

#[derive(Debug, FromRow)]
struct SnapshotRow {
    id: String,
    environment: String,
    reason: String,
    path: String,
    contents_digest: String,
    verified: bool,
    created_at: DateTime<Utc>,
    retention_expiry: DateTime<Utc>,
}

impl From<SnapshotRow> for BackupSnapshot {
    fn from(row: SnapshotRow) -> Self {
        BackupSnapshot {
            id: SnapshotId::from_string(row.id),
            environment: row.environment,
            reason: row.reason,
            path: row.path,
            contents_digest: row.contents_digest,
            verified: row.verified,
            created_at: row.created_at,
            retention_expiry: row.retention_expiry,
        }
    }
}

/// Snapshot index; the documents themselves live on disk
#[derive(Debug, Clone)]
pub struct SnapshotRepository {
    pool: DbPool,
}

impl SnapshotRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, snapshot: &BackupSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO backup_snapshots (id, environment, reason, path, contents_digest, verified, created_at, retention_expiry) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&snapshot.id)
        .bind(&snapshot.environment)
        .bind(&snapshot.reason)
        .bind(&snapshot.path)
        .bind(&snapshot.contents_digest)
        .bind(snapshot.verified)
        .bind(snapshot.created_at)
        .bind(snapshot.retention_expiry)
        .execute(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, format!("Failed to index snapshot {}", snapshot.id)))?;
        Ok(())
    }

    pub async fn get(&self, id: &SnapshotId) -> Result<BackupSnapshot> {
        let row: Option<SnapshotRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CutoverError::database(e, format!("Failed to load snapshot {id}")))?;

        row.map(BackupSnapshot::from)
            .ok_or_else(|| CutoverError::not_found("snapshot", id.as_str()))
    }

    pub async fn mark_verified(&self, id: &SnapshotId) -> Result<()> {
        sqlx::query("UPDATE backup_snapshots SET verified = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CutoverError::database(e, format!("Failed to mark snapshot {id} verified")))?;
        Ok(())
    }

    /// Newest first
    pub async fn list(&self, environment: &str) -> Result<Vec<BackupSnapshot>> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE environment = ? ORDER BY created_at DESC"
        ))
        .bind(environment)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, "Failed to list snapshots"))?;

        Ok(rows.into_iter().map(BackupSnapshot::from).collect())
    }

    pub async fn list_all(&self) -> Result<Vec<BackupSnapshot>> {
        let rows: Vec<SnapshotRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY environment, created_at DESC"))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| CutoverError::database(e, "Failed to list snapshots"))?;

        Ok(rows.into_iter().map(BackupSnapshot::from).collect())
    }

    pub async fn latest_verified(&self, environment: &str) -> Result<Option<BackupSnapshot>> {
        let row: Option<SnapshotRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE environment = ? AND verified = 1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(environment)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, "Failed to load latest verified snapshot"))?;

        Ok(row.map(BackupSnapshot::from))
    }

    pub async fn delete(&self, id: &SnapshotId) -> Result<()> {
        sqlx::query("DELETE FROM backup_snapshots WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CutoverError::database(e, format!("Failed to delete snapshot {id}")))?;
        Ok(())
    }
}
