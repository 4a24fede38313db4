//! Audit log repository
//!
//! Records restores, token operations, blocked promotions and rollout aborts.

use crate::domain::{AuditEntry, AuditEntryId};
use crate::errors::{CutoverError, Result};
use crate::storage::DbPool;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, FromRow)]
struct AuditRow {
    id: String,
    environment: String,
    resource_type: String,
    action: String,
    resource_id: Option<String>,
    metadata: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = CutoverError;

    fn try_from(row: AuditRow) -> Result<Self> {
        Ok(AuditEntry {
            id: AuditEntryId::from_string(row.id),
            environment: row.environment,
            resource_type: row.resource_type,
            action: row.action,
            resource_id: row.resource_id,
            metadata: serde_json::from_str(&row.metadata)
                .map_err(|e| CutoverError::serialization(e, "Invalid audit metadata JSON"))?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AuditLogRepository {
    pool: DbPool,
}

impl AuditLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, entry: &AuditEntry) -> Result<()> {
        let metadata = serde_json::to_string(&entry.metadata)
            .map_err(|e| CutoverError::serialization(e, "Invalid audit metadata JSON"))?;

        sqlx::query(
            "INSERT INTO audit_log (id, environment, resource_type, action, resource_id, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.environment)
        .bind(&entry.resource_type)
        .bind(&entry.action)
        .bind(entry.resource_id.as_deref())
        .bind(metadata)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, "Failed to write audit entry"))?;

        tracing::debug!(
            environment = %entry.environment,
            resource_type = %entry.resource_type,
            action = %entry.action,
            "audit entry recorded"
        );
        Ok(())
    }

    /// Newest first
    pub async fn list(&self, environment: &str, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT id, environment, resource_type, action, resource_id, metadata, created_at \
             FROM audit_log WHERE environment = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(environment)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, "Failed to list audit entries"))?;

        rows.into_iter().map(AuditEntry::try_from).collect()
    }
}
