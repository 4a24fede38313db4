//! Failover event repository
//!
//! Events are append-only: once `completed_at` is set, updates are refused.

use crate::domain::{EventStatus, FailoverEvent, FailoverEventId, StepRecord};
use crate::errors::{CutoverError, Result};
use crate::storage::DbPool;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::str::FromStr;

const SELECT_COLUMNS: &str = "SELECT id, environment, trigger_reason, forced, lag_at_start, steps, \
     status, started_at, completed_at FROM failover_events";

#[derive(Debug, FromRow)]
struct FailoverEventRow {
    id: String,
    environment: String,
    trigger_reason: String,
    forced: bool,
    lag_at_start: i64,
    steps: String,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<FailoverEventRow> for FailoverEvent {
    type Error = CutoverError;

    fn try_from(row: FailoverEventRow) -> Result<Self> {
        let steps: Vec<StepRecord> = serde_json::from_str(&row.steps).map_err(|e| {
            CutoverError::serialization(e, format!("Invalid steps for failover event {}", row.id))
        })?;

        Ok(FailoverEvent {
            id: FailoverEventId::from_string(row.id),
            environment: row.environment,
            trigger_reason: row.trigger_reason,
            forced: row.forced,
            lag_at_start: row.lag_at_start.max(0) as u64,
            started_at: row.started_at,
            steps,
            status: EventStatus::from_str(&row.status).map_err(CutoverError::validation)?,
            completed_at: row.completed_at,
        })
    }
}

fn encode_steps(event: &FailoverEvent) -> Result<String> {
    serde_json::to_string(&event.steps)
        .map_err(|e| CutoverError::serialization(e, "Failed to encode failover steps"))
}

#[derive(Debug, Clone)]
pub struct FailoverEventRepository {
    pool: DbPool,
}

impl FailoverEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a new in-progress event; a second running event for the same
    /// environment is rejected by `idx_failover_events_in_progress`.
    pub async fn insert(&self, event: &FailoverEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO failover_events (id, environment, trigger_reason, forced, lag_at_start, steps, status, started_at, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(&event.environment)
        .bind(&event.trigger_reason)
        .bind(event.forced)
        .bind(i64::try_from(event.lag_at_start).unwrap_or(i64::MAX))
        .bind(encode_steps(event)?)
        .bind(event.status.as_str())
        .bind(event.started_at)
        .bind(event.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error().map(|db| db.is_unique_violation()).unwrap_or(false) {
                CutoverError::conflict(
                    format!("a failover is already in progress for '{}'", event.environment),
                    "failover_event",
                )
            } else {
                CutoverError::database(e, format!("Failed to record failover event {}", event.id))
            }
        })?;
        Ok(())
    }

    /// Persist step progress and outcome. Refused once the event is complete.
    pub async fn update(&self, event: &FailoverEvent) -> Result<()> {
        let result = sqlx::query(
            "UPDATE failover_events SET steps = ?, status = ?, completed_at = ? \
             WHERE id = ? AND completed_at IS NULL",
        )
        .bind(encode_steps(event)?)
        .bind(event.status.as_str())
        .bind(event.completed_at)
        .bind(&event.id)
        .execute(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, format!("Failed to update failover event {}", event.id)))?;

        if result.rows_affected() == 0 {
            return Err(CutoverError::conflict(
                format!("failover event {} is complete and immutable", event.id),
                "failover_event",
            ));
        }
        Ok(())
    }

    pub async fn get(&self, id: &FailoverEventId) -> Result<FailoverEvent> {
        let row: Option<FailoverEventRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CutoverError::database(e, format!("Failed to load failover event {id}")))?;

        row.map(FailoverEvent::try_from)
            .transpose()?
            .ok_or_else(|| CutoverError::not_found("failover_event", id.as_str()))
    }

    pub async fn latest(&self, environment: &str) -> Result<Option<FailoverEvent>> {
        let row: Option<FailoverEventRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE environment = ? ORDER BY started_at DESC LIMIT 1"
        ))
        .bind(environment)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, "Failed to load latest failover event"))?;

        row.map(FailoverEvent::try_from).transpose()
    }

    pub async fn in_progress(&self, environment: &str) -> Result<Option<FailoverEvent>> {
        let row: Option<FailoverEventRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE environment = ? AND status = 'in_progress' LIMIT 1"
        ))
        .bind(environment)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, "Failed to check for in-progress failover"))?;

        row.map(FailoverEvent::try_from).transpose()
    }

    /// Newest first
    pub async fn list(&self, environment: &str, limit: i64) -> Result<Vec<FailoverEvent>> {
        let rows: Vec<FailoverEventRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE environment = ? ORDER BY started_at DESC LIMIT ?"
        ))
        .bind(environment)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, "Failed to list failover events"))?;

        rows.into_iter().map(FailoverEvent::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FailoverStep;
    use crate::storage::test_helpers::TestDatabase;

    #[tokio::test]
    async fn test_one_in_progress_event_per_environment() {
        let db = TestDatabase::new().await;
        let repo = FailoverEventRepository::new(db.pool.clone());

        let first = FailoverEvent::start("production", "degraded", false, 0);
        repo.insert(&first).await.unwrap();

        let second = FailoverEvent::start("production", "degraded", false, 0);
        assert!(matches!(repo.insert(&second).await, Err(CutoverError::Conflict { .. })));

        let elsewhere = FailoverEvent::start("staging", "degraded", false, 0);
        repo.insert(&elsewhere).await.unwrap();
    }

    #[tokio::test]
    async fn test_completed_event_is_immutable() {
        let db = TestDatabase::new().await;
        let repo = FailoverEventRepository::new(db.pool.clone());

        let mut event = FailoverEvent::start("production", "manual", true, 42);
        repo.insert(&event).await.unwrap();

        event.mark_succeeded(FailoverStep::Promote, 1, None);
        event.fail(FailoverStep::UpdateDiscovery, 3, "provider down");
        repo.update(&event).await.unwrap();

        let loaded = repo.get(&event.id).await.unwrap();
        assert_eq!(loaded.status, EventStatus::Failed);
        assert_eq!(loaded.lag_at_start, 42);
        assert_eq!(loaded.last_completed_step(), "promote");

        assert!(repo.update(&event).await.is_err());
        assert!(repo.in_progress("production").await.unwrap().is_none());
    }
}
