//! Lease rows backing the advisory lock manager.

use crate::errors::{CutoverError, Result};
use crate::storage::DbPool;

#[derive(Debug, Clone)]
pub struct LockRepository {
    pool: DbPool,
}

/// Outcome of one acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired,
    Held { owner: String },
}

impl LockRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Take `key` unless another owner holds an unexpired lease.
    ///
    /// A single upsert decides: the update branch only fires when the existing
    /// lease has expired, so exactly one concurrent caller wins.
    pub async fn try_acquire(&self, key: &str, owner: &str, now_ms: i64, expires_ms: i64) -> Result<LeaseOutcome> {
        let result = sqlx::query(
            "INSERT INTO locks (key, owner, acquired_at, expires_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET \
                owner = excluded.owner, acquired_at = excluded.acquired_at, expires_at = excluded.expires_at \
             WHERE locks.expires_at <= excluded.acquired_at",
        )
        .bind(key)
        .bind(owner)
        .bind(now_ms)
        .bind(expires_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, format!("Failed to acquire lock '{key}'")))?;

        if result.rows_affected() == 1 {
            return Ok(LeaseOutcome::Acquired);
        }

        let holder = self.holder(key).await?.unwrap_or_else(|| "unknown".to_string());
        Ok(LeaseOutcome::Held { owner: holder })
    }

    pub async fn holder(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT owner FROM locks WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CutoverError::database(e, format!("Failed to read lock '{key}'")))?;
        Ok(row.map(|(owner,)| owner))
    }

    /// Whether an unexpired lease exists
    pub async fn is_held(&self, key: &str, now_ms: i64) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT expires_at FROM locks WHERE key = ? AND expires_at > ?")
                .bind(key)
                .bind(now_ms)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| CutoverError::database(e, format!("Failed to read lock '{key}'")))?;
        Ok(row.is_some())
    }

    /// Push the expiry of a lease `owner` still holds. False once it was lost.
    pub async fn renew(&self, key: &str, owner: &str, expires_ms: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE locks SET expires_at = ? WHERE key = ? AND owner = ?")
            .bind(expires_ms)
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(|e| CutoverError::database(e, format!("Failed to renew lock '{key}'")))?;
        Ok(result.rows_affected() == 1)
    }

    /// Release only if still owned by `owner`
    pub async fn release(&self, key: &str, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM locks WHERE key = ? AND owner = ?")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(|e| CutoverError::database(e, format!("Failed to release lock '{key}'")))?;
        Ok(())
    }
}
