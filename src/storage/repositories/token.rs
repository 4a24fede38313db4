//! Token record repository
//!
//! Stores managed credentials (ciphertext only) and enforces the single
//! active root per environment through the partial unique index
//! `idx_token_records_active_root`.

use crate::domain::{TokenId, TokenKind, TokenRecord, TokenStatus};
use crate::errors::{CutoverError, Result};
use crate::storage::DbPool;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite};
use std::str::FromStr;

const SELECT_COLUMNS: &str = "SELECT id, environment, kind, status, encrypted_value, nonce, key_version, \
     policies, ttl, created_at, last_accessed_at, access_count, revoked_at FROM token_records";

#[derive(Debug, FromRow)]
struct TokenRow {
    id: String,
    environment: String,
    kind: String,
    status: String,
    encrypted_value: String,
    nonce: String,
    key_version: String,
    policies: String,
    ttl: Option<String>,
    created_at: DateTime<Utc>,
    last_accessed_at: Option<DateTime<Utc>>,
    access_count: i64,
    revoked_at: Option<DateTime<Utc>>,
}

impl TryFrom<TokenRow> for TokenRecord {
    type Error = CutoverError;

    fn try_from(row: TokenRow) -> Result<Self> {
        let kind = TokenKind::from_str(&row.kind).map_err(CutoverError::validation)?;
        let status = TokenStatus::from_str(&row.status).map_err(CutoverError::validation)?;
        let policies: Vec<String> = serde_json::from_str(&row.policies)
            .map_err(|e| CutoverError::serialization(e, format!("Invalid policies for token {}", row.id)))?;

        Ok(TokenRecord {
            id: TokenId::from_string(row.id),
            environment: row.environment,
            kind,
            status,
            encrypted_value: row.encrypted_value,
            nonce: row.nonce,
            key_version: row.key_version,
            policies,
            ttl: row.ttl,
            created_at: row.created_at,
            last_accessed_at: row.last_accessed_at,
            access_count: row.access_count,
            revoked_at: row.revoked_at,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error().map(|db| db.is_unique_violation()).unwrap_or(false)
}

/// Insert a record through any executor, so restores can reuse it inside
/// their transaction.
pub(crate) async fn insert_record<'e, E>(executor: E, record: &TokenRecord) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let policies = serde_json::to_string(&record.policies)
        .map_err(|e| CutoverError::serialization(e, "Failed to encode token policies"))?;

    sqlx::query(
        "INSERT INTO token_records (id, environment, kind, status, encrypted_value, nonce, key_version, \
         policies, ttl, created_at, last_accessed_at, access_count, revoked_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(&record.environment)
    .bind(record.kind.as_str())
    .bind(record.status.as_str())
    .bind(&record.encrypted_value)
    .bind(&record.nonce)
    .bind(&record.key_version)
    .bind(policies)
    .bind(record.ttl.as_deref())
    .bind(record.created_at)
    .bind(record.last_accessed_at)
    .bind(record.access_count)
    .bind(record.revoked_at)
    .execute(executor)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            CutoverError::conflict(
                format!("environment '{}' already has an active root token", record.environment),
                "token_record",
            )
        } else {
            CutoverError::database(e, format!("Failed to insert token record {}", record.id))
        }
    })?;

    Ok(())
}

#[derive(Debug, Clone)]
pub struct TokenRepository {
    pool: DbPool,
}

impl TokenRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, record: &TokenRecord) -> Result<()> {
        insert_record(&self.pool, record).await
    }

    pub async fn get(&self, id: &TokenId) -> Result<TokenRecord> {
        let row: Option<TokenRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CutoverError::database(e, format!("Failed to load token {id}")))?;

        row.map(TokenRecord::try_from)
            .transpose()?
            .ok_or_else(|| CutoverError::not_found("token_record", id.as_str()))
    }

    /// Newest active record of a kind
    pub async fn active(&self, environment: &str, kind: TokenKind) -> Result<Option<TokenRecord>> {
        let row: Option<TokenRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE environment = ? AND kind = ? AND status = 'active' \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(environment)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, "Failed to load active token"))?;

        row.map(TokenRecord::try_from).transpose()
    }

    pub async fn list(&self, environment: &str) -> Result<Vec<TokenRecord>> {
        let rows: Vec<TokenRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE environment = ? ORDER BY created_at"))
                .bind(environment)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| CutoverError::database(e, "Failed to list token records"))?;

        rows.into_iter().map(TokenRecord::try_from).collect()
    }

    pub async fn count_active(&self, environment: &str, kind: TokenKind) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM token_records WHERE environment = ? AND kind = ? AND status = 'active'",
        )
        .bind(environment)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, "Failed to count active tokens"))?;

        Ok(count.0)
    }

    /// Revoke `previous` and activate `replacement` in one transaction.
    ///
    /// The revoke runs first so the active-root index never sees two rows.
    pub async fn activate_replacement(
        &self,
        previous: Option<&TokenId>,
        replacement: &TokenId,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CutoverError::database(e, "Failed to begin token rotation transaction"))?;

        if let Some(previous) = previous {
            sqlx::query(
                "UPDATE token_records SET status = 'revoked', revoked_at = ? \
                 WHERE id = ? AND status = 'active'",
            )
            .bind(now)
            .bind(previous)
            .execute(&mut *tx)
            .await
            .map_err(|e| CutoverError::database(e, "Failed to revoke previous token record"))?;
        }

        let activated = sqlx::query(
            "UPDATE token_records SET status = 'active' WHERE id = ? AND status = 'pending'",
        )
        .bind(replacement)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CutoverError::conflict("another active root token exists", "token_record")
            } else {
                CutoverError::database(e, "Failed to activate replacement token record")
            }
        })?;

        if activated.rows_affected() != 1 {
            return Err(CutoverError::conflict(
                format!("token {replacement} is not pending"),
                "token_record",
            ));
        }

        tx.commit()
            .await
            .map_err(|e| CutoverError::database(e, "Failed to commit token rotation"))?;
        Ok(())
    }

    /// Discard a replacement that failed verification
    pub async fn delete_pending(&self, id: &TokenId) -> Result<()> {
        sqlx::query("DELETE FROM token_records WHERE id = ? AND status = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CutoverError::database(e, format!("Failed to delete pending token {id}")))?;
        Ok(())
    }

    /// Returns false when the record was already revoked
    pub async fn mark_revoked(&self, id: &TokenId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE token_records SET status = 'revoked', revoked_at = ? \
             WHERE id = ? AND status != 'revoked'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, format!("Failed to revoke token {id}")))?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn record_access(&self, id: &TokenId) -> Result<()> {
        sqlx::query(
            "UPDATE token_records SET access_count = access_count + 1, last_accessed_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, format!("Failed to record access to token {id}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::TestDatabase;

    fn record(environment: &str, kind: TokenKind, status: TokenStatus) -> TokenRecord {
        TokenRecord {
            id: TokenId::new(),
            environment: environment.to_string(),
            kind,
            status,
            encrypted_value: "Y2lwaGVy".to_string(),
            nonce: "bm9uY2U=".to_string(),
            key_version: "test".to_string(),
            policies: vec!["root".to_string()],
            ttl: None,
            created_at: Utc::now(),
            last_accessed_at: None,
            access_count: 0,
            revoked_at: None,
        }
    }

    #[tokio::test]
    async fn test_second_active_root_is_rejected() {
        let db = TestDatabase::new().await;
        let repo = TokenRepository::new(db.pool.clone());

        repo.insert(&record("develop", TokenKind::Root, TokenStatus::Active)).await.unwrap();
        let err = repo
            .insert(&record("develop", TokenKind::Root, TokenStatus::Active))
            .await
            .unwrap_err();
        assert!(matches!(err, CutoverError::Conflict { .. }));

        // other environments and other kinds are unaffected
        repo.insert(&record("staging", TokenKind::Root, TokenStatus::Active)).await.unwrap();
        repo.insert(&record("develop", TokenKind::Service, TokenStatus::Active)).await.unwrap();
        repo.insert(&record("develop", TokenKind::Service, TokenStatus::Active)).await.unwrap();
    }

    #[tokio::test]
    async fn test_activate_replacement_swaps_atomically() {
        let db = TestDatabase::new().await;
        let repo = TokenRepository::new(db.pool.clone());

        let old = record("develop", TokenKind::Root, TokenStatus::Active);
        let new = record("develop", TokenKind::Root, TokenStatus::Pending);
        repo.insert(&old).await.unwrap();
        repo.insert(&new).await.unwrap();

        repo.activate_replacement(Some(&old.id), &new.id).await.unwrap();

        assert_eq!(repo.get(&old.id).await.unwrap().status, TokenStatus::Revoked);
        assert_eq!(repo.get(&new.id).await.unwrap().status, TokenStatus::Active);
        assert_eq!(repo.count_active("develop", TokenKind::Root).await.unwrap(), 1);

        // a second activation of the same record is refused
        assert!(repo.activate_replacement(None, &new.id).await.is_err());
    }

    #[tokio::test]
    async fn test_revoke_and_access_tracking() {
        let db = TestDatabase::new().await;
        let repo = TokenRepository::new(db.pool.clone());
        let token = record("develop", TokenKind::Service, TokenStatus::Active);
        repo.insert(&token).await.unwrap();

        repo.record_access(&token.id).await.unwrap();
        repo.record_access(&token.id).await.unwrap();
        let loaded = repo.get(&token.id).await.unwrap();
        assert_eq!(loaded.access_count, 2);
        assert!(loaded.last_accessed_at.is_some());

        assert!(repo.mark_revoked(&token.id).await.unwrap());
        assert!(!repo.mark_revoked(&token.id).await.unwrap());
        assert!(repo.get(&TokenId::new()).await.is_err());
    }
}
