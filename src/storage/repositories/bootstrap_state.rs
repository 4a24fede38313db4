use crate::domain::{BootstrapState, Environment, Phase, TokenRecord};
use crate::errors::{CutoverError, Result};
use crate::storage::repositories::environment::upsert_definition;
use crate::storage::repositories::token::insert_record;
use crate::storage::DbPool;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::str::FromStr;

#[derive(Debug, FromRow)]
struct BootstrapStateRow {
    environment: String,
    phase: String,
    vault_enabled: bool,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BootstrapStateRow> for BootstrapState {
    type Error = CutoverError;

    fn try_from(row: BootstrapStateRow) -> Result<Self> {
        Ok(BootstrapState {
            phase: Phase::from_str(&row.phase).map_err(CutoverError::validation)?,
            environment: row.environment,
            vault_enabled: row.vault_enabled,
            updated_at: row.updated_at,
        })
    }
}

/// The single live bootstrap record per environment
#[derive(Debug, Clone)]
pub struct BootstrapStateRepository {
    pool: DbPool,
}

impl BootstrapStateRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, environment: &str) -> Result<Option<BootstrapState>> {
        let row: Option<BootstrapStateRow> = sqlx::query_as(
            "SELECT environment, phase, vault_enabled, updated_at FROM bootstrap_states WHERE environment = ?",
        )
        .bind(environment)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CutoverError::database(e, format!("Failed to load bootstrap state for '{environment}'")))?;

        row.map(BootstrapState::try_from).transpose()
    }

    pub async fn save(&self, state: &BootstrapState) -> Result<()> {
        sqlx::query(
            "INSERT INTO bootstrap_states (environment, phase, vault_enabled, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(environment) DO UPDATE SET \
                phase = excluded.phase, vault_enabled = excluded.vault_enabled, updated_at = excluded.updated_at",
        )
        .bind(&state.environment)
        .bind(state.phase.as_str())
        .bind(state.vault_enabled)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            CutoverError::database(e, format!("Failed to save bootstrap state for '{}'", state.environment))
        })?;
        Ok(())
    }

    /// Replace the environment's live state, token records and (when given)
    /// definition in one transaction. A missing state clears the phase record.
    pub async fn replace_environment_state(
        &self,
        environment: &str,
        state: Option<&BootstrapState>,
        tokens: &[TokenRecord],
        definition: Option<&Environment>,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CutoverError::database(e, "Failed to begin restore transaction"))?;

        sqlx::query("DELETE FROM bootstrap_states WHERE environment = ?")
            .bind(environment)
            .execute(&mut *tx)
            .await
            .map_err(|e| CutoverError::database(e, "Failed to clear bootstrap state"))?;

        sqlx::query("DELETE FROM token_records WHERE environment = ?")
            .bind(environment)
            .execute(&mut *tx)
            .await
            .map_err(|e| CutoverError::database(e, "Failed to clear token records"))?;

        if let Some(state) = state {
            sqlx::query(
                "INSERT INTO bootstrap_states (environment, phase, vault_enabled, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(environment)
            .bind(state.phase.as_str())
            .bind(state.vault_enabled)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| CutoverError::database(e, "Failed to restore bootstrap state"))?;
        }

        for token in tokens {
            insert_record(&mut *tx, token).await?;
        }

        if let Some(definition) = definition {
            upsert_definition(&mut *tx, definition).await?;
        }

        tx.commit().await.map_err(|e| CutoverError::database(e, "Failed to commit restore"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::TestDatabase;

    #[tokio::test]
    async fn test_save_and_load() {
        let db = TestDatabase::new().await;
        let repo = BootstrapStateRepository::new(db.pool.clone());
        assert!(repo.get("develop").await.unwrap().is_none());

        let state = BootstrapState::new("develop").at(Phase::Phase2Running);
        repo.save(&state).await.unwrap();
        let loaded = repo.get("develop").await.unwrap().unwrap();
        assert_eq!(loaded.phase, Phase::Phase2Running);
        assert!(loaded.vault_enabled);

        repo.save(&state.at(Phase::Phase2Ready)).await.unwrap();
        assert_eq!(repo.get("develop").await.unwrap().unwrap().phase, Phase::Phase2Ready);
    }

    #[tokio::test]
    async fn test_replace_without_state_clears_phase() {
        let db = TestDatabase::new().await;
        let repo = BootstrapStateRepository::new(db.pool.clone());
        repo.save(&BootstrapState::new("develop").at(Phase::Phase1Ready)).await.unwrap();

        repo.replace_environment_state("develop", None, &[], None).await.unwrap();
        assert!(repo.get("develop").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_replace_leaves_everything_in_place() {
        use crate::domain::{TokenId, TokenKind, TokenStatus};
        use crate::storage::repositories::EnvironmentRepository;

        let db = TestDatabase::new().await;
        let repo = BootstrapStateRepository::new(db.pool.clone());
        let environments = EnvironmentRepository::new(db.pool.clone());
        repo.save(&BootstrapState::new("develop").at(Phase::Phase1Ready)).await.unwrap();
        let original = Environment {
            name: "develop".to_string(),
            region: "global".to_string(),
            datacenter: "dc1".to_string(),
            secret_store_addr: "http://127.0.0.1:8200".to_string(),
            cluster_addr: "http://127.0.0.1:4646".to_string(),
        };
        environments.upsert(&original).await.unwrap();

        let token = TokenRecord {
            id: TokenId::new(),
            environment: "develop".to_string(),
            kind: TokenKind::Root,
            status: TokenStatus::Active,
            encrypted_value: "Y2lwaGVy".to_string(),
            nonce: "bm9uY2U=".to_string(),
            key_version: "test".to_string(),
            policies: vec!["root".to_string()],
            ttl: None,
            created_at: Utc::now(),
            last_accessed_at: None,
            access_count: 0,
            revoked_at: None,
        };
        // the duplicate id fails the second insert
        let tokens = vec![token.clone(), token];
        let replacement = Environment { datacenter: "dc9".to_string(), ..original.clone() };

        let result = repo
            .replace_environment_state(
                "develop",
                Some(&BootstrapState::new("develop").at(Phase::Phase2Ready)),
                &tokens,
                Some(&replacement),
            )
            .await;
        assert!(result.is_err());

        assert_eq!(environments.get("develop").await.unwrap().unwrap().datacenter, "dc1");
        assert_eq!(repo.get("develop").await.unwrap().unwrap().phase, Phase::Phase1Ready);
    }

    #[tokio::test]
    async fn test_replace_records_definition() {
        use crate::storage::repositories::EnvironmentRepository;

        let db = TestDatabase::new().await;
        let repo = BootstrapStateRepository::new(db.pool.clone());
        let environments = EnvironmentRepository::new(db.pool.clone());
        let definition = Environment {
            name: "develop".to_string(),
            region: "global".to_string(),
            datacenter: "dc2".to_string(),
            secret_store_addr: "http://127.0.0.1:8200".to_string(),
            cluster_addr: "http://127.0.0.1:4646".to_string(),
        };

        repo.replace_environment_state("develop", None, &[], Some(&definition)).await.unwrap();
        assert_eq!(environments.get("develop").await.unwrap(), Some(definition));
    }
}
