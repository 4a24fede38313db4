//! Token Lifecycle Manager
//!
//! Owns every [`TokenRecord`]: migration of the ambient bootstrap token,
//! rotation, revocation and minting of service tokens. Token values are only
//! held encrypted at rest and as [`SecretString`] in memory.

use crate::clients::{Clients, SecretStoreApi, TokenCreateRequest};
use crate::domain::{AuditEntry, TokenId, TokenKind, TokenRecord, TokenStatus, TokenSummary};
use crate::errors::{CutoverError, Result};
use crate::observability::MetricsRecorder;
use crate::secrets::{SecretString, TokenCipher};
use crate::services::locks::{LockManager, LockScope};
use crate::services::retry::RetryPolicy;
use crate::storage::Repositories;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

#[derive(Clone)]
pub struct TokenManager {
    repos: Repositories,
    clients: Arc<Clients>,
    cipher: TokenCipher,
    locks: LockManager,
    revoke_retry: RetryPolicy,
    metrics: MetricsRecorder,
}

impl TokenManager {
    pub fn new(repos: Repositories, clients: Arc<Clients>, cipher: TokenCipher, locks: LockManager) -> Self {
        Self {
            repos,
            clients,
            cipher,
            locks,
            revoke_retry: RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(5)),
            metrics: MetricsRecorder::new(),
        }
    }

    pub fn with_revoke_retry(mut self, policy: RetryPolicy) -> Self {
        self.revoke_retry = policy;
        self
    }

    fn store(&self, environment: &str) -> Result<Arc<dyn SecretStoreApi>> {
        Ok(self.clients.environment(environment)?.secret_store.clone())
    }

    fn seal_record(
        &self,
        environment: &str,
        kind: TokenKind,
        status: TokenStatus,
        value: &SecretString,
        policies: Vec<String>,
        ttl: Option<String>,
    ) -> Result<TokenRecord> {
        let sealed = self.cipher.seal(value)?;
        Ok(TokenRecord {
            id: TokenId::new(),
            environment: environment.to_string(),
            kind,
            status,
            encrypted_value: sealed.ciphertext,
            nonce: sealed.nonce,
            key_version: sealed.key_version,
            policies,
            ttl,
            created_at: Utc::now(),
            last_accessed_at: None,
            access_count: 0,
            revoked_at: None,
        })
    }

    fn open(&self, record: &TokenRecord) -> Result<SecretString> {
        self.cipher.open(&record.encrypted_value, &record.nonce, &record.key_version)
    }

    async fn audit(&self, record: &TokenRecord, action: &str) -> Result<()> {
        self.repos
            .audit
            .record(
                &AuditEntry::new(&record.environment, "token_record", action)
                    .resource(record.id.as_str())
                    .metadata(json!({ "kind": record.kind.as_str(), "policies": record.policies })),
            )
            .await
    }

    async fn require_active_root(&self, environment: &str) -> Result<TokenRecord> {
        self.repos.tokens.active(environment, TokenKind::Root).await?.ok_or_else(|| {
            CutoverError::validation(format!(
                "environment '{environment}' has no active root token; run bootstrap first"
            ))
        })
    }

    /// Store the ambient bootstrap token as the environment's active root.
    ///
    /// Idempotent: an existing active root is returned untouched.
    #[instrument(skip(self, source), fields(environment = %environment))]
    pub async fn migrate(&self, source: SecretString, environment: &str) -> Result<TokenRecord> {
        let guard = self.locks.acquire(LockScope::TokenRotation, environment).await?;
        let result = self.migrate_locked(source, environment).await;
        guard.release().await?;
        result
    }

    async fn migrate_locked(&self, source: SecretString, environment: &str) -> Result<TokenRecord> {
        if let Some(existing) = self.repos.tokens.active(environment, TokenKind::Root).await? {
            info!(token_id = %existing.id, "root token already migrated");
            return Ok(existing);
        }
        if source.is_empty() {
            return Err(CutoverError::validation("ambient bootstrap token is empty"));
        }

        let lookup = self.store(environment)?.lookup_self(&source).await?;
        let record = self.seal_record(
            environment,
            TokenKind::Root,
            TokenStatus::Active,
            &source,
            lookup.policies,
            None,
        )?;
        self.repos.tokens.insert(&record).await?;

        self.audit(&record, "migrate").await?;
        self.metrics.record_token_operation(environment, "root", "migrate");
        info!(token_id = %record.id, "bootstrap token migrated to root record");
        Ok(record)
    }

    /// Replace the active token of `kind` with a freshly created one.
    #[instrument(skip(self), fields(environment = %environment, kind = %kind.as_str()))]
    pub async fn rotate(&self, kind: TokenKind, environment: &str) -> Result<TokenRecord> {
        if kind == TokenKind::UnsealShare {
            return Err(CutoverError::validation_field(
                "unseal shares are rekeyed at the secret store, not rotated",
                "kind",
            ));
        }

        let guard = self.locks.acquire(LockScope::TokenRotation, environment).await?;
        let result = self.rotate_locked(kind, environment).await;
        guard.release().await?;
        result
    }

    async fn rotate_locked(&self, kind: TokenKind, environment: &str) -> Result<TokenRecord> {
        let store = self.store(environment)?;
        let current = self
            .repos
            .tokens
            .active(environment, kind)
            .await?
            .ok_or_else(|| CutoverError::not_found(format!("active {} token", kind.as_str()), environment))?;
        let current_value = self.open(&current)?;
        let authority = match kind {
            TokenKind::Root => current_value.clone(),
            _ => self.open(&self.require_active_root(environment).await?)?,
        };

        let request = TokenCreateRequest {
            policies: current.policies.clone(),
            ttl: current.ttl.clone(),
            display_name: Some(format!("cutover-{}-{environment}", kind.as_str())),
            no_parent: true,
        };
        let created = store.create_token(&authority, &request).await?;
        let pending = self.seal_record(
            environment,
            kind,
            TokenStatus::Pending,
            &created.client_token,
            created.policies.clone(),
            current.ttl.clone(),
        )?;
        self.repos.tokens.insert(&pending).await?;

        if let Err(e) = store.lookup_self(&created.client_token).await {
            warn!(error = %e, "replacement token failed verification; keeping current token");
            self.repos.tokens.delete_pending(&pending.id).await?;
            if let Err(revoke_err) = store.revoke_token(&authority, &created.client_token).await {
                warn!(error = %revoke_err, "could not revoke unverified replacement");
            }
            return Err(CutoverError::StepExhausted {
                step: "verify_replacement".to_string(),
                attempts: 1,
                last_completed: "create_replacement".to_string(),
                reason: e.to_string(),
                recovery: "the current token is still active; check the replacement's policies and \
                           rotate again"
                    .to_string(),
            });
        }

        self.repos.tokens.activate_replacement(Some(&current.id), &pending.id).await?;
        let replacement = self.repos.tokens.get(&pending.id).await?;
        self.audit(&replacement, "rotate").await?;
        self.metrics.record_token_operation(environment, kind.as_str(), "rotate");

        let revoker = match kind {
            TokenKind::Root => created.client_token.clone(),
            _ => authority,
        };
        let revoked = self
            .revoke_retry
            .run("revoke_previous_token", |_| store.revoke_token(&revoker, &current_value))
            .await;
        if let Err(exhausted) = revoked {
            warn!(previous = %current.id, reason = %exhausted.reason, "previous token still valid at the store");
            return Err(CutoverError::StepExhausted {
                step: "revoke_previous_token".to_string(),
                attempts: exhausted.attempts,
                last_completed: "activate_replacement".to_string(),
                reason: exhausted.reason,
                recovery: format!(
                    "the replacement is active; revoke the previous token ({}) at the secret store",
                    current.id
                ),
            });
        }

        info!(previous = %current.id, replacement = %replacement.id, "token rotated");
        Ok(replacement)
    }

    /// Revoke a token record. Revoking an already revoked record is a no-op.
    #[instrument(skip(self), fields(token_id = %token_id))]
    pub async fn revoke(&self, token_id: &TokenId) -> Result<TokenRecord> {
        let record = self.repos.tokens.get(token_id).await?;
        let guard = self.locks.acquire(LockScope::TokenRotation, &record.environment).await?;
        let result = self.revoke_locked(token_id).await;
        guard.release().await?;
        result
    }

    async fn revoke_locked(&self, token_id: &TokenId) -> Result<TokenRecord> {
        let record = self.repos.tokens.get(token_id).await?;
        if record.status == TokenStatus::Revoked {
            return Ok(record);
        }
        if record.kind == TokenKind::Root && record.is_active() {
            return Err(CutoverError::validation(
                "refusing to revoke the active root token; rotate it instead",
            ));
        }

        if record.kind == TokenKind::Service {
            let store = self.store(&record.environment)?;
            let root = self.open(&self.require_active_root(&record.environment).await?)?;
            let value = self.open(&record)?;
            self.revoke_retry
                .run("revoke_token", |_| store.revoke_token(&root, &value))
                .await
                .map_err(|exhausted| CutoverError::StepExhausted {
                    step: "revoke_token".to_string(),
                    attempts: exhausted.attempts,
                    last_completed: "lookup_record".to_string(),
                    reason: exhausted.reason,
                    recovery: "the record is still active; rerun the revocation once the secret store \
                               answers"
                        .to_string(),
                })?;
        }

        self.repos.tokens.mark_revoked(token_id).await?;
        let revoked = self.repos.tokens.get(token_id).await?;
        self.audit(&revoked, "revoke").await?;
        self.metrics.record_token_operation(&revoked.environment, revoked.kind.as_str(), "revoke");
        info!("token revoked");
        Ok(revoked)
    }

    /// Create a service token authenticated by the environment's active root
    #[instrument(skip(self, policies), fields(environment = %environment))]
    pub async fn mint_service_token(
        &self,
        environment: &str,
        policies: &[String],
        ttl: Option<&str>,
    ) -> Result<TokenRecord> {
        let guard = self.locks.acquire(LockScope::TokenRotation, environment).await?;
        let result = self.mint_locked(environment, policies, ttl).await;
        guard.release().await?;
        result
    }

    async fn mint_locked(&self, environment: &str, policies: &[String], ttl: Option<&str>) -> Result<TokenRecord> {
        let store = self.store(environment)?;
        let root = self.open(&self.require_active_root(environment).await?)?;

        let request = TokenCreateRequest {
            policies: policies.to_vec(),
            ttl: ttl.map(str::to_string),
            display_name: Some(format!("cutover-service-{environment}")),
            no_parent: true,
        };
        let created = store.create_token(&root, &request).await?;
        store.lookup_self(&created.client_token).await?;

        let record = self.seal_record(
            environment,
            TokenKind::Service,
            TokenStatus::Pending,
            &created.client_token,
            created.policies,
            request.ttl,
        )?;
        self.repos.tokens.insert(&record).await?;
        self.repos.tokens.activate_replacement(None, &record.id).await?;

        let record = self.repos.tokens.get(&record.id).await?;
        self.audit(&record, "mint").await?;
        self.metrics.record_token_operation(environment, "service", "mint");
        Ok(record)
    }

    /// Decrypt a token for use, counting the access
    pub async fn reveal(&self, token_id: &TokenId) -> Result<SecretString> {
        let record = self.repos.tokens.get(token_id).await?;
        if record.status == TokenStatus::Revoked {
            return Err(CutoverError::validation(format!("token {token_id} is revoked")));
        }
        let value = self.open(&record)?;
        self.repos.tokens.record_access(token_id).await?;
        Ok(value)
    }

    /// The active root credential of `environment`
    pub async fn root_credential(&self, environment: &str) -> Result<SecretString> {
        let root = self.require_active_root(environment).await?;
        self.reveal(&root.id).await
    }

    pub async fn list(&self, environment: &str) -> Result<Vec<TokenSummary>> {
        Ok(self.repos.tokens.list(environment).await?.iter().map(TokenRecord::summary).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::MemoryEnvironment;
    use crate::config::LockConfig;
    use crate::domain::Environment;
    use crate::storage::test_helpers::TestDatabase;
    use crate::storage::LockRepository;

    const ROOT: &str = "s.bootstrap-root";

    fn environment() -> Environment {
        Environment {
            name: "develop".into(),
            region: "eu-west-1".into(),
            datacenter: "dc1".into(),
            secret_store_addr: "http://vault.memory:8200".into(),
            cluster_addr: "http://nomad.memory:4646".into(),
        }
    }

    fn manager(db: &TestDatabase, fakes: &MemoryEnvironment) -> TokenManager {
        let repos = Repositories::new(db.pool.clone());
        let clients = Arc::new(Clients::new().with_environment(fakes.clients(&environment())));
        let locks = LockManager::new(LockRepository::new(db.pool.clone()), &LockConfig::default());
        TokenManager::new(repos, clients, TokenCipher::for_testing(), locks)
            .with_revoke_retry(RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)))
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = TestDatabase::new().await;
        let fakes = MemoryEnvironment::new(&environment(), ROOT);
        let tokens = manager(&db, &fakes);

        let first = tokens.migrate(SecretString::new(ROOT), "develop").await.unwrap();
        let second = tokens.migrate(SecretString::new(ROOT), "develop").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.kind, TokenKind::Root);
        assert!(!first.encrypted_value.contains(ROOT));
        assert_eq!(tokens.reveal(&first.id).await.unwrap().expose_secret(), ROOT);
    }

    #[tokio::test]
    async fn test_migrate_rejects_unknown_token() {
        let db = TestDatabase::new().await;
        let fakes = MemoryEnvironment::new(&environment(), ROOT);
        let tokens = manager(&db, &fakes);

        assert!(tokens.migrate(SecretString::new("s.wrong"), "develop").await.is_err());
        assert!(tokens.list("develop").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rotate_root_replaces_and_revokes() {
        let db = TestDatabase::new().await;
        let fakes = MemoryEnvironment::new(&environment(), ROOT);
        let tokens = manager(&db, &fakes);

        let original = tokens.migrate(SecretString::new(ROOT), "develop").await.unwrap();
        let rotated = tokens.rotate(TokenKind::Root, "develop").await.unwrap();

        assert_ne!(rotated.id, original.id);
        assert_eq!(rotated.status, TokenStatus::Active);
        assert!(!fakes.secret_store.accepts(ROOT));
        let new_value = tokens.reveal(&rotated.id).await.unwrap();
        assert!(fakes.secret_store.accepts(new_value.expose_secret()));

        let repos = Repositories::new(db.pool.clone());
        assert_eq!(repos.tokens.count_active("develop", TokenKind::Root).await.unwrap(), 1);
        assert_eq!(repos.tokens.get(&original.id).await.unwrap().status, TokenStatus::Revoked);
    }

    #[tokio::test]
    async fn test_rotate_reports_failed_store_revocation() {
        let db = TestDatabase::new().await;
        let fakes = MemoryEnvironment::new(&environment(), ROOT);
        let tokens = manager(&db, &fakes);

        tokens.migrate(SecretString::new(ROOT), "develop").await.unwrap();
        fakes.secret_store.fail_revocations(3);

        let err = tokens.rotate(TokenKind::Root, "develop").await.unwrap_err();
        assert_eq!(err.last_completed_step(), Some("activate_replacement"));

        // the database already points at the replacement
        let repos = Repositories::new(db.pool.clone());
        assert_eq!(repos.tokens.count_active("develop", TokenKind::Root).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_service_token_lifecycle() {
        let db = TestDatabase::new().await;
        let fakes = MemoryEnvironment::new(&environment(), ROOT);
        let tokens = manager(&db, &fakes);

        tokens.migrate(SecretString::new(ROOT), "develop").await.unwrap();
        let minted = tokens
            .mint_service_token("develop", &["nomad-server".to_string()], Some("72h"))
            .await
            .unwrap();
        assert_eq!(minted.kind, TokenKind::Service);
        assert_eq!(minted.ttl.as_deref(), Some("72h"));
        let value = tokens.reveal(&minted.id).await.unwrap();

        let revoked = tokens.revoke(&minted.id).await.unwrap();
        assert_eq!(revoked.status, TokenStatus::Revoked);
        assert!(!fakes.secret_store.accepts(value.expose_secret()));

        // idempotent
        assert_eq!(tokens.revoke(&minted.id).await.unwrap().status, TokenStatus::Revoked);
        assert!(tokens.reveal(&minted.id).await.is_err());
    }

    #[tokio::test]
    async fn test_active_root_cannot_be_revoked_directly() {
        let db = TestDatabase::new().await;
        let fakes = MemoryEnvironment::new(&environment(), ROOT);
        let tokens = manager(&db, &fakes);

        let root = tokens.migrate(SecretString::new(ROOT), "develop").await.unwrap();
        assert!(matches!(tokens.revoke(&root.id).await, Err(CutoverError::Validation { .. })));
        assert!(matches!(
            tokens.rotate(TokenKind::UnsealShare, "develop").await,
            Err(CutoverError::Validation { .. })
        ));
    }
}
