//! Advisory locks backed by lease rows, so they hold across CLI processes.
//!
//! A lease expires `lease_ttl` after its last renewal. Every [`LockGuard`]
//! runs a heartbeat that renews its lease every third of the TTL until the
//! guard is released or dropped, so only a holder that stopped running loses
//! its lock.

use crate::config::LockConfig;
use crate::errors::{CutoverError, Result};
use crate::storage::{LeaseOutcome, LockRepository};
use chrono::Utc;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

fn expiry_after(ttl: Duration) -> i64 {
    let ttl_ms = ttl.as_millis().min(i64::MAX as u128) as i64;
    Utc::now().timestamp_millis().saturating_add(ttl_ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    /// Phase controller and failover orchestrator
    Environment,
    TokenRotation,
    /// One rollout per application
    Application,
}

impl LockScope {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Environment => "env",
            Self::TokenRotation => "tokens",
            Self::Application => "app",
        }
    }

    pub fn key(&self, name: &str) -> String {
        format!("{}:{name}", self.prefix())
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Environment => "environment",
            Self::TokenRotation => "token rotation",
            Self::Application => "application",
        })
    }
}

#[derive(Debug, Clone)]
pub struct LockManager {
    repo: LockRepository,
    process: String,
    acquire_timeout: Duration,
    lease_ttl: Duration,
}

impl LockManager {
    pub fn new(repo: LockRepository, config: &LockConfig) -> Self {
        Self {
            repo,
            process: format!("pid-{}", std::process::id()),
            acquire_timeout: Duration::from_secs(config.acquire_timeout_seconds),
            lease_ttl: Duration::from_secs(config.lease_ttl_seconds),
        }
    }

    /// Single attempt; a live lease held by anyone else is `LockContention`.
    pub async fn acquire(&self, scope: LockScope, name: &str) -> Result<LockGuard> {
        let key = scope.key(name);
        let owner = format!("{}/{}", self.process, uuid::Uuid::new_v4().simple());
        let now = Utc::now().timestamp_millis();
        let expires = expiry_after(self.lease_ttl);

        let attempt = tokio::time::timeout(
            self.acquire_timeout,
            self.repo.try_acquire(&key, &owner, now, expires),
        )
        .await;

        match attempt {
            Ok(Ok(LeaseOutcome::Acquired)) => {
                debug!(%key, %owner, "lock acquired");
                let guard = LockGuard {
                    repo: self.repo.clone(),
                    scope,
                    key,
                    owner,
                    lease_ttl: self.lease_ttl,
                    heartbeat: CancellationToken::new(),
                    released: false,
                };
                guard.spawn_heartbeat();
                Ok(guard)
            }
            Ok(Ok(LeaseOutcome::Held { owner: holder })) => {
                debug!(%key, %holder, "lock held elsewhere");
                Err(CutoverError::LockContention { scope: scope.to_string(), key, holder })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CutoverError::LockContention {
                scope: scope.to_string(),
                key,
                holder: format!("unknown (no answer within {:?})", self.acquire_timeout),
            }),
        }
    }

    pub async fn is_held(&self, scope: LockScope, name: &str) -> Result<bool> {
        self.repo.is_held(&scope.key(name), Utc::now().timestamp_millis()).await
    }
}

/// Releases on [`LockGuard::release`], or in the background when dropped
#[derive(Debug)]
pub struct LockGuard {
    repo: LockRepository,
    scope: LockScope,
    key: String,
    owner: String,
    lease_ttl: Duration,
    heartbeat: CancellationToken,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Extend the lease by a full TTL from now.
    ///
    /// Fails with `LockContention` when the lease lapsed and another owner
    /// took it.
    pub async fn renew(&self) -> Result<()> {
        if self.repo.renew(&self.key, &self.owner, expiry_after(self.lease_ttl)).await? {
            return Ok(());
        }
        let holder = self.repo.holder(&self.key).await?.unwrap_or_else(|| "nobody".to_string());
        Err(CutoverError::LockContention { scope: self.scope.to_string(), key: self.key.clone(), holder })
    }

    fn spawn_heartbeat(&self) {
        // a zero TTL lease is meant to lapse immediately
        if self.lease_ttl.is_zero() {
            return;
        }
        let period = (self.lease_ttl / 3).max(Duration::from_millis(10));
        let (repo, key, owner, ttl) =
            (self.repo.clone(), self.key.clone(), self.owner.clone(), self.lease_ttl);
        let stop = self.heartbeat.clone();

        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticks.tick() => match repo.renew(&key, &owner, expiry_after(ttl)).await {
                        Ok(true) => debug!(%key, "lease renewed"),
                        Ok(false) => {
                            warn!(%key, %owner, "lease lost before release; heartbeat stopped");
                            break;
                        }
                        Err(e) => warn!(%key, error = %e, "lease renewal failed"),
                    },
                }
            }
        });
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.heartbeat.cancel();
        self.repo.release(&self.key, &self.owner).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.heartbeat.cancel();
        if self.released {
            return;
        }
        let (repo, key, owner) = (self.repo.clone(), self.key.clone(), self.owner.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = repo.release(&key, &owner).await {
                        warn!(%key, error = %e, "failed to release dropped lock");
                    }
                });
            }
            Err(_) => warn!(key = %self.key, "lock dropped outside a runtime; lease will expire"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::TestDatabase;

    fn manager(db: &TestDatabase, ttl_secs: u64) -> LockManager {
        LockManager::new(
            LockRepository::new(db.pool.clone()),
            &LockConfig { acquire_timeout_seconds: 5, lease_ttl_seconds: ttl_secs },
        )
    }

    #[tokio::test]
    async fn test_second_acquire_is_contention() {
        let db = TestDatabase::new().await;
        let locks = manager(&db, 900);

        let guard = locks.acquire(LockScope::Environment, "production").await.unwrap();
        let err = locks.acquire(LockScope::Environment, "production").await.unwrap_err();
        assert!(matches!(err, CutoverError::LockContention { .. }));

        // other scopes and names are independent
        let rotation = locks.acquire(LockScope::TokenRotation, "production").await.unwrap();
        let staging = locks.acquire(LockScope::Environment, "staging").await.unwrap();

        guard.release().await.unwrap();
        locks.acquire(LockScope::Environment, "production").await.unwrap().release().await.unwrap();
        rotation.release().await.unwrap();
        staging.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let db = TestDatabase::new().await;
        let locks = manager(&db, 0);

        let stale = locks.acquire(LockScope::Application, "web").await.unwrap();
        std::mem::forget(stale);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let fresh = locks.acquire(LockScope::Application, "web").await.unwrap();
        assert!(fresh.key().ends_with("web"));
    }

    #[tokio::test]
    async fn test_held_lease_outlives_its_ttl() {
        let db = TestDatabase::new().await;
        let runner = manager(&db, 1);
        let other_process = manager(&db, 1);

        let guard = runner.acquire(LockScope::Application, "web").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(other_process.is_held(LockScope::Application, "web").await.unwrap());
        let err = other_process.acquire(LockScope::Application, "web").await.unwrap_err();
        assert!(matches!(err, CutoverError::LockContention { .. }));

        guard.release().await.unwrap();
        assert!(!other_process.is_held(LockScope::Application, "web").await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_after_takeover_is_contention() {
        let db = TestDatabase::new().await;
        let locks = manager(&db, 0);

        let stale = locks.acquire(LockScope::Environment, "develop").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let fresh = locks.acquire(LockScope::Environment, "develop").await.unwrap();

        assert!(fresh.renew().await.is_ok());
        let err = stale.renew().await.unwrap_err();
        assert!(matches!(err, CutoverError::LockContention { .. }));
        fresh.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_is_held() {
        let db = TestDatabase::new().await;
        let locks = manager(&db, 900);
        assert!(!locks.is_held(LockScope::Application, "web").await.unwrap());
        let guard = locks.acquire(LockScope::Application, "web").await.unwrap();
        assert!(locks.is_held(LockScope::Application, "web").await.unwrap());
        guard.release().await.unwrap();
        assert!(!locks.is_held(LockScope::Application, "web").await.unwrap());
    }
}
