//! # Storage and Persistence
//!
//! SQLite persistence for bootstrap state, token records, the snapshot index,
//! failover and audit logs, rollout plans and lock leases.

pub mod migrations;
pub mod pool;
pub mod repositories;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use crate::config::DatabaseConfig;
pub use migrations::{list_applied_migrations, run_migrations, MigrationInfo};
pub use pool::{create_pool, DbPool};
pub use repositories::{
    AuditLogRepository, BootstrapStateRepository, EnvironmentRepository, FailoverEventRepository,
    LeaseOutcome, LockRepository, RolloutPlanRepository, SnapshotRepository, TokenRepository,
};

use crate::errors::{CutoverError, Result};

/// Check database connectivity
pub async fn check_connection(pool: &DbPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(|e| CutoverError::database(e, "Database connectivity check failed"))?;
    Ok(())
}

/// Every repository over one pool
#[derive(Debug, Clone)]
pub struct Repositories {
    pub audit: AuditLogRepository,
    pub bootstrap: BootstrapStateRepository,
    pub environments: EnvironmentRepository,
    pub failovers: FailoverEventRepository,
    pub locks: LockRepository,
    pub rollouts: RolloutPlanRepository,
    pub snapshots: SnapshotRepository,
    pub tokens: TokenRepository,
}

impl Repositories {
    pub fn new(pool: DbPool) -> Self {
        Self {
            audit: AuditLogRepository::new(pool.clone()),
            bootstrap: BootstrapStateRepository::new(pool.clone()),
            environments: EnvironmentRepository::new(pool.clone()),
            failovers: FailoverEventRepository::new(pool.clone()),
            locks: LockRepository::new(pool.clone()),
            rollouts: RolloutPlanRepository::new(pool.clone()),
            snapshots: SnapshotRepository::new(pool.clone()),
            tokens: TokenRepository::new(pool),
        }
    }
}
