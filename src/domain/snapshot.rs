use crate::domain::{BootstrapState, Environment, SnapshotId, TokenRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Index entry of a snapshot document on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub id: SnapshotId,
    pub environment: String,
    pub reason: String,
    pub path: String,
    /// Hex SHA-256 of the document bytes
    pub contents_digest: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    pub retention_expiry: DateTime<Utc>,
}

/// The captured document. Token values stay encrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotContents {
    pub format_version: u32,
    pub snapshot_id: SnapshotId,
    pub environment: String,
    pub definition: Option<Environment>,
    pub state: Option<BootstrapState>,
    pub tokens: Vec<TokenRecord>,
    pub captured_at: DateTime<Utc>,
}

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Snapshots the garbage collector may delete at `now`.
///
/// Expired snapshots go, except the newest verified snapshot of each
/// environment, which is kept even when expired.
pub fn gc_candidates(snapshots: &[BackupSnapshot], now: DateTime<Utc>) -> Vec<SnapshotId> {
    let mut keep: HashSet<&SnapshotId> = HashSet::new();
    let mut environments: Vec<&str> = snapshots.iter().map(|s| s.environment.as_str()).collect();
    environments.sort_unstable();
    environments.dedup();

    for environment in environments {
        if let Some(newest) = snapshots
            .iter()
            .filter(|s| s.environment == environment && s.verified)
            .max_by_key(|s| s.created_at)
        {
            keep.insert(&newest.id);
        }
    }

    snapshots
        .iter()
        .filter(|s| s.retention_expiry <= now && !keep.contains(&s.id))
        .map(|s| s.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn snapshot(env: &str, age_hours: i64, verified: bool) -> BackupSnapshot {
        let created_at = Utc::now() - Duration::hours(age_hours);
        BackupSnapshot {
            id: SnapshotId::new(),
            environment: env.to_string(),
            reason: "test".to_string(),
            path: String::new(),
            contents_digest: String::new(),
            verified,
            created_at,
            retention_expiry: created_at + Duration::hours(24),
        }
    }

    #[test]
    fn test_gc_keeps_newest_verified_even_when_expired() {
        let old = snapshot("develop", 100, true);
        let newest = snapshot("develop", 50, true);
        let unverified = snapshot("develop", 30, false);
        let fresh = snapshot("develop", 1, false);

        let doomed = gc_candidates(&[old.clone(), newest.clone(), unverified.clone(), fresh], Utc::now());
        assert_eq!(doomed.len(), 2);
        assert!(doomed.contains(&old.id));
        assert!(doomed.contains(&unverified.id));
        assert!(!doomed.contains(&newest.id));
    }

    #[test]
    fn test_gc_is_per_environment() {
        let dev = snapshot("develop", 100, true);
        let prod = snapshot("production", 100, true);
        assert!(gc_candidates(&[dev, prod], Utc::now()).is_empty());
    }
}
