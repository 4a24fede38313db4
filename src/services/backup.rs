//! Backup Manager
//!
//! Snapshots capture an environment's bootstrap state, its token records
//! (still encrypted) and its recorded definition into a JSON document under
//! `<backup_dir>/<environment>/<id>.json`. A snapshot only becomes a restore
//! target once the document has been read back and its SHA-256 digest
//! matched.

use crate::config::BackupConfig;
use crate::domain::snapshot::{gc_candidates, SNAPSHOT_FORMAT_VERSION};
use crate::domain::{AuditEntry, BackupSnapshot, SnapshotContents, SnapshotId};
use crate::errors::{CutoverError, Result};
use crate::observability::MetricsRecorder;
use crate::storage::Repositories;
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    repos: Repositories,
    config: BackupConfig,
    metrics: MetricsRecorder,
}

impl BackupManager {
    pub fn new(repos: Repositories, config: BackupConfig) -> Self {
        Self { repos, config, metrics: MetricsRecorder::new() }
    }

    fn snapshot_path(&self, environment: &str, id: &SnapshotId) -> PathBuf {
        self.config.directory.join(environment).join(format!("{id}.json"))
    }

    #[instrument(skip(self), fields(snapshot_id))]
    pub async fn create_snapshot(&self, environment: &str, reason: &str) -> Result<BackupSnapshot> {
        let id = SnapshotId::new();
        tracing::Span::current().record("snapshot_id", id.as_str());

        let contents = SnapshotContents {
            format_version: SNAPSHOT_FORMAT_VERSION,
            snapshot_id: id.clone(),
            environment: environment.to_string(),
            definition: self.repos.environments.get(environment).await?,
            state: self.repos.bootstrap.get(environment).await?,
            tokens: self.repos.tokens.list(environment).await?,
            captured_at: Utc::now(),
        };

        let bytes = serde_json::to_vec_pretty(&contents)
            .map_err(|e| CutoverError::serialization(e, "Failed to encode snapshot"))?;
        let contents_digest = digest(&bytes);

        let path = self.snapshot_path(environment, &id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CutoverError::io(e, format!("Failed to create backup directory {}", parent.display()))
            })?;
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| CutoverError::io(e, format!("Failed to write snapshot {}", path.display())))?;

        let created_at = Utc::now();
        let mut snapshot = BackupSnapshot {
            id: id.clone(),
            environment: environment.to_string(),
            reason: reason.to_string(),
            path: path.display().to_string(),
            contents_digest,
            verified: false,
            created_at,
            retention_expiry: created_at + self.config.retention(),
        };
        self.repos.snapshots.insert(&snapshot).await?;

        let on_disk = read_digest(&path).await?;
        if on_disk != snapshot.contents_digest {
            warn!(expected = %snapshot.contents_digest, actual = %on_disk, "snapshot failed read-back check");
            self.metrics.record_snapshot(environment, false);
            return Err(CutoverError::NotVerified { snapshot_id: id.to_string() });
        }

        self.repos.snapshots.mark_verified(&id).await?;
        snapshot.verified = true;
        self.metrics.record_snapshot(environment, true);
        info!(tokens = contents.tokens.len(), %reason, "snapshot verified");
        Ok(snapshot)
    }

    /// Replace live state with a verified snapshot's contents
    #[instrument(skip(self), fields(snapshot_id = %snapshot_id))]
    pub async fn restore(&self, snapshot_id: &SnapshotId) -> Result<SnapshotContents> {
        let snapshot = self.repos.snapshots.get(snapshot_id).await?;
        if !snapshot.verified {
            return Err(CutoverError::NotVerified { snapshot_id: snapshot_id.to_string() });
        }

        let bytes = tokio::fs::read(&snapshot.path)
            .await
            .map_err(|e| CutoverError::io(e, format!("Failed to read snapshot {}", snapshot.path)))?;
        if digest(&bytes) != snapshot.contents_digest {
            warn!(path = %snapshot.path, "snapshot digest changed on disk");
            return Err(CutoverError::NotVerified { snapshot_id: snapshot_id.to_string() });
        }

        let contents: SnapshotContents = serde_json::from_slice(&bytes).map_err(|e| {
            CutoverError::serialization(e, format!("Invalid snapshot document {}", snapshot.path))
        })?;
        if contents.environment != snapshot.environment {
            return Err(CutoverError::validation(format!(
                "snapshot {snapshot_id} belongs to '{}', index says '{}'",
                contents.environment, snapshot.environment
            )));
        }

        self.repos
            .bootstrap
            .replace_environment_state(
                &snapshot.environment,
                contents.state.as_ref(),
                &contents.tokens,
                contents.definition.as_ref(),
            )
            .await?;

        let phase = contents.state.as_ref().map(|s| s.phase.as_str()).unwrap_or("UNINITIALIZED");
        self.repos
            .audit
            .record(
                &AuditEntry::new(&snapshot.environment, "backup_snapshot", "restore")
                    .resource(snapshot_id.as_str())
                    .metadata(json!({
                        "phase": phase,
                        "tokens": contents.tokens.len(),
                        "reason": snapshot.reason,
                    })),
            )
            .await?;

        info!(environment = %snapshot.environment, %phase, "snapshot restored");
        Ok(contents)
    }

    /// Delete expired snapshots, keeping each environment's newest verified one
    #[instrument(skip(self))]
    pub async fn gc(&self) -> Result<Vec<SnapshotId>> {
        let snapshots = self.repos.snapshots.list_all().await?;
        let doomed = gc_candidates(&snapshots, Utc::now());

        for id in &doomed {
            if let Some(snapshot) = snapshots.iter().find(|s| &s.id == id) {
                remove_file_if_present(Path::new(&snapshot.path)).await?;
            }
            self.repos.snapshots.delete(id).await?;
        }

        if !doomed.is_empty() {
            info!(deleted = doomed.len(), "expired snapshots removed");
        }
        Ok(doomed)
    }

    pub async fn list(&self, environment: &str) -> Result<Vec<BackupSnapshot>> {
        self.repos.snapshots.list(environment).await
    }

    pub async fn latest_verified(&self, environment: &str) -> Result<Option<BackupSnapshot>> {
        self.repos.snapshots.latest_verified(environment).await
    }
}

async fn read_digest(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| CutoverError::io(e, format!("Failed to read back snapshot {}", path.display())))?;
    Ok(digest(&bytes))
}

async fn remove_file_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CutoverError::io(e, format!("Failed to delete snapshot {}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BootstrapState, Phase};
    use crate::storage::test_helpers::TestDatabase;

    fn manager(db: &TestDatabase, retention_hours: u64) -> BackupManager {
        BackupManager::new(
            Repositories::new(db.pool.clone()),
            BackupConfig { directory: db.dir.path().join("backups"), retention_hours },
        )
    }

    #[tokio::test]
    async fn test_snapshot_then_restore() {
        let db = TestDatabase::new().await;
        let backups = manager(&db, 24);
        let repos = Repositories::new(db.pool.clone());

        repos.bootstrap.save(&BootstrapState::new("develop").at(Phase::Phase1Ready)).await.unwrap();
        let snapshot = backups.create_snapshot("develop", "pre-migrating").await.unwrap();
        assert!(snapshot.verified);
        assert!(Path::new(&snapshot.path).exists());

        repos.bootstrap.save(&BootstrapState::new("develop").at(Phase::Migrating)).await.unwrap();
        let contents = backups.restore(&snapshot.id).await.unwrap();

        assert_eq!(contents.state.map(|s| s.phase), Some(Phase::Phase1Ready));
        let live = repos.bootstrap.get("develop").await.unwrap().unwrap();
        assert_eq!(live.phase, Phase::Phase1Ready);
        assert_eq!(repos.audit.list("develop", 10).await.unwrap()[0].action, "restore");
    }

    #[tokio::test]
    async fn test_restore_refuses_unverified() {
        let db = TestDatabase::new().await;
        let backups = manager(&db, 24);
        let repos = Repositories::new(db.pool.clone());

        let snapshot = backups.create_snapshot("develop", "manual").await.unwrap();
        sqlx::query("UPDATE backup_snapshots SET verified = 0 WHERE id = ?")
            .bind(&snapshot.id)
            .execute(&db.pool)
            .await
            .unwrap();

        let err = backups.restore(&snapshot.id).await.unwrap_err();
        assert!(matches!(err, CutoverError::NotVerified { .. }));
        assert!(repos.audit.list("develop", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_detects_tampering() {
        let db = TestDatabase::new().await;
        let backups = manager(&db, 24);

        let snapshot = backups.create_snapshot("develop", "manual").await.unwrap();
        tokio::fs::write(&snapshot.path, b"{}").await.unwrap();

        assert!(matches!(
            backups.restore(&snapshot.id).await,
            Err(CutoverError::NotVerified { .. })
        ));
    }

    #[tokio::test]
    async fn test_gc_keeps_newest_verified() {
        let db = TestDatabase::new().await;
        let backups = manager(&db, 0);

        let older = backups.create_snapshot("develop", "first").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let newer = backups.create_snapshot("develop", "second").await.unwrap();

        let deleted = backups.gc().await.unwrap();
        assert_eq!(deleted, vec![older.id.clone()]);
        assert!(!Path::new(&older.path).exists());

        let remaining = backups.list("develop").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, newer.id);
    }
}
