//! Replication lag and primary-degradation detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    Primary,
    Secondary,
}

/// One polled sample of a replication link. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub link_id: String,
    pub mode: ReplicationMode,
    pub last_wal: u64,
    pub last_remote_wal: u64,
    pub lag: u64,
    /// Whether the primary answered its health check in this sample
    pub primary_healthy: bool,
    pub sampled_at: DateTime<Utc>,
}

/// WAL distance between primary and replica, clamped at zero
pub fn compute_lag(last_wal: u64, last_remote_wal: u64) -> u64 {
    last_wal.saturating_sub(last_remote_wal)
}

/// Signal sent to the failover orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedPrimary {
    pub link_id: String,
    pub environment: String,
    pub lag: u64,
}

/// Consecutive primary health failures of one link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureCounter {
    consecutive: u32,
}

impl FailureCounter {
    /// Record one health sample. Returns true exactly once per failure streak:
    /// on the sample that brings the streak to `threshold`.
    pub fn record(&mut self, healthy: bool, threshold: u32) -> bool {
        if healthy {
            self.consecutive = 0;
            return false;
        }
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive == threshold
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}
