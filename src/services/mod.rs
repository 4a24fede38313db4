//! Orchestration services
//!
//! Each service owns one workflow and drives the external clients through
//! the pure transition functions in `crate::domain`. Services that mutate an
//! environment or an application take the matching lease from [`locks`]
//! first.

pub mod backup;
pub mod failover;
pub mod health;
pub mod locks;
pub mod pager;
pub mod phase;
pub mod replication;
pub mod retry;
pub mod rollout;
pub mod tokens;

pub use backup::BackupManager;
pub use failover::{FailoverOrchestrator, FailoverReport};
pub use health::{HealthProber, HealthReport, OverallHealth, Probe, ProbeResult};
pub use locks::{LockGuard, LockManager, LockScope};
pub use pager::{Alert, LogPager, Pager, Severity, WebhookPager};
pub use phase::{BootstrapOptions, PhaseController};
pub use replication::{ReplicationMonitor, ReplicationView};
pub use retry::RetryPolicy;
pub use rollout::{RolloutController, RolloutRequest};
pub use tokens::TokenManager;
