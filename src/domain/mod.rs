//! Domain layer
//!
//! Entities and the pure transition functions of the three state machines
//! (bootstrap phases, failover, rollout). Nothing here performs I/O; the
//! services in `crate::services` apply the side effects these functions
//! describe.
//!
//! ## Module Organization
//!
//! - `id`: Type-safe identifiers with the NewType pattern
//! - `environment`: Deployment target definition
//! - `bootstrap`: Phase machine, effects and readiness gates
//! - `token`: Managed credential records
//! - `snapshot`: Backup snapshot index and document
//! - `replication`: Lag computation and degradation detection
//! - `failover`: Failover machine and audit event
//! - `rollout`: Rollout plans and the traffic-split invariant
//! - `job`: Scheduler job shapes
//! - `audit`: Audit log entries

pub mod audit;
pub mod bootstrap;
pub mod environment;
pub mod failover;
pub mod id;
pub mod job;
pub mod replication;
pub mod rollout;
pub mod snapshot;
pub mod token;

pub use audit::AuditEntry;
pub use bootstrap::{
    forward_step, resolve, BootstrapJob, BootstrapState, Effect, ForwardStep, Gate, GateOutcome,
    Phase, Transition,
};
pub use environment::Environment;
pub use failover::{
    check_promotion, derive_state, EventStatus, FailoverEvent, FailoverState, FailoverStep,
    PromotionDecision, StepRecord, StepStatus,
};
pub use id::{AuditEntryId, FailoverEventId, RolloutPlanId, SnapshotId, TokenId};
pub use job::{Allocation, JobSpec, JobStatus, JobSummary, SecretTemplate};
pub use replication::{compute_lag, DegradedPrimary, FailureCounter, ReplicationMode, ReplicationStatus};
pub use rollout::{
    MetricsSample, RolloutPlan, RolloutStatus, Strategy, TrafficSplit,
};
pub use snapshot::{BackupSnapshot, SnapshotContents};
pub use token::{TokenKind, TokenRecord, TokenStatus, TokenSummary};
