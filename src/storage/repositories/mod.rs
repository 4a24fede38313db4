//! Repository modules for data access
//!
//! One repository per persisted entity, each a thin `sqlx` wrapper over the
//! shared SQLite pool.

pub mod audit_log;
pub mod bootstrap_state;
pub mod environment;
pub mod failover_event;
pub mod lock;
pub mod rollout_plan;
pub mod snapshot;
pub mod token;

pub use audit_log::AuditLogRepository;
pub use bootstrap_state::BootstrapStateRepository;
pub use environment::EnvironmentRepository;
pub use failover_event::FailoverEventRepository;
pub use lock::{LeaseOutcome, LockRepository};
pub use rollout_plan::RolloutPlanRepository;
pub use snapshot::SnapshotRepository;
pub use token::TokenRepository;
