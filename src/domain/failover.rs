//! Failover state machine and its audit record.
//!
//! `HEALTHY -> DEGRADED -> FAILOVER_INITIATED -> PROMOTING -> DISCOVERY_UPDATING
//! -> RESTARTING_DEPENDENTS -> VERIFYING -> {FAILED_OVER | FAILOVER_FAILED}`
//!
//! The orchestrator never persists the state itself; it is derived from the
//! latest [`FailoverEvent`] and whether the primary is currently degraded.

use crate::domain::FailoverEventId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailoverState {
    Healthy,
    Degraded,
    FailoverInitiated,
    Promoting,
    DiscoveryUpdating,
    RestartingDependents,
    Verifying,
    FailedOver,
    FailoverFailed,
}

impl fmt::Display for FailoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailoverState::Healthy => "HEALTHY",
            FailoverState::Degraded => "DEGRADED",
            FailoverState::FailoverInitiated => "FAILOVER_INITIATED",
            FailoverState::Promoting => "PROMOTING",
            FailoverState::DiscoveryUpdating => "DISCOVERY_UPDATING",
            FailoverState::RestartingDependents => "RESTARTING_DEPENDENTS",
            FailoverState::Verifying => "VERIFYING",
            FailoverState::FailedOver => "FAILED_OVER",
            FailoverState::FailoverFailed => "FAILOVER_FAILED",
        };
        f.write_str(s)
    }
}

/// Sequential failover steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStep {
    Promote,
    UpdateDiscovery,
    RestartDependents,
    Verify,
}

impl FailoverStep {
    pub const ORDER: [FailoverStep; 4] = [
        FailoverStep::Promote,
        FailoverStep::UpdateDiscovery,
        FailoverStep::RestartDependents,
        FailoverStep::Verify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverStep::Promote => "promote",
            FailoverStep::UpdateDiscovery => "update_discovery",
            FailoverStep::RestartDependents => "restart_dependents",
            FailoverStep::Verify => "verify",
        }
    }

    /// Machine state while this step runs
    pub fn state(&self) -> FailoverState {
        match self {
            FailoverStep::Promote => FailoverState::Promoting,
            FailoverStep::UpdateDiscovery => FailoverState::DiscoveryUpdating,
            FailoverStep::RestartDependents => FailoverState::RestartingDependents,
            FailoverStep::Verify => FailoverState::Verifying,
        }
    }

    /// Attempt budget; promotion is never retried without re-validating the replica
    pub fn max_attempts(&self, retried_step_attempts: u32) -> u32 {
        match self {
            FailoverStep::Promote => 1,
            _ => retried_step_attempts.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: FailoverStep,
    pub status: StepStatus,
    pub attempts: u32,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::InProgress => "in_progress",
            EventStatus::Succeeded => "succeeded",
            EventStatus::Failed => "failed",
        }
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(EventStatus::InProgress),
            "succeeded" => Ok(EventStatus::Succeeded),
            "failed" => Ok(EventStatus::Failed),
            other => Err(format!("unknown failover status '{other}'")),
        }
    }
}

/// Append-only audit record of one failover attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub id: FailoverEventId,
    pub environment: String,
    pub trigger_reason: String,
    pub forced: bool,
    pub lag_at_start: u64,
    pub started_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
    pub status: EventStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

impl FailoverEvent {
    pub fn start(environment: &str, trigger_reason: &str, forced: bool, lag: u64) -> Self {
        let now = Utc::now();
        Self {
            id: FailoverEventId::new(),
            environment: environment.to_string(),
            trigger_reason: trigger_reason.to_string(),
            forced,
            lag_at_start: lag,
            started_at: now,
            steps: FailoverStep::ORDER
                .iter()
                .map(|name| StepRecord {
                    name: *name,
                    status: StepStatus::Pending,
                    attempts: 0,
                    detail: None,
                    timestamp: now,
                })
                .collect(),
            status: EventStatus::InProgress,
            completed_at: None,
        }
    }

    fn step_mut(&mut self, step: FailoverStep) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|record| record.name == step)
    }

    pub fn mark_running(&mut self, step: FailoverStep) {
        if let Some(record) = self.step_mut(step) {
            record.status = StepStatus::Running;
            record.timestamp = Utc::now();
        }
    }

    pub fn mark_succeeded(&mut self, step: FailoverStep, attempts: u32, detail: Option<String>) {
        if let Some(record) = self.step_mut(step) {
            record.status = StepStatus::Succeeded;
            record.attempts = attempts;
            record.detail = detail;
            record.timestamp = Utc::now();
        }
    }

    /// Fail `step` and close the event
    pub fn fail(&mut self, step: FailoverStep, attempts: u32, reason: &str) {
        if let Some(record) = self.step_mut(step) {
            record.status = StepStatus::Failed;
            record.attempts = attempts;
            record.detail = Some(reason.to_string());
            record.timestamp = Utc::now();
        }
        self.status = EventStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    pub fn succeed(&mut self) {
        self.status = EventStatus::Succeeded;
        self.completed_at = Some(Utc::now());
    }

    /// Name of the last step that succeeded, or "initiate" when none did
    pub fn last_completed_step(&self) -> &'static str {
        self.steps
            .iter()
            .rev()
            .find(|record| record.status == StepStatus::Succeeded)
            .map(|record| record.name.as_str())
            .unwrap_or("initiate")
    }

    /// Machine state this event represents
    pub fn state(&self) -> FailoverState {
        match self.status {
            EventStatus::Succeeded => FailoverState::FailedOver,
            EventStatus::Failed => FailoverState::FailoverFailed,
            EventStatus::InProgress => self
                .steps
                .iter()
                .find(|record| record.status == StepStatus::Running)
                .map(|record| record.name.state())
                .or_else(|| {
                    self.steps
                        .iter()
                        .find(|record| record.status == StepStatus::Pending)
                        .map(|record| {
                            if record.name == FailoverStep::Promote {
                                FailoverState::FailoverInitiated
                            } else {
                                record.name.state()
                            }
                        })
                })
                .unwrap_or(FailoverState::Verifying),
        }
    }
}

/// Outcome of the promotion safety check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionDecision {
    Allowed,
    /// Lag above threshold, accepted by an explicit operator override
    Forced,
    Blocked,
}

pub fn check_promotion(lag: u64, max_safe_lag: u64, force: bool) -> PromotionDecision {
    if lag <= max_safe_lag {
        PromotionDecision::Allowed
    } else if force {
        PromotionDecision::Forced
    } else {
        PromotionDecision::Blocked
    }
}

/// Current machine state from the latest event and the monitor's verdict.
///
/// An in-progress event always wins. A finished event is reported until the
/// primary is seen degraded again, which starts a new cycle.
pub fn derive_state(latest: Option<&FailoverEvent>, degraded: bool) -> FailoverState {
    match latest {
        Some(event) if event.status == EventStatus::InProgress => event.state(),
        _ if degraded => FailoverState::Degraded,
        Some(event) => event.state(),
        None => FailoverState::Healthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotion_decision() {
        assert_eq!(check_promotion(0, 10, false), PromotionDecision::Allowed);
        assert_eq!(check_promotion(10, 10, false), PromotionDecision::Allowed);
        assert_eq!(check_promotion(100, 10, false), PromotionDecision::Blocked);
        assert_eq!(check_promotion(100, 10, true), PromotionDecision::Forced);
    }

    #[test]
    fn test_event_state_follows_steps() {
        let mut event = FailoverEvent::start("production", "primary degraded", false, 0);
        assert_eq!(event.state(), FailoverState::FailoverInitiated);
        assert_eq!(event.last_completed_step(), "initiate");

        event.mark_running(FailoverStep::Promote);
        assert_eq!(event.state(), FailoverState::Promoting);

        event.mark_succeeded(FailoverStep::Promote, 1, None);
        assert_eq!(event.state(), FailoverState::DiscoveryUpdating);
        assert_eq!(event.last_completed_step(), "promote");

        event.fail(FailoverStep::UpdateDiscovery, 3, "dns unavailable");
        assert_eq!(event.state(), FailoverState::FailoverFailed);
        assert!(event.completed_at.is_some());
    }

    #[test]
    fn test_derive_state() {
        assert_eq!(derive_state(None, false), FailoverState::Healthy);
        assert_eq!(derive_state(None, true), FailoverState::Degraded);

        let mut event = FailoverEvent::start("production", "manual", false, 0);
        assert_eq!(derive_state(Some(&event), true), FailoverState::FailoverInitiated);

        event.succeed();
        assert_eq!(derive_state(Some(&event), false), FailoverState::FailedOver);
        assert_eq!(derive_state(Some(&event), true), FailoverState::Degraded);
    }

    #[test]
    fn test_promotion_is_single_attempt() {
        assert_eq!(FailoverStep::Promote.max_attempts(3), 1);
        assert_eq!(FailoverStep::UpdateDiscovery.max_attempts(3), 3);
        assert_eq!(FailoverStep::RestartDependents.max_attempts(0), 1);
    }
}
