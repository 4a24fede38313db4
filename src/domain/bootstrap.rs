//! Two-phase bootstrap state machine.
//!
//! The scheduler needs the secret store for its job templates, and the secret
//! store runs as a scheduler job. Bootstrap breaks the cycle by bringing the
//! cluster up without secret integration first, deploying the store onto it,
//! and only then reconfiguring the cluster to use the store.
//!
//! Everything in this module is pure: [`forward_step`] describes what the next
//! transition does and which readiness gates guard it, and [`resolve`] turns a
//! gate outcome into the next phase plus the side effects still owed. The
//! phase controller in `services::phase` performs the effects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bootstrap phase, ordered so that `>` means "further along".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Uninitialized,
    #[serde(rename = "PHASE1_RUNNING")]
    Phase1Running,
    #[serde(rename = "PHASE1_READY")]
    Phase1Ready,
    Migrating,
    #[serde(rename = "PHASE2_RUNNING")]
    Phase2Running,
    #[serde(rename = "PHASE2_READY")]
    Phase2Ready,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Uninitialized,
        Phase::Phase1Running,
        Phase::Phase1Ready,
        Phase::Migrating,
        Phase::Phase2Running,
        Phase::Phase2Ready,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Uninitialized => "UNINITIALIZED",
            Phase::Phase1Running => "PHASE1_RUNNING",
            Phase::Phase1Ready => "PHASE1_READY",
            Phase::Migrating => "MIGRATING",
            Phase::Phase2Running => "PHASE2_RUNNING",
            Phase::Phase2Ready => "PHASE2_READY",
        }
    }

    /// `*_READY` states, plus UNINITIALIZED as the base restore point
    pub fn is_ready(&self) -> bool {
        matches!(self, Phase::Uninitialized | Phase::Phase1Ready | Phase::Phase2Ready)
    }

    pub fn is_terminal(&self) -> bool {
        *self == Phase::Phase2Ready
    }

    /// Whether the cluster is configured with secret-store integration in this phase
    pub fn secret_integration_enabled(&self) -> bool {
        *self >= Phase::Phase2Running
    }

    /// Last ready state at or below this phase. Target of a failed gate.
    pub fn last_ready(&self) -> Phase {
        match self {
            Phase::Uninitialized | Phase::Phase1Running => Phase::Uninitialized,
            Phase::Phase1Ready | Phase::Migrating | Phase::Phase2Running => Phase::Phase1Ready,
            Phase::Phase2Ready => Phase::Phase2Ready,
        }
    }

    /// Last ready state strictly below this phase. Target of an explicit rollback.
    pub fn previous_ready(&self) -> Phase {
        match self {
            Phase::Uninitialized | Phase::Phase1Running | Phase::Phase1Ready => {
                Phase::Uninitialized
            }
            Phase::Migrating | Phase::Phase2Running | Phase::Phase2Ready => Phase::Phase1Ready,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown bootstrap phase '{s}'"))
    }
}

/// The single live bootstrap record of an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapState {
    pub environment: String,
    pub phase: Phase,
    pub vault_enabled: bool,
    pub updated_at: DateTime<Utc>,
}

impl BootstrapState {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            phase: Phase::Uninitialized,
            vault_enabled: false,
            updated_at: Utc::now(),
        }
    }

    /// Copy of this state moved to `phase`
    pub fn at(&self, phase: Phase) -> Self {
        Self {
            environment: self.environment.clone(),
            phase,
            vault_enabled: phase.secret_integration_enabled(),
            updated_at: Utc::now(),
        }
    }
}

/// Jobs the bootstrap submits to the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapJob {
    /// Plain container proving the scheduler can place work
    Smoke,
    /// The secret store itself
    SecretStore,
    /// Job whose template reads from the secret store
    SecretBacked,
}

impl BootstrapJob {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapJob::Smoke => "smoke",
            BootstrapJob::SecretStore => "secret_store",
            BootstrapJob::SecretBacked => "secret_backed",
        }
    }
}

/// Side effect performed by the phase controller, in list order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum Effect {
    ConfigureCluster { secret_integration: bool },
    TakeSnapshot,
    SubmitJob { job: BootstrapJob },
    MigrateRootToken,
    MintIntegrationToken,
    RestoreLatestSnapshot,
}

impl Effect {
    pub fn name(&self) -> String {
        match self {
            Effect::ConfigureCluster { secret_integration: true } => {
                "configure_cluster(integration=on)".to_string()
            }
            Effect::ConfigureCluster { secret_integration: false } => {
                "configure_cluster(integration=off)".to_string()
            }
            Effect::TakeSnapshot => "take_snapshot".to_string(),
            Effect::SubmitJob { job } => format!("submit_job({})", job.as_str()),
            Effect::MigrateRootToken => "migrate_root_token".to_string(),
            Effect::MintIntegrationToken => "mint_integration_token".to_string(),
            Effect::RestoreLatestSnapshot => "restore_latest_snapshot".to_string(),
        }
    }
}

/// Readiness predicate guarding a forward transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum Gate {
    LeaderElected,
    JobRunning { job: BootstrapJob },
    /// Store reachable, initialized and unsealed
    SecretStoreServing,
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gate::LeaderElected => f.write_str("leader_elected"),
            Gate::JobRunning { job } => write!(f, "job_running({})", job.as_str()),
            Gate::SecretStoreServing => f.write_str("secret_store_serving"),
        }
    }
}

/// One forward transition: effects to apply, then gates that must all hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardStep {
    pub from: Phase,
    pub target: Phase,
    pub effects: Vec<Effect>,
    pub gates: Vec<Gate>,
}

impl ForwardStep {
    pub fn gate_label(&self) -> String {
        self.gates.iter().map(|gate| gate.to_string()).collect::<Vec<_>>().join("+")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Ready,
    TimedOut,
}

/// Result of resolving a forward step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: Phase,
    /// Compensating effects owed before `next` is persisted
    pub effects: Vec<Effect>,
}

/// Describe the transition out of `phase`, or `None` at PHASE2_READY.
pub fn forward_step(phase: Phase) -> Option<ForwardStep> {
    let (target, effects, gates) = match phase {
        Phase::Uninitialized => (
            Phase::Phase1Running,
            vec![Effect::ConfigureCluster { secret_integration: false }],
            vec![Gate::LeaderElected],
        ),
        Phase::Phase1Running => (
            Phase::Phase1Ready,
            vec![Effect::SubmitJob { job: BootstrapJob::Smoke }],
            vec![Gate::LeaderElected, Gate::JobRunning { job: BootstrapJob::Smoke }],
        ),
        Phase::Phase1Ready => (
            Phase::Migrating,
            vec![Effect::TakeSnapshot, Effect::SubmitJob { job: BootstrapJob::SecretStore }],
            vec![Gate::JobRunning { job: BootstrapJob::SecretStore }, Gate::SecretStoreServing],
        ),
        Phase::Migrating => (
            Phase::Phase2Running,
            vec![
                Effect::TakeSnapshot,
                Effect::MigrateRootToken,
                Effect::MintIntegrationToken,
                Effect::ConfigureCluster { secret_integration: true },
            ],
            vec![Gate::LeaderElected],
        ),
        Phase::Phase2Running => (
            Phase::Phase2Ready,
            vec![Effect::SubmitJob { job: BootstrapJob::SecretBacked }],
            vec![Gate::JobRunning { job: BootstrapJob::SecretBacked }],
        ),
        Phase::Phase2Ready => return None,
    };

    Some(ForwardStep { from: phase, target, effects, gates })
}

/// Resolve a forward step once its gates have been evaluated.
///
/// A ready gate advances to the step's target. A timed-out gate moves back to
/// the last ready state at or below the step's origin, restoring the latest
/// verified snapshot and, when the step may have switched the cluster over
/// to the secret store, switching it back.
pub fn resolve(step: &ForwardStep, outcome: GateOutcome) -> Transition {
    match outcome {
        GateOutcome::Ready => Transition { next: step.target, effects: Vec::new() },
        GateOutcome::TimedOut => rollback_from(step.target, step.from.last_ready()),
    }
}

/// Compensating effects for moving from `reached` back to `target`.
///
/// `reached` is the furthest phase whose effects may have been applied.
pub fn rollback_from(reached: Phase, target: Phase) -> Transition {
    let mut effects = vec![Effect::RestoreLatestSnapshot];
    if reached.secret_integration_enabled() && !target.secret_integration_enabled() {
        effects.push(Effect::ConfigureCluster { secret_integration: false });
    }
    Transition { next: target, effects }
}

/// Ordered list of every step from `phase` to PHASE2_READY
pub fn remaining_steps(mut phase: Phase) -> Vec<ForwardStep> {
    let mut steps = Vec::new();
    while let Some(step) = forward_step(phase) {
        phase = step.target;
        steps.push(step);
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_ordering_and_parse() {
        assert!(Phase::Phase2Ready > Phase::Migrating);
        assert!(Phase::Phase1Running < Phase::Phase1Ready);
        assert_eq!("phase1_ready".parse::<Phase>().unwrap(), Phase::Phase1Ready);
        assert!("PHASE3".parse::<Phase>().is_err());
        assert_eq!(serde_json::to_string(&Phase::Phase2Running).unwrap(), "\"PHASE2_RUNNING\"");
    }

    #[test]
    fn test_full_sequence_is_forward_only() {
        let steps = remaining_steps(Phase::Uninitialized);
        assert_eq!(steps.len(), 5);
        assert_eq!(steps.last().unwrap().target, Phase::Phase2Ready);
        for step in &steps {
            assert!(step.target > step.from);
        }
        assert!(forward_step(Phase::Phase2Ready).is_none());
    }

    #[test]
    fn test_snapshots_precede_integration_changes() {
        let into_migrating = forward_step(Phase::Phase1Ready).unwrap();
        assert_eq!(into_migrating.effects[0], Effect::TakeSnapshot);

        let into_phase2 = forward_step(Phase::Migrating).unwrap();
        assert_eq!(into_phase2.effects[0], Effect::TakeSnapshot);
        assert_eq!(
            into_phase2.effects.last(),
            Some(&Effect::ConfigureCluster { secret_integration: true })
        );
    }

    #[test]
    fn test_timeout_rolls_back_to_ready_state() {
        let smoke = forward_step(Phase::Phase1Running).unwrap();
        let transition = resolve(&smoke, GateOutcome::TimedOut);
        assert_eq!(transition.next, Phase::Uninitialized);
        assert_eq!(transition.effects, vec![Effect::RestoreLatestSnapshot]);

        let into_phase2 = forward_step(Phase::Migrating).unwrap();
        let transition = resolve(&into_phase2, GateOutcome::TimedOut);
        assert_eq!(transition.next, Phase::Phase1Ready);
        assert!(transition
            .effects
            .contains(&Effect::ConfigureCluster { secret_integration: false }));
    }

    #[test]
    fn test_ready_advances_without_effects() {
        let step = forward_step(Phase::Phase2Running).unwrap();
        let transition = resolve(&step, GateOutcome::Ready);
        assert_eq!(transition.next, Phase::Phase2Ready);
        assert!(transition.effects.is_empty());
    }

    #[test]
    fn test_previous_ready_lands_on_ready_state() {
        for phase in Phase::ALL {
            let target = phase.previous_ready();
            assert!(target.is_ready());
            assert!(target <= phase);
            assert!(phase.last_ready().is_ready());
        }
        assert_eq!(Phase::Phase2Ready.previous_ready(), Phase::Phase1Ready);
    }

    #[test]
    fn test_state_tracks_integration_flag() {
        let state = BootstrapState::new("develop");
        assert!(!state.vault_enabled);
        assert!(state.at(Phase::Phase2Running).vault_enabled);
        assert!(!state.at(Phase::Phase1Ready).vault_enabled);
    }
}
