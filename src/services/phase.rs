//! Phase Controller
//!
//! Drives an environment through the two-phase bootstrap described by
//! [`crate::domain::bootstrap`]. Each step applies its effects, then polls its
//! readiness gates with backoff. An exhausted gate or a failed effect rolls
//! the environment back to its last ready phase and surfaces
//! [`CutoverError::ReadinessTimeout`].

use crate::clients::{Clients, EnvironmentClients};
use crate::config::BootstrapConfig;
use crate::domain::bootstrap::rollback_from;
use crate::domain::{
    forward_step, resolve, AuditEntry, BootstrapJob, BootstrapState, Effect, ForwardStep, Gate,
    GateOutcome, JobSpec, Phase, SecretTemplate, TokenKind, Transition,
};
use crate::environment_span;
use crate::errors::{CutoverError, Result};
use crate::observability::MetricsRecorder;
use crate::secrets::SecretString;
use crate::services::backup::BackupManager;
use crate::services::locks::{LockManager, LockScope};
use crate::services::retry::RetryPolicy;
use crate::services::tokens::TokenManager;
use crate::storage::Repositories;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Instrument};

/// Registry KV key the scheduler agents render their secret-store stanza from
pub fn integration_key(environment: &str) -> String {
    format!("cutover/{environment}/cluster/secret-integration")
}

/// Per-invocation bootstrap inputs
#[derive(Debug, Clone, Default)]
pub struct BootstrapOptions {
    /// Ambient token handed to the token manager during migration
    pub bootstrap_token: Option<SecretString>,
    /// Accept a configured definition that differs from the recorded one
    pub migrate_environment: bool,
}

#[derive(Clone)]
pub struct PhaseController {
    repos: Repositories,
    clients: Arc<Clients>,
    tokens: TokenManager,
    backups: BackupManager,
    locks: LockManager,
    config: BootstrapConfig,
    gate_retry: RetryPolicy,
    metrics: MetricsRecorder,
}

struct StepFailure {
    gate: String,
    attempts: u32,
    last_completed: String,
    reason: String,
}

impl PhaseController {
    pub fn new(
        repos: Repositories,
        clients: Arc<Clients>,
        tokens: TokenManager,
        backups: BackupManager,
        locks: LockManager,
        config: BootstrapConfig,
    ) -> Self {
        let gate_retry = RetryPolicy::new(
            config.gate_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        );
        Self {
            repos,
            clients,
            tokens,
            backups,
            locks,
            config,
            gate_retry,
            metrics: MetricsRecorder::new(),
        }
    }

    pub async fn state(&self, environment: &str) -> Result<Option<BootstrapState>> {
        self.repos.bootstrap.get(environment).await
    }

    /// Advance `environment` to PHASE2_READY, resuming from its persisted phase.
    pub async fn bootstrap(&self, environment: &str, options: BootstrapOptions) -> Result<Phase> {
        let span = environment_span!("bootstrap", environment);
        async {
            let env_clients = self.clients.environment(environment)?;
            let guard = self.locks.acquire(LockScope::Environment, environment).await?;
            let result = self.run_bootstrap(&env_clients, &options).await;
            guard.release().await?;
            result
        }
        .instrument(span)
        .await
    }

    async fn run_bootstrap(&self, clients: &EnvironmentClients, options: &BootstrapOptions) -> Result<Phase> {
        let environment = clients.environment.name.as_str();
        self.record_definition(clients, options.migrate_environment).await?;

        let mut state = self
            .repos
            .bootstrap
            .get(environment)
            .await?
            .unwrap_or_else(|| BootstrapState::new(environment));
        if state.phase.is_terminal() {
            info!("environment already at PHASE2_READY");
            return Ok(state.phase);
        }

        while let Some(step) = forward_step(state.phase) {
            info!(from = %step.from, target = %step.target, gates = %step.gate_label(), "advancing");

            match self.execute_step(clients, &step, options).await {
                Ok(()) => {
                    let Transition { next, .. } = resolve(&step, GateOutcome::Ready);
                    state = state.at(next);
                    self.repos.bootstrap.save(&state).await?;
                    self.metrics.record_phase_transition(environment, next.as_str());
                    info!(phase = %next, "phase reached");
                }
                Err(failure) => {
                    let transition = resolve(&step, GateOutcome::TimedOut);
                    warn!(
                        gate = %failure.gate,
                        attempts = failure.attempts,
                        reason = %failure.reason,
                        rollback_to = %transition.next,
                        "step failed; rolling back"
                    );
                    let unapplied = self.compensate(clients, &transition, "readiness timeout").await?;
                    let mut reason = failure.reason;
                    if !unapplied.is_empty() {
                        reason = format!("{reason}; rollback incomplete: {}", unapplied.join("; "));
                    }
                    return Err(CutoverError::ReadinessTimeout {
                        gate: failure.gate,
                        attempts: failure.attempts,
                        last_completed: failure.last_completed,
                        rolled_back_to: transition.next.to_string(),
                        reason,
                    });
                }
            }
        }

        Ok(state.phase)
    }

    /// Explicit rollback to the ready phase before the current one.
    pub async fn rollback(&self, environment: &str) -> Result<Phase> {
        let span = environment_span!("rollback", environment);
        async {
            let env_clients = self.clients.environment(environment)?;
            let guard = self.locks.acquire(LockScope::Environment, environment).await?;
            let result = self.run_rollback(&env_clients).await;
            guard.release().await?;
            result
        }
        .instrument(span)
        .await
    }

    async fn run_rollback(&self, clients: &EnvironmentClients) -> Result<Phase> {
        let environment = clients.environment.name.as_str();
        let Some(state) = self.repos.bootstrap.get(environment).await? else {
            info!("nothing to roll back");
            return Ok(Phase::Uninitialized);
        };
        if state.phase == Phase::Uninitialized {
            return Ok(Phase::Uninitialized);
        }

        let transition = rollback_from(state.phase, state.phase.previous_ready());
        let unapplied = self.compensate(clients, &transition, "explicit rollback").await?;
        if !unapplied.is_empty() {
            return Err(CutoverError::StepExhausted {
                step: "rollback".to_string(),
                attempts: 1,
                last_completed: transition.next.to_string(),
                reason: unapplied.join("; "),
                recovery: format!(
                    "state is {}; apply the listed effects by hand before bootstrapping again",
                    transition.next
                ),
            });
        }
        info!(from = %state.phase, to = %transition.next, "rolled back");
        Ok(transition.next)
    }

    /// Apply compensating effects, then persist the rollback target.
    ///
    /// The target phase is written even when an effect fails; the failed
    /// effects are returned as `name: error` for the caller to report.
    async fn compensate(
        &self,
        clients: &EnvironmentClients,
        transition: &Transition,
        reason: &str,
    ) -> Result<Vec<String>> {
        let environment = clients.environment.name.as_str();
        let mut restored = None;
        let mut unapplied = Vec::new();
        for effect in &transition.effects {
            let applied = match effect {
                Effect::RestoreLatestSnapshot => {
                    self.restore_latest(environment).await.map(|id| restored = id)
                }
                other => self.apply_effect(clients, other, &BootstrapOptions::default()).await,
            };
            if let Err(e) = applied {
                error!(effect = %effect.name(), error = %e, "compensating effect failed");
                unapplied.push(format!("{}: {e}", effect.name()));
            }
        }

        let state = BootstrapState::new(environment).at(transition.next);
        self.repos.bootstrap.save(&state).await?;
        self.repos
            .audit
            .record(
                &AuditEntry::new(environment, "bootstrap_state", "rollback")
                    .resource(environment)
                    .metadata(json!({
                        "phase": transition.next.as_str(),
                        "reason": reason,
                        "snapshot_id": restored,
                        "unapplied": unapplied,
                    })),
            )
            .await?;
        self.metrics.record_rollback(environment);
        self.metrics.record_phase_transition(environment, transition.next.as_str());
        Ok(unapplied)
    }

    async fn restore_latest(&self, environment: &str) -> Result<Option<String>> {
        match self.backups.latest_verified(environment).await? {
            Some(snapshot) => {
                self.backups.restore(&snapshot.id).await?;
                Ok(Some(snapshot.id.to_string()))
            }
            None => {
                info!("no verified snapshot to restore");
                Ok(None)
            }
        }
    }

    async fn record_definition(&self, clients: &EnvironmentClients, migrate: bool) -> Result<()> {
        let configured = &clients.environment;
        if let Some(recorded) = self.repos.environments.get(&configured.name).await? {
            let drift = recorded.drift_from(configured);
            if drift.is_empty() {
                return Ok(());
            }
            if !migrate {
                return Err(CutoverError::conflict(
                    format!(
                        "environment '{}' differs from its recorded definition in {}; \
                         rerun with --migrate-environment to accept",
                        configured.name,
                        drift.join(", ")
                    ),
                    "environment",
                ));
            }
            warn!(fields = ?drift, "migrating recorded environment definition");
        }
        self.repos.environments.upsert(configured).await
    }

    async fn execute_step(
        &self,
        clients: &EnvironmentClients,
        step: &ForwardStep,
        options: &BootstrapOptions,
    ) -> std::result::Result<(), StepFailure> {
        let mut last_completed = step.from.as_str().to_string();

        for effect in &step.effects {
            if let Err(e) = self.apply_effect(clients, effect, options).await {
                return Err(StepFailure {
                    gate: effect.name(),
                    attempts: 1,
                    last_completed,
                    reason: e.to_string(),
                });
            }
            last_completed = effect.name();
        }

        for gate in &step.gates {
            let polled = self
                .gate_retry
                .poll_until(&gate.to_string(), || self.gate_ready(clients, *gate))
                .await;
            if let Err(exhausted) = polled {
                return Err(StepFailure {
                    gate: gate.to_string(),
                    attempts: exhausted.attempts,
                    last_completed,
                    reason: exhausted.reason,
                });
            }
            last_completed = gate.to_string();
        }
        Ok(())
    }

    async fn apply_effect(
        &self,
        clients: &EnvironmentClients,
        effect: &Effect,
        options: &BootstrapOptions,
    ) -> Result<()> {
        let environment = clients.environment.name.as_str();
        match effect {
            Effect::ConfigureCluster { secret_integration } => {
                self.configure_cluster(clients, *secret_integration).await
            }
            Effect::TakeSnapshot => {
                let reason = match self.repos.bootstrap.get(environment).await? {
                    Some(state) => format!("pre-transition from {}", state.phase),
                    None => "pre-transition".to_string(),
                };
                self.backups.create_snapshot(environment, &reason).await.map(|_| ())
            }
            Effect::SubmitJob { job } => {
                if *job == BootstrapJob::SecretBacked {
                    self.seed_probe_secret(environment).await?;
                }
                clients.cluster.submit_job(&self.job_spec(*job, &clients.environment.datacenter)).await
            }
            Effect::MigrateRootToken => {
                if self.repos.tokens.active(environment, TokenKind::Root).await?.is_some() {
                    return Ok(());
                }
                let token = options.bootstrap_token.clone().ok_or_else(|| {
                    CutoverError::validation(
                        "no bootstrap token available; set CUTOVER_BOOTSTRAP_TOKEN or VAULT_TOKEN",
                    )
                })?;
                self.tokens.migrate(token, environment).await.map(|_| ())
            }
            Effect::MintIntegrationToken => {
                if self.repos.tokens.active(environment, TokenKind::Service).await?.is_some() {
                    return Ok(());
                }
                self.tokens
                    .mint_service_token(
                        environment,
                        &self.config.integration_policies,
                        Some(&self.config.integration_token_ttl),
                    )
                    .await
                    .map(|_| ())
            }
            Effect::RestoreLatestSnapshot => self.restore_latest(environment).await.map(|_| ()),
        }
    }

    async fn configure_cluster(&self, clients: &EnvironmentClients, enabled: bool) -> Result<()> {
        let environment = clients.environment.name.as_str();
        let mut document = json!({
            "enabled": enabled,
            "address": clients.environment.secret_store_addr,
            "updated_at": Utc::now().to_rfc3339(),
        });
        if enabled {
            let integration = self
                .repos
                .tokens
                .active(environment, TokenKind::Service)
                .await?
                .ok_or_else(|| CutoverError::validation("no active integration token to configure"))?;
            let token = self.tokens.reveal(&integration.id).await?;
            document["token"] = json!(token.expose_secret());
        }

        clients.registry.kv_put(&integration_key(environment), &document.to_string()).await?;
        info!(secret_integration = enabled, "cluster integration configured");
        Ok(())
    }

    async fn seed_probe_secret(&self, environment: &str) -> Result<()> {
        let root = self.tokens.root_credential(environment).await?;
        let store = self.clients.environment(environment)?.secret_store.clone();
        store
            .kv_write(&root, &self.config.secret_backed_path, &json!({ "seeded_at": Utc::now().to_rfc3339() }))
            .await
    }

    fn job_id(&self, job: BootstrapJob) -> &str {
        match job {
            BootstrapJob::Smoke => &self.config.smoke_job_id,
            BootstrapJob::SecretStore => &self.config.secret_store_job_id,
            BootstrapJob::SecretBacked => &self.config.secret_backed_job_id,
        }
    }

    fn job_spec(&self, job: BootstrapJob, datacenter: &str) -> JobSpec {
        let spec = match job {
            BootstrapJob::Smoke => JobSpec::new(self.job_id(job), &self.config.smoke_image, datacenter),
            BootstrapJob::SecretStore => {
                JobSpec::new(self.job_id(job), &self.config.secret_store_image, datacenter)
                    .with_service(self.job_id(job))
            }
            BootstrapJob::SecretBacked => {
                JobSpec::new(self.job_id(job), &self.config.secret_backed_image, datacenter).with_template(
                    SecretTemplate {
                        path: self.config.secret_backed_path.clone(),
                        destination: "secrets/probe.json".to_string(),
                    },
                )
            }
        };
        spec.with_meta("cutover.job", job.as_str())
    }

    async fn gate_ready(&self, clients: &EnvironmentClients, gate: Gate) -> Result<bool> {
        match gate {
            Gate::LeaderElected => Ok(clients.cluster.leader().await?.is_some()),
            Gate::JobRunning { job } => Ok(clients
                .cluster
                .job_summary(self.job_id(job))
                .await?
                .is_some_and(|summary| summary.is_running(1))),
            Gate::SecretStoreServing => Ok(clients.secret_store.health().await?.is_serving()),
        }
    }
}
