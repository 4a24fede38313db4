//! Failover Orchestrator
//!
//! Promotes a secondary secret store after the primary site degrades. The
//! steps run strictly in order and each is recorded on the environment's
//! [`FailoverEvent`]:
//!
//! 1. promote the secondary (single attempt)
//! 2. re-point the discovery record at it
//! 3. restart dependent jobs so they reconnect
//! 4. verify with a KV write/read probe and a health probe per dependent
//!
//! An exhausted step fails the event and pages the operator. A partially
//! promoted secondary is never demoted automatically.

use crate::clients::{ClusterApi, Clients, DiscoveryApi, ReplicationLink, SecretStoreApi};
use crate::config::FailoverConfig;
use crate::domain::{
    check_promotion, derive_state, AuditEntry, DegradedPrimary, FailoverEvent, FailoverState,
    FailoverStep, PromotionDecision, ReplicationMode, ReplicationStatus,
};
use crate::environment_span;
use crate::errors::{CutoverError, Result};
use crate::observability::MetricsRecorder;
use crate::secrets::SecretString;
use crate::services::backup::BackupManager;
use crate::services::health::{HealthProber, Probe};
use crate::services::locks::{LockManager, LockScope};
use crate::services::pager::{page_or_log, Alert, Pager};
use crate::services::replication::sample_link;
use crate::services::retry::RetryPolicy;
use crate::services::tokens::TokenManager;
use crate::storage::Repositories;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

/// Point-in-time failover view of one environment
#[derive(Debug, Clone, Serialize)]
pub struct FailoverReport {
    pub environment: String,
    pub state: FailoverState,
    pub replication: Option<ReplicationStatus>,
    pub latest_event: Option<FailoverEvent>,
}

#[derive(Clone)]
pub struct FailoverOrchestrator {
    repos: Repositories,
    clients: Arc<Clients>,
    tokens: TokenManager,
    backups: BackupManager,
    locks: LockManager,
    prober: HealthProber,
    pager: Arc<dyn Pager>,
    config: FailoverConfig,
    degraded: Arc<DashMap<String, DegradedPrimary>>,
    metrics: MetricsRecorder,
}

impl FailoverOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repos: Repositories,
        clients: Arc<Clients>,
        tokens: TokenManager,
        backups: BackupManager,
        locks: LockManager,
        prober: HealthProber,
        pager: Arc<dyn Pager>,
        config: FailoverConfig,
    ) -> Self {
        Self {
            repos,
            clients,
            tokens,
            backups,
            locks,
            prober,
            pager,
            config,
            degraded: Arc::new(DashMap::new()),
            metrics: MetricsRecorder::new(),
        }
    }

    fn step_policy(&self, step: FailoverStep) -> RetryPolicy {
        let initial = Duration::from_millis(self.config.step_backoff_ms);
        RetryPolicy::new(step.max_attempts(self.config.step_attempts), initial, initial.saturating_mul(8))
    }

    /// Operator-initiated promotion of the environment's secondary
    pub async fn promote(&self, environment: &str, force: bool, reason: &str) -> Result<FailoverEvent> {
        let link = self.clients.link_for(environment)?.clone();
        self.promote_link(&link, force, reason).await
    }

    async fn promote_link(&self, link: &ReplicationLink, force: bool, reason: &str) -> Result<FailoverEvent> {
        let environment = link.environment.as_str();
        let span = environment_span!("failover", environment, forced = force, link = %link.id);
        async {
            let guard = self.locks.acquire(LockScope::Environment, environment).await?;
            let result = self.run_failover(link, force, reason).await;
            guard.release().await?;
            result
        }
        .instrument(span)
        .await
    }

    async fn run_failover(&self, link: &ReplicationLink, force: bool, reason: &str) -> Result<FailoverEvent> {
        let environment = link.environment.as_str();
        if let Some(running) = self.repos.failovers.in_progress(environment).await? {
            return Err(CutoverError::FailoverInProgress {
                environment: environment.to_string(),
                event_id: running.id.to_string(),
            });
        }

        let sample = sample_link(link).await?;
        match check_promotion(sample.lag, self.config.max_safe_lag, force) {
            PromotionDecision::Allowed => {}
            PromotionDecision::Forced => {
                warn!(lag = sample.lag, threshold = self.config.max_safe_lag, "promoting above safe lag");
            }
            PromotionDecision::Blocked => {
                self.repos
                    .audit
                    .record(
                        &AuditEntry::new(environment, "failover_event", "promotion_blocked")
                            .resource(link.id.as_str())
                            .metadata(json!({
                                "lag": sample.lag,
                                "threshold": self.config.max_safe_lag,
                                "reason": reason,
                            })),
                    )
                    .await?;
                self.metrics.record_failover(environment, "blocked");
                return Err(CutoverError::ReplicationUnsafe {
                    environment: environment.to_string(),
                    lag: sample.lag,
                    threshold: self.config.max_safe_lag,
                });
            }
        }

        let root = self.tokens.root_credential(environment).await?;
        let env_clients = self.clients.environment(environment)?;
        let secondary: &dyn SecretStoreApi = link.secondary.as_ref();
        let cluster: &dyn ClusterApi = env_clients.cluster.as_ref();
        let discovery: &dyn DiscoveryApi = env_clients.discovery()?.as_ref();
        let root_ref = &root;

        let snapshot = self.backups.create_snapshot(environment, "pre-promotion").await?;
        let mut event = FailoverEvent::start(environment, reason, force, sample.lag);
        self.repos.failovers.insert(&event).await?;
        info!(event_id = %event.id, snapshot_id = %snapshot.id, lag = sample.lag, "failover initiated");
        let this = self;

        self.run_step(&mut event, FailoverStep::Promote, move |_| async move {
            secondary.promote_secondary(root_ref).await?;
            Ok::<_, CutoverError>(Some(format!("promoted {}", secondary.address())))
        })
        .await?;

        self.run_step(&mut event, FailoverStep::UpdateDiscovery, move |_| async move {
            discovery
                .upsert(&this.config.discovery_name, secondary.address(), u64::from(this.config.discovery_ttl_seconds))
                .await?;
            Ok::<_, CutoverError>(Some(format!("{} -> {}", this.config.discovery_name, secondary.address())))
        })
        .await?;

        self.run_step(&mut event, FailoverStep::RestartDependents, move |_| async move {
            let mut restarted = 0usize;
            for job in &this.config.dependents {
                for allocation in cluster.job_allocations(job).await? {
                    if allocation.is_running() {
                        cluster.restart_allocation(&allocation.id).await?;
                        restarted += 1;
                    }
                }
            }
            Ok::<_, CutoverError>(Some(format!("{restarted} allocations restarted")))
        })
        .await?;

        let env_cluster = env_clients.cluster.clone();
        self.run_step(&mut event, FailoverStep::Verify, move |_| {
            let env_cluster = env_cluster.clone();
            async move { this.verify(secondary, root_ref, env_cluster).await }
        })
        .await?;

        event.succeed();
        self.repos.failovers.update(&event).await?;
        self.degraded.remove(environment);
        self.metrics.record_failover(environment, "succeeded");
        info!(event_id = %event.id, "failed over");
        Ok(event)
    }

    async fn run_step<F, Fut>(&self, event: &mut FailoverEvent, step: FailoverStep, op: F) -> Result<()>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<String>>>,
    {
        event.mark_running(step);
        self.repos.failovers.update(event).await?;

        match self.step_policy(step).run(step.as_str(), op).await {
            Ok((detail, attempts)) => {
                event.mark_succeeded(step, attempts, detail);
                self.repos.failovers.update(event).await?;
                info!(step = step.as_str(), attempts, "failover step succeeded");
                Ok(())
            }
            Err(exhausted) => {
                let last_completed = event.last_completed_step().to_string();
                event.fail(step, exhausted.attempts, &exhausted.reason);
                self.repos.failovers.update(event).await?;
                self.metrics.record_failover(&event.environment, "failed");

                let err = CutoverError::StepExhausted {
                    step: step.as_str().to_string(),
                    attempts: exhausted.attempts,
                    last_completed,
                    reason: exhausted.reason,
                    recovery: "finish the step by hand; the secondary is not demoted automatically"
                        .to_string(),
                };
                error!(event_id = %event.id, error = %err, "failover halted");
                let alert = Alert::critical(&event.environment, format!("failover halted: {err}"))
                    .with_remediation(err.remediation());
                page_or_log(self.pager.as_ref(), &alert).await;
                Err(err)
            }
        }
    }

    async fn verify(
        &self,
        store: &dyn SecretStoreApi,
        root: &SecretString,
        cluster: Arc<dyn ClusterApi>,
    ) -> Result<Option<String>> {
        let marker = hex::encode(rand::random::<[u8; 16]>());
        let written = json!({ "probe": marker, "written_at": Utc::now().to_rfc3339() });
        store.kv_write(root, &self.config.probe_path, &written).await?;
        let read = store.kv_read(root, &self.config.probe_path).await?;
        if read.as_ref().and_then(|data| data.get("probe")) != Some(&json!(marker)) {
            return Err(CutoverError::internal("read/write probe returned a different value"));
        }

        let probes = self
            .config
            .dependents
            .iter()
            .map(|job| {
                let cluster = cluster.clone();
                let job = job.clone();
                Probe::new(job.clone(), async move {
                    Ok(cluster.job_summary(&job).await?.is_some_and(|summary| summary.is_running(1)))
                })
            })
            .collect();
        let failed: Vec<String> = self
            .prober
            .run(probes)
            .await
            .into_iter()
            .filter(|result| !result.healthy)
            .map(|result| format!("{} ({})", result.name, result.detail.unwrap_or_default()))
            .collect();
        if !failed.is_empty() {
            return Err(CutoverError::internal(format!("dependents unhealthy: {}", failed.join(", "))));
        }

        Ok(Some(format!("kv probe ok, {} dependents healthy", self.config.dependents.len())))
    }

    /// Current state derived from the latest event and a fresh replication sample
    pub async fn status(&self, environment: &str) -> Result<FailoverReport> {
        let latest_event = self.repos.failovers.latest(environment).await?;

        let replication = match self.clients.link_for(environment) {
            Ok(link) => match sample_link(link).await {
                Ok(sample) => Some(sample),
                Err(e) => {
                    warn!(environment, error = %e, "replication sample unavailable");
                    None
                }
            },
            Err(_) => None,
        };

        let degraded = self.degraded.contains_key(environment)
            || replication
                .as_ref()
                .is_some_and(|s| !s.primary_healthy && s.mode == ReplicationMode::Secondary);

        Ok(FailoverReport {
            environment: environment.to_string(),
            state: derive_state(latest_event.as_ref(), degraded),
            replication,
            latest_event,
        })
    }

    /// Consume degraded-primary signals until cancelled or the monitor goes away
    pub async fn watch(&self, mut signals: mpsc::Receiver<DegradedPrimary>, cancel: CancellationToken) -> Result<()> {
        loop {
            let signal = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                signal = signals.recv() => match signal {
                    Some(signal) => signal,
                    None => return Ok(()),
                },
            };
            self.handle_signal(signal).await;
        }
    }

    /// React to one degraded-primary signal. Failures are paged, not returned.
    pub async fn handle_signal(&self, signal: DegradedPrimary) {
        warn!(link = %signal.link_id, environment = %signal.environment, lag = signal.lag, "primary degraded");
        self.degraded.insert(signal.environment.clone(), signal.clone());

        let link = match self.clients.link(&signal.link_id) {
            Ok(link) => link.clone(),
            Err(e) => {
                error!(error = %e, "signal for unknown replication link");
                return;
            }
        };

        let reason = format!("primary degraded on link {}", signal.link_id);
        match self.promote_link(&link, false, &reason).await {
            Ok(event) => info!(event_id = %event.id, "automatic failover completed"),
            // already paged by the failing step
            Err(CutoverError::StepExhausted { .. }) => {}
            Err(e) => {
                let alert = Alert::warning(&signal.environment, format!("automatic failover did not start: {e}"))
                    .with_remediation(e.remediation());
                page_or_log(self.pager.as_ref(), &alert).await;
            }
        }
    }
}
