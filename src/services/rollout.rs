//! Rollout Controller
//!
//! Moves an application from its baseline version to a target version with
//! one of three strategies, publishing the traffic split to the registry KV
//! store at every step:
//!
//! - **rolling**: replace instances in batches of `max_parallel`; weights
//!   follow the share of replaced instances
//! - **blue_green**: deploy the target at weight 0, wait for it to be
//!   healthy, flip to 100 and decommission the baseline
//! - **canary**: deploy a small target, hold each ramp weight for the metrics
//!   window while checking error rate and p99 latency; a breach reverts to the
//!   pre-rollout split
//!
//! The runner observes an abort request within one polling tick, either
//! in-process through a cancellation token or through the persisted
//! `abort_requested` flag.

use crate::clients::{render_query, Clients, EnvironmentClients, MetricsApi, ServiceRegistration};
use crate::config::RolloutConfig;
use crate::domain::rollout::{
    evaluate, ramp_schedule, rolling_batches, traffic_key, version_job_id, weight_for_share,
};
use crate::domain::{
    AuditEntry, JobSpec, JobStatus, MetricsSample, RolloutPlan, RolloutPlanId, RolloutStatus, Strategy,
    TrafficSplit,
};
use crate::errors::{CutoverError, Result};
use crate::observability::MetricsRecorder;
use crate::rollout_span;
use crate::services::locks::{LockManager, LockScope};
use crate::storage::Repositories;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutRequest {
    pub application: String,
    pub environment: String,
    pub strategy: Strategy,
    pub version: String,
}

/// Why a strategy stopped early
enum Interrupt {
    Abort,
    Fail(CutoverError),
}

impl From<CutoverError> for Interrupt {
    fn from(err: CutoverError) -> Self {
        Interrupt::Fail(err)
    }
}

type Step<T = ()> = std::result::Result<T, Interrupt>;

struct Run<'a> {
    clients: &'a EnvironmentClients,
    baseline: JobStatus,
    cancel: CancellationToken,
}

/// Replace the tag of a container image reference
pub fn retag(image: &str, version: &str) -> String {
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(colon) => format!("{}:{version}", &image[..name_start + colon]),
        None => format!("{image}:{version}"),
    }
}

fn registration(application: &str, version: &str) -> ServiceRegistration {
    ServiceRegistration {
        id: version_job_id(application, version),
        name: application.to_string(),
        tags: vec![format!("version={version}"), "cutover".to_string()],
        address: String::new(),
        port: 0,
        meta: BTreeMap::from([("version".to_string(), version.to_string())]),
    }
}

#[derive(Clone)]
pub struct RolloutController {
    repos: Repositories,
    clients: Arc<Clients>,
    locks: LockManager,
    config: RolloutConfig,
    poll_interval: Duration,
    running: Arc<DashMap<String, CancellationToken>>,
    metrics: MetricsRecorder,
}

impl RolloutController {
    pub fn new(repos: Repositories, clients: Arc<Clients>, locks: LockManager, config: RolloutConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_seconds.max(1)),
            repos,
            clients,
            locks,
            config,
            running: Arc::new(DashMap::new()),
            metrics: MetricsRecorder::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run a rollout to completion. Returns the final plan; an operator abort
    /// yields `Ok` with status ABORTED, a metrics breach yields
    /// `AbortThresholdBreached` after the revert.
    pub async fn start(&self, request: &RolloutRequest) -> Result<RolloutPlan> {
        let span = rollout_span!(
            request.application,
            request.strategy,
            version = %request.version,
            environment = %request.environment
        );
        async {
            let clients = self.clients.environment(&request.environment)?;
            if let Some(event) = self.repos.failovers.in_progress(&request.environment).await? {
                return Err(CutoverError::FailoverInProgress {
                    environment: request.environment.clone(),
                    event_id: event.id.to_string(),
                });
            }

            let guard = self.locks.acquire(LockScope::Application, &request.application).await?;
            let result = self.run(clients, request).await;
            guard.release().await?;
            result
        }
        .instrument(span)
        .await
    }

    /// Latest plan of `application`
    pub async fn status(&self, application: &str) -> Result<RolloutPlan> {
        self.repos
            .rollouts
            .latest_for_application(application)
            .await?
            .ok_or_else(|| CutoverError::not_found("rollout_plan", application))
    }

    /// Request an abort. Idempotent; reverts directly when no runner holds the
    /// application lock.
    pub async fn abort(&self, application: &str) -> Result<RolloutPlan> {
        let plan = self.status(application).await?;
        if plan.status.is_terminal() {
            info!(application, status = %plan.status, "rollout already finished");
            return Ok(plan);
        }

        self.repos.rollouts.request_abort(&plan.id).await?;
        if let Some(token) = self.running.get(application) {
            token.cancel();
        }

        match self.locks.acquire(LockScope::Application, application).await {
            Ok(guard) => {
                let result = self.revert_orphan(&plan.id).await;
                guard.release().await?;
                result
            }
            Err(CutoverError::LockContention { holder, .. }) => {
                info!(application, %holder, "abort requested; the running rollout will revert");
                self.repos.rollouts.get(&plan.id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn revert_orphan(&self, id: &RolloutPlanId) -> Result<RolloutPlan> {
        let mut plan = self.repos.rollouts.get(id).await?;
        if plan.status.is_terminal() {
            return Ok(plan);
        }
        let clients = self.clients.environment(&plan.environment)?;
        self.revert(clients, &mut plan, "abort requested").await?;
        Ok(plan)
    }

    async fn run(&self, clients: &EnvironmentClients, request: &RolloutRequest) -> Result<RolloutPlan> {
        let (baseline_version, baseline) = self.preflight(clients, request).await?;

        let now = Utc::now();
        let split = TrafficSplit::single(&baseline_version);
        let mut plan = RolloutPlan {
            id: RolloutPlanId::new(),
            application: request.application.clone(),
            environment: request.environment.clone(),
            strategy: request.strategy,
            target_version: request.version.clone(),
            baseline_version,
            current_weight_pct: 0,
            weights: split.clone(),
            previous_weights: split,
            metrics_window_secs: self.config.metrics_window_seconds,
            abort_error_threshold: self.config.abort_error_threshold,
            abort_latency_threshold_ms: self.config.abort_latency_threshold_ms,
            ramp_steps: self.config.ramp_steps.clone(),
            max_parallel: self.config.max_parallel.max(1),
            min_healthy_time_secs: self.config.min_healthy_time_seconds,
            status: RolloutStatus::Pending,
            abort_requested: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.repos.rollouts.insert(&plan).await?;
        self.advance(&mut plan, RolloutStatus::InProgress).await?;
        info!(plan_id = %plan.id, baseline = %plan.baseline_version, "rollout started");

        let cancel = CancellationToken::new();
        self.running.insert(plan.application.clone(), cancel.clone());
        let run = Run { clients, baseline, cancel };
        let outcome = match plan.strategy {
            Strategy::Rolling => self.rolling(&mut plan, &run).await,
            Strategy::BlueGreen => self.blue_green(&mut plan, &run).await,
            Strategy::Canary => self.canary(&mut plan, &run).await,
        };
        self.running.remove(&plan.application);

        match outcome {
            Ok(()) => {
                self.advance(&mut plan, RolloutStatus::Completed).await?;
                self.metrics.record_rollout(&plan.application, plan.strategy.as_str(), "completed");
                info!(split = %plan.weights, "rollout completed");
                Ok(plan)
            }
            Err(Interrupt::Abort) => {
                info!("abort requested; reverting");
                self.revert(clients, &mut plan, "abort requested").await?;
                Ok(plan)
            }
            Err(Interrupt::Fail(err)) => {
                warn!(error = %err, "rollout failed; reverting");
                plan.last_error = Some(err.to_string());
                self.revert(clients, &mut plan, &err.to_string()).await?;
                Err(err)
            }
        }
    }

    /// Resolve the baseline version and its job, refusing no-op rollouts
    async fn preflight(&self, clients: &EnvironmentClients, request: &RolloutRequest) -> Result<(String, JobStatus)> {
        if request.strategy == Strategy::Canary {
            clients.metrics()?;
        }

        let split = self.current_split(clients, &request.application).await?.ok_or_else(|| {
            CutoverError::validation(format!(
                "no traffic split recorded for '{}'; seed {} with the live version",
                request.application,
                traffic_key(&request.application)
            ))
        })?;
        if split.versions().count() != 1 {
            return Err(CutoverError::validation(format!(
                "'{}' is split across versions ({split}); finish or abort the previous rollout first",
                request.application
            )));
        }

        let baseline_version = split.dominant().to_string();
        if baseline_version == request.version {
            return Err(CutoverError::validation_field(
                format!("version '{}' is already live", request.version),
                "version",
            ));
        }

        let job_id = version_job_id(&request.application, &baseline_version);
        let baseline = clients
            .cluster
            .job_status(&job_id)
            .await?
            .ok_or_else(|| CutoverError::not_found("job", job_id))?;
        Ok((baseline_version, baseline))
    }

    async fn current_split(&self, clients: &EnvironmentClients, application: &str) -> Result<Option<TrafficSplit>> {
        match clients.registry.kv_get(&traffic_key(application)).await? {
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                CutoverError::serialization(e, format!("Invalid traffic split for '{application}'"))
            }),
            None => Ok(self.repos.rollouts.latest_for_application(application).await?.map(|p| p.weights)),
        }
    }

    async fn rolling(&self, plan: &mut RolloutPlan, run: &Run<'_>) -> Step {
        let cluster = &run.clients.cluster;
        let total = run.baseline.count.max(1);
        let baseline_job = run.baseline.id.clone();
        let target_job = version_job_id(&plan.application, &plan.target_version);

        cluster.submit_job(&self.target_spec(plan, run, 0)).await?;
        self.advance(plan, RolloutStatus::Monitoring).await?;
        for replaced in rolling_batches(total, plan.max_parallel) {
            self.check_abort(plan, run).await?;
            cluster.scale_job(&target_job, &target_job, replaced).await?;
            self.wait_healthy(plan, run, &target_job, replaced).await?;
            cluster.scale_job(&baseline_job, &baseline_job, total - replaced).await?;

            let weight = weight_for_share(replaced, total);
            debug!(replaced, total, weight, "batch replaced");
            if weight < 100 {
                let split = TrafficSplit::between(&plan.baseline_version, &plan.target_version, weight)?;
                self.publish(plan, run.clients, split).await?;
                self.hold(plan, run, Duration::from_secs(self.config.step_hold_seconds), false).await?;
            }
        }

        self.advance(plan, RolloutStatus::Promoting).await?;
        let split = TrafficSplit::single(&plan.target_version);
        self.publish(plan, run.clients, split).await?;
        cluster.stop_job(&baseline_job, false).await?;
        Ok(())
    }

    async fn blue_green(&self, plan: &mut RolloutPlan, run: &Run<'_>) -> Step {
        let count = run.baseline.count.max(1);
        let target_job = version_job_id(&plan.application, &plan.target_version);

        run.clients.cluster.submit_job(&self.target_spec(plan, run, count)).await?;
        run.clients.registry.register_service(&registration(&plan.application, &plan.target_version)).await?;
        let split = TrafficSplit::between(&plan.baseline_version, &plan.target_version, 0)?;
        self.publish(plan, run.clients, split).await?;

        self.advance(plan, RolloutStatus::Monitoring).await?;
        self.wait_healthy(plan, run, &target_job, count).await?;
        self.check_abort(plan, run).await?;

        self.advance(plan, RolloutStatus::Promoting).await?;
        let split = TrafficSplit::between(&plan.baseline_version, &plan.target_version, 100)?;
        self.publish(plan, run.clients, split).await?;
        self.decommission_baseline(plan, run).await?;
        Ok(())
    }

    async fn canary(&self, plan: &mut RolloutPlan, run: &Run<'_>) -> Step {
        let total = run.baseline.count.max(1);
        let canary_count = self.config.canary_count.clamp(1, total);
        let target_job = version_job_id(&plan.application, &plan.target_version);

        run.clients.cluster.submit_job(&self.target_spec(plan, run, canary_count)).await?;
        run.clients.registry.register_service(&registration(&plan.application, &plan.target_version)).await?;
        self.wait_healthy(plan, run, &target_job, canary_count).await?;

        let window = Duration::from_secs(plan.metrics_window_secs);
        for weight in ramp_schedule(self.config.canary_initial_weight, &plan.ramp_steps) {
            if weight == 100 && canary_count < total {
                run.clients.cluster.scale_job(&target_job, &target_job, total).await?;
                self.wait_healthy(plan, run, &target_job, total).await?;
            }

            let split = TrafficSplit::between(&plan.baseline_version, &plan.target_version, weight)?;
            self.publish(plan, run.clients, split).await?;
            if plan.status != RolloutStatus::Monitoring {
                self.advance(plan, RolloutStatus::Monitoring).await?;
            }
            info!(weight, window_secs = window.as_secs(), "holding canary weight");
            self.hold(plan, run, window, true).await?;
            self.advance(plan, RolloutStatus::Promoting).await?;
        }

        self.decommission_baseline(plan, run).await?;
        Ok(())
    }

    async fn decommission_baseline(&self, plan: &mut RolloutPlan, run: &Run<'_>) -> Step {
        let split = TrafficSplit::single(&plan.target_version);
        self.publish(plan, run.clients, split).await?;
        run.clients.cluster.stop_job(&run.baseline.id, false).await?;
        run.clients
            .registry
            .deregister_service(&version_job_id(&plan.application, &plan.baseline_version))
            .await?;
        Ok(())
    }

    fn target_spec(&self, plan: &RolloutPlan, run: &Run<'_>, count: u32) -> JobSpec {
        let image = match run.baseline.image.as_deref() {
            Some(image) => retag(image, &plan.target_version),
            None => format!("{}:{}", plan.application, plan.target_version),
        };
        JobSpec::new(
            version_job_id(&plan.application, &plan.target_version),
            image,
            &run.clients.environment.datacenter,
        )
        .with_count(count)
        .with_service(&plan.application)
        .with_meta("cutover.application", &plan.application)
        .with_meta("cutover.version", &plan.target_version)
    }

    async fn advance(&self, plan: &mut RolloutPlan, to: RolloutStatus) -> Result<()> {
        plan.transition(to)?;
        self.repos.rollouts.update(plan).await
    }

    async fn publish(&self, plan: &mut RolloutPlan, clients: &EnvironmentClients, split: TrafficSplit) -> Result<()> {
        let document = serde_json::to_string(&split)
            .map_err(|e| CutoverError::serialization(e, "Failed to encode traffic split"))?;
        clients.registry.kv_put(&traffic_key(&plan.application), &document).await?;

        for version in plan.weights.versions().chain(split.versions()) {
            self.metrics.set_traffic_weight(&plan.application, version, split.weight_of(version));
        }
        info!(%split, "traffic split applied");
        plan.apply_weights(split);
        self.repos.rollouts.update(plan).await
    }

    async fn check_abort(&self, plan: &RolloutPlan, run: &Run<'_>) -> Step {
        if run.cancel.is_cancelled() || self.repos.rollouts.abort_requested(&plan.id).await? {
            return Err(Interrupt::Abort);
        }
        Ok(())
    }

    /// Wait until `count` allocations of `job_id` run, then hold for `min_healthy_time`
    async fn wait_healthy(&self, plan: &RolloutPlan, run: &Run<'_>, job_id: &str, count: u32) -> Step {
        let attempts = self.config.health_attempts.max(1);
        for attempt in 1..=attempts {
            self.check_abort(plan, run).await?;
            let healthy = run
                .clients
                .cluster
                .job_summary(job_id)
                .await?
                .is_some_and(|summary| summary.is_running(count));
            if healthy {
                debug!(job_id, count, attempt, "allocations healthy");
                return self.hold(plan, run, Duration::from_secs(plan.min_healthy_time_secs), false).await;
            }
            tokio::select! {
                _ = run.cancel.cancelled() => return Err(Interrupt::Abort),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        Err(Interrupt::Fail(CutoverError::StepExhausted {
            step: format!("wait_healthy({job_id})"),
            attempts,
            last_completed: plan.status.to_string(),
            reason: format!("{count} allocations never reported running"),
            recovery: "traffic was restored to the baseline; check why the new allocations are \
                       unhealthy before retrying"
                .to_string(),
        }))
    }

    /// Poll for `duration`, watching for aborts and optionally for metric breaches
    async fn hold(&self, plan: &RolloutPlan, run: &Run<'_>, duration: Duration, watch_metrics: bool) -> Step {
        let deadline = Instant::now() + duration;
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = run.cancel.cancelled() => return Err(Interrupt::Abort),
                _ = ticker.tick() => {
                    self.check_abort(plan, run).await?;
                    if watch_metrics {
                        self.evaluate_canary(plan, run).await?;
                    }
                    if Instant::now() >= deadline {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn evaluate_canary(&self, plan: &RolloutPlan, run: &Run<'_>) -> Step {
        let metrics = run.clients.metrics()?;
        let sample = MetricsSample {
            error_rate: self.query(metrics.as_ref(), &self.config.error_rate_query, plan).await,
            latency_ms: self.query(metrics.as_ref(), &self.config.latency_query, plan).await,
        };
        debug!(?sample, "canary sample");

        match evaluate(sample, plan.abort_error_threshold, plan.abort_latency_threshold_ms) {
            Some(breach) => Err(Interrupt::Fail(CutoverError::AbortThresholdBreached {
                application: plan.application.clone(),
                metric: breach.metric.to_string(),
                observed: breach.observed,
                threshold: breach.threshold,
            })),
            None => Ok(()),
        }
    }

    async fn query(&self, metrics: &dyn MetricsApi, template: &str, plan: &RolloutPlan) -> Option<f64> {
        let expr = render_query(template, &plan.application, &plan.target_version);
        match metrics.query(&expr).await {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "metrics query failed; treating as no data");
                None
            }
        }
    }

    /// Restore the pre-rollout split and remove the target version
    async fn revert(&self, clients: &EnvironmentClients, plan: &mut RolloutPlan, reason: &str) -> Result<()> {
        if plan.status != RolloutStatus::Aborting {
            self.advance(plan, RolloutStatus::Aborting).await?;
        }

        let previous = plan.previous_weights.clone();
        self.publish(plan, clients, previous).await?;

        let target_job = version_job_id(&plan.application, &plan.target_version);
        if plan.strategy == Strategy::Rolling {
            let baseline_job = version_job_id(&plan.application, &plan.baseline_version);
            let baseline = clients.cluster.job_status(&baseline_job).await?;
            let target = clients.cluster.job_status(&target_job).await?;
            if let (Some(baseline), Some(target)) = (baseline, target) {
                clients
                    .cluster
                    .scale_job(&baseline_job, &baseline_job, baseline.count + target.count)
                    .await?;
            }
        }
        if let Err(e) = clients.cluster.stop_job(&target_job, true).await {
            warn!(job_id = %target_job, error = %e, "could not stop target job");
        }
        if let Err(e) = clients.registry.deregister_service(&target_job).await {
            warn!(service_id = %target_job, error = %e, "could not deregister target service");
        }

        self.advance(plan, RolloutStatus::Aborted).await?;
        self.repos
            .audit
            .record(
                &AuditEntry::new(&plan.environment, "rollout_plan", "abort")
                    .resource(plan.id.as_str())
                    .metadata(json!({
                        "application": plan.application,
                        "target_version": plan.target_version,
                        "restored": plan.weights.to_string(),
                        "reason": reason,
                    })),
            )
            .await?;
        self.metrics.record_rollout(&plan.application, plan.strategy.as_str(), "aborted");
        info!(split = %plan.weights, %reason, "rollout aborted");
        Ok(())
    }
}
