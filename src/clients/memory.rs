//! In-memory implementations of the client traits.
//!
//! Each fake keeps just enough state to behave like the real service for the
//! orchestration paths, plus knobs to inject failures and latency.

use crate::clients::{
    ClusterApi, CreatedToken, DiscoveryApi, EnvironmentClients, MetricsApi, RegistryApi,
    ReplicationInfo, SealStatus, SecretStoreApi, ServiceRegistration, StoreHealth,
    TokenCreateRequest, TokenLookup,
};
use crate::domain::{Allocation, Environment, JobSpec, JobStatus, JobSummary};
use crate::errors::{CutoverError, Result};
use crate::secrets::SecretString;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Consume one injected failure, if any remain
fn take_failure(remaining: &mut u32) -> bool {
    if *remaining > 0 {
        *remaining -= 1;
        true
    } else {
        false
    }
}

#[derive(Debug, Default)]
struct StoreState {
    reachable: bool,
    initialized: bool,
    sealed: bool,
    mode: String,
    last_wal: u64,
    last_remote_wal: u64,
    tokens: HashMap<String, Vec<String>>,
    issued: u64,
    kv: HashMap<String, serde_json::Value>,
    promoted: bool,
    promote_failures: u32,
    revoke_failures: u32,
    create_latency: Duration,
    promote_latency: Duration,
}

#[derive(Debug)]
pub struct MemorySecretStore {
    address: String,
    state: Mutex<StoreState>,
}

impl MemorySecretStore {
    /// A reachable, initialized and unsealed primary
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            state: Mutex::new(StoreState {
                reachable: true,
                initialized: true,
                mode: "primary".to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn secondary(address: &str) -> Self {
        let store = Self::new(address);
        guard(&store.state).mode = "secondary".to_string();
        store
    }

    /// Register a token the store will accept
    pub fn with_token(self, token: &str, policies: &[&str]) -> Self {
        guard(&self.state)
            .tokens
            .insert(token.to_string(), policies.iter().map(|p| p.to_string()).collect());
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        guard(&self.state).reachable = reachable;
    }

    pub fn set_sealed(&self, sealed: bool) {
        guard(&self.state).sealed = sealed;
    }

    pub fn set_initialized(&self, initialized: bool) {
        guard(&self.state).initialized = initialized;
    }

    pub fn set_wal(&self, last_wal: u64, last_remote_wal: u64) {
        let mut state = guard(&self.state);
        state.last_wal = last_wal;
        state.last_remote_wal = last_remote_wal;
    }

    pub fn fail_promotions(&self, times: u32) {
        guard(&self.state).promote_failures = times;
    }

    pub fn fail_revocations(&self, times: u32) {
        guard(&self.state).revoke_failures = times;
    }

    /// Delay every secondary promotion by `latency`
    pub fn set_promote_latency(&self, latency: Duration) {
        guard(&self.state).promote_latency = latency;
    }

    /// Delay every token creation by `latency`
    pub fn set_create_latency(&self, latency: Duration) {
        guard(&self.state).create_latency = latency;
    }

    /// Make a token unusable without going through the API
    pub fn invalidate(&self, token: &str) {
        guard(&self.state).tokens.remove(token);
    }

    pub fn accepts(&self, token: &str) -> bool {
        guard(&self.state).tokens.contains_key(token)
    }

    pub fn promoted(&self) -> bool {
        guard(&self.state).promoted
    }

    pub fn live_tokens(&self) -> usize {
        guard(&self.state).tokens.len()
    }

    pub fn kv(&self, path: &str) -> Option<serde_json::Value> {
        guard(&self.state).kv.get(path).cloned()
    }

    fn reachable(&self) -> Result<()> {
        if guard(&self.state).reachable {
            Ok(())
        } else {
            Err(CutoverError::transport("secret-store", format!("{} unreachable", self.address)))
        }
    }

    fn authorize(&self, token: &SecretString) -> Result<Vec<String>> {
        self.reachable()?;
        guard(&self.state)
            .tokens
            .get(token.expose_secret())
            .cloned()
            .ok_or_else(|| CutoverError::http("secret-store", "permission denied", 403))
    }
}

#[async_trait]
impl SecretStoreApi for MemorySecretStore {
    fn address(&self) -> &str {
        &self.address
    }

    async fn health(&self) -> Result<StoreHealth> {
        self.reachable()?;
        let state = guard(&self.state);
        Ok(StoreHealth {
            initialized: state.initialized,
            sealed: state.sealed,
            standby: false,
            replication_performance_mode: Some(state.mode.clone()),
            version: Some("memory".to_string()),
        })
    }

    async fn seal_status(&self) -> Result<SealStatus> {
        self.reachable()?;
        let state = guard(&self.state);
        Ok(SealStatus { initialized: state.initialized, sealed: state.sealed, t: 3, n: 5, progress: 0 })
    }

    async fn replication_status(&self) -> Result<ReplicationInfo> {
        self.reachable()?;
        let state = guard(&self.state);
        Ok(ReplicationInfo {
            mode: state.mode.clone(),
            last_wal: Some(state.last_wal),
            last_remote_wal: Some(state.last_remote_wal),
            state: Some("stream-wals".to_string()),
        })
    }

    async fn promote_secondary(&self, token: &SecretString) -> Result<()> {
        self.authorize(token)?;
        let latency = guard(&self.state).promote_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = guard(&self.state);
        if take_failure(&mut state.promote_failures) {
            return Err(CutoverError::http("secret-store", "promotion rejected", 500));
        }
        state.mode = "primary".to_string();
        state.promoted = true;
        Ok(())
    }

    async fn create_token(
        &self,
        token: &SecretString,
        request: &TokenCreateRequest,
    ) -> Result<CreatedToken> {
        self.authorize(token)?;
        let latency = guard(&self.state).create_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = guard(&self.state);
        state.issued += 1;
        let value = format!("s.memory-{}-{}", state.issued, uuid::Uuid::new_v4().simple());
        state.tokens.insert(value.clone(), request.policies.clone());
        Ok(CreatedToken {
            client_token: SecretString::new(value),
            accessor: format!("accessor-{}", state.issued),
            policies: request.policies.clone(),
            lease_duration: 0,
        })
    }

    async fn revoke_token(&self, token: &SecretString, target: &SecretString) -> Result<()> {
        self.authorize(token)?;
        let mut state = guard(&self.state);
        if take_failure(&mut state.revoke_failures) {
            return Err(CutoverError::http("secret-store", "revocation unavailable", 503));
        }
        state.tokens.remove(target.expose_secret());
        Ok(())
    }

    async fn lookup_self(&self, token: &SecretString) -> Result<TokenLookup> {
        let policies = self.authorize(token)?;
        Ok(TokenLookup {
            accessor: "memory".to_string(),
            policies,
            ttl: 0,
            display_name: "token".to_string(),
        })
    }

    async fn kv_write(&self, token: &SecretString, path: &str, data: &serde_json::Value) -> Result<()> {
        self.authorize(token)?;
        guard(&self.state).kv.insert(path.to_string(), data.clone());
        Ok(())
    }

    async fn kv_read(&self, token: &SecretString, path: &str) -> Result<Option<serde_json::Value>> {
        self.authorize(token)?;
        Ok(guard(&self.state).kv.get(path).cloned())
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    leader: Option<String>,
    jobs: BTreeMap<String, JobSpec>,
    stalled: HashSet<String>,
    stopped: Vec<String>,
    restarted: Vec<String>,
    restart_failures: u32,
    submit_failures: u32,
}

#[derive(Debug)]
pub struct MemoryCluster {
    address: String,
    state: Mutex<ClusterState>,
}

impl MemoryCluster {
    /// A cluster with an elected leader and no jobs
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            state: Mutex::new(ClusterState {
                leader: Some("10.0.0.1:4647".to_string()),
                ..Default::default()
            }),
        }
    }

    pub fn set_leader(&self, leader: Option<&str>) {
        guard(&self.state).leader = leader.map(str::to_string);
    }

    /// Jobs with this id are accepted but never report running
    pub fn stall_job(&self, job_id: &str) {
        guard(&self.state).stalled.insert(job_id.to_string());
    }

    pub fn fail_restarts(&self, times: u32) {
        guard(&self.state).restart_failures = times;
    }

    pub fn fail_submissions(&self, times: u32) {
        guard(&self.state).submit_failures = times;
    }

    /// Seed a running job
    pub fn insert_job(&self, spec: JobSpec) {
        guard(&self.state).jobs.insert(spec.id.clone(), spec);
    }

    pub fn job(&self, job_id: &str) -> Option<JobSpec> {
        guard(&self.state).jobs.get(job_id).cloned()
    }

    pub fn job_ids(&self) -> Vec<String> {
        guard(&self.state).jobs.keys().cloned().collect()
    }

    pub fn stopped(&self) -> Vec<String> {
        guard(&self.state).stopped.clone()
    }

    pub fn restarted(&self) -> Vec<String> {
        guard(&self.state).restarted.clone()
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    fn address(&self) -> &str {
        &self.address
    }

    async fn leader(&self) -> Result<Option<String>> {
        Ok(guard(&self.state).leader.clone())
    }

    async fn job_status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let state = guard(&self.state);
        Ok(state.jobs.get(job_id).map(|spec| JobStatus {
            id: spec.id.clone(),
            status: if state.stalled.contains(job_id) { "pending" } else { "running" }.to_string(),
            image: Some(spec.image.clone()),
            count: spec.count,
            meta: spec.meta.clone(),
        }))
    }

    async fn job_summary(&self, job_id: &str) -> Result<Option<JobSummary>> {
        let state = guard(&self.state);
        Ok(state.jobs.get(job_id).map(|spec| {
            if state.stalled.contains(job_id) {
                JobSummary { queued: spec.count, ..Default::default() }
            } else {
                JobSummary { running: spec.count, ..Default::default() }
            }
        }))
    }

    async fn submit_job(&self, spec: &JobSpec) -> Result<()> {
        let mut state = guard(&self.state);
        if take_failure(&mut state.submit_failures) {
            return Err(CutoverError::http("scheduler", "job registration failed", 500));
        }
        state.jobs.insert(spec.id.clone(), spec.clone());
        Ok(())
    }

    async fn stop_job(&self, job_id: &str, _purge: bool) -> Result<()> {
        let mut state = guard(&self.state);
        state.jobs.remove(job_id);
        state.stopped.push(job_id.to_string());
        Ok(())
    }

    async fn scale_job(&self, job_id: &str, _group: &str, count: u32) -> Result<()> {
        let mut state = guard(&self.state);
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| CutoverError::http("scheduler", format!("job '{job_id}' not found"), 404))?;
        job.count = count;
        Ok(())
    }

    async fn job_allocations(&self, job_id: &str) -> Result<Vec<Allocation>> {
        let state = guard(&self.state);
        let running = !state.stalled.contains(job_id);
        Ok(state
            .jobs
            .get(job_id)
            .map(|spec| {
                (0..spec.count)
                    .map(|i| Allocation {
                        id: format!("{job_id}-alloc-{i}"),
                        job_id: job_id.to_string(),
                        client_status: if running { "running" } else { "pending" }.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn restart_allocation(&self, allocation_id: &str) -> Result<()> {
        let mut state = guard(&self.state);
        if take_failure(&mut state.restart_failures) {
            return Err(CutoverError::transport("scheduler", "connection reset"));
        }
        state.restarted.push(allocation_id.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    kv: BTreeMap<String, String>,
    services: BTreeMap<String, ServiceRegistration>,
    unhealthy: HashSet<String>,
    /// Writes to the key that still succeed before every later write fails
    put_budget: HashMap<String, u32>,
}

#[derive(Debug)]
pub struct MemoryRegistry {
    address: String,
    state: Mutex<RegistryState>,
}

impl MemoryRegistry {
    pub fn new(address: &str) -> Self {
        Self { address: address.to_string(), state: Mutex::new(RegistryState::default()) }
    }

    pub fn set_unhealthy(&self, service: &str) {
        guard(&self.state).unhealthy.insert(service.to_string());
    }

    /// Let `successes` more writes to `key` through, then fail the rest
    pub fn fail_puts_after(&self, key: &str, successes: u32) {
        guard(&self.state).put_budget.insert(key.to_string(), successes);
    }

    pub fn value(&self, key: &str) -> Option<String> {
        guard(&self.state).kv.get(key).cloned()
    }

    pub fn service_ids(&self) -> Vec<String> {
        guard(&self.state).services.keys().cloned().collect()
    }
}

#[async_trait]
impl RegistryApi for MemoryRegistry {
    fn address(&self) -> &str {
        &self.address
    }

    async fn leader(&self) -> Result<Option<String>> {
        Ok(Some("10.0.0.1:8300".to_string()))
    }

    async fn register_service(&self, registration: &ServiceRegistration) -> Result<()> {
        guard(&self.state).services.insert(registration.id.clone(), registration.clone());
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        guard(&self.state).services.remove(service_id);
        Ok(())
    }

    async fn healthy_instances(&self, service: &str) -> Result<usize> {
        let state = guard(&self.state);
        if state.unhealthy.contains(service) {
            return Ok(0);
        }
        Ok(state.services.values().filter(|s| s.name == service).count())
    }

    async fn kv_put(&self, key: &str, value: &str) -> Result<()> {
        let mut state = guard(&self.state);
        if let Some(remaining) = state.put_budget.get_mut(key) {
            if *remaining == 0 {
                return Err(CutoverError::transport("registry", "connection reset"));
            }
            *remaining -= 1;
        }
        state.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        Ok(guard(&self.state).kv.get(key).cloned())
    }
}

/// Answers queries containing a registered substring
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    rules: Mutex<Vec<(String, f64)>>,
    unready: Mutex<bool>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any query containing `pattern` returns `value`; later rules win
    pub fn set(&self, pattern: &str, value: f64) {
        guard(&self.rules).insert(0, (pattern.to_string(), value));
    }

    pub fn set_ready(&self, ready: bool) {
        *guard(&self.unready) = !ready;
    }

    fn lookup(&self, expr: &str) -> Option<f64> {
        guard(&self.rules).iter().find(|(pattern, _)| expr.contains(pattern.as_str())).map(|(_, v)| *v)
    }
}

#[async_trait]
impl MetricsApi for MemoryMetrics {
    async fn query(&self, expr: &str) -> Result<Option<f64>> {
        Ok(self.lookup(expr))
    }

    async fn query_range(
        &self,
        expr: &str,
        _start: DateTime<Utc>,
        end: DateTime<Utc>,
        _step_secs: u64,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        Ok(self.lookup(expr).map(|v| vec![(end, v)]).unwrap_or_default())
    }

    async fn ready(&self) -> Result<bool> {
        Ok(!*guard(&self.unready))
    }
}

#[derive(Debug, Default)]
struct DiscoveryState {
    records: BTreeMap<String, (String, u64)>,
    failures: u32,
}

#[derive(Debug, Default)]
pub struct MemoryDiscovery {
    state: Mutex<DiscoveryState>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_updates(&self, times: u32) {
        guard(&self.state).failures = times;
    }

    pub fn record(&self, name: &str) -> Option<(String, u64)> {
        guard(&self.state).records.get(name).cloned()
    }
}

#[async_trait]
impl DiscoveryApi for MemoryDiscovery {
    async fn upsert(&self, name: &str, target: &str, ttl_secs: u64) -> Result<()> {
        let mut state = guard(&self.state);
        if take_failure(&mut state.failures) {
            return Err(CutoverError::http("discovery", "provider unavailable", 503));
        }
        state.records.insert(name.to_string(), (target.to_string(), ttl_secs));
        Ok(())
    }
}

/// Concrete fakes behind an [`EnvironmentClients`] bundle
#[derive(Clone)]
pub struct MemoryEnvironment {
    pub secret_store: Arc<MemorySecretStore>,
    pub cluster: Arc<MemoryCluster>,
    pub registry: Arc<MemoryRegistry>,
    pub metrics: Arc<MemoryMetrics>,
    pub discovery: Arc<MemoryDiscovery>,
}

impl MemoryEnvironment {
    pub fn new(environment: &Environment, root_token: &str) -> Self {
        Self {
            secret_store: Arc::new(
                MemorySecretStore::new(&environment.secret_store_addr).with_token(root_token, &["root"]),
            ),
            cluster: Arc::new(MemoryCluster::new(&environment.cluster_addr)),
            registry: Arc::new(MemoryRegistry::new("http://registry.memory")),
            metrics: Arc::new(MemoryMetrics::new()),
            discovery: Arc::new(MemoryDiscovery::new()),
        }
    }

    pub fn clients(&self, environment: &Environment) -> EnvironmentClients {
        EnvironmentClients {
            environment: environment.clone(),
            secret_store: self.secret_store.clone(),
            cluster: self.cluster.clone(),
            registry: self.registry.clone(),
            metrics: Some(self.metrics.clone()),
            discovery: Some(self.discovery.clone()),
        }
    }
}
