//! # Health Prober
//!
//! Runs named probes concurrently, at most `max_concurrency` at a time, each
//! under its own timeout. Used for the `health` command and for verifying
//! dependents after a failover.

use crate::clients::EnvironmentClients;
use crate::config::HealthConfig;
use crate::errors::Result;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// One named readiness check
pub struct Probe {
    pub name: String,
    check: BoxFuture<'static, Result<bool>>,
}

impl Probe {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: std::future::Future<Output = Result<bool>> + Send + 'static,
    {
        Self { name: name.into(), check: Box::pin(check) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub name: String,
    pub healthy: bool,
    pub detail: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OverallHealth::Healthy => "healthy",
            OverallHealth::Degraded => "degraded",
            OverallHealth::Unhealthy => "unhealthy",
        })
    }
}

/// Unhealthy when at least half the probes fail, degraded when any do.
pub fn overall(results: &[ProbeResult]) -> OverallHealth {
    let failed = results.iter().filter(|r| !r.healthy).count();
    if failed == 0 {
        OverallHealth::Healthy
    } else if failed * 2 >= results.len() {
        OverallHealth::Unhealthy
    } else {
        OverallHealth::Degraded
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub environment: String,
    pub status: OverallHealth,
    pub probes: Vec<ProbeResult>,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthProber {
    max_concurrency: usize,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            timeout: Duration::from_secs(config.probe_timeout_seconds),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run every probe; results come back sorted by name
    pub async fn run(&self, probes: Vec<Probe>) -> Vec<ProbeResult> {
        let timeout = self.timeout;
        let mut results: Vec<ProbeResult> = stream::iter(probes)
            .map(|probe| async move {
                let started = Instant::now();
                let outcome = tokio::time::timeout(timeout, probe.check).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let (healthy, detail) = match outcome {
                    Ok(Ok(true)) => (true, None),
                    Ok(Ok(false)) => (false, Some("not ready".to_string())),
                    Ok(Err(e)) => (false, Some(e.to_string())),
                    Err(_) => (false, Some(format!("timed out after {}s", timeout.as_secs()))),
                };
                debug!(probe = %probe.name, healthy, elapsed_ms, "probe finished");
                ProbeResult { name: probe.name, healthy, detail, elapsed_ms }
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;
        results.sort_by(|a, b| a.name.cmp(&b.name));
        results
    }

    /// Probe an environment's secret store, scheduler, registry and metrics backend
    pub async fn environment_report(&self, clients: &EnvironmentClients) -> HealthReport {
        let store = clients.secret_store.clone();
        let cluster = clients.cluster.clone();
        let registry = clients.registry.clone();

        let mut probes = vec![
            Probe::new("secret_store", async move { Ok(store.health().await?.is_serving()) }),
            Probe::new("scheduler", async move { Ok(cluster.leader().await?.is_some()) }),
            Probe::new("registry", async move { Ok(registry.leader().await?.is_some()) }),
        ];
        if let Some(metrics) = clients.metrics.clone() {
            probes.push(Probe::new("metrics", async move { metrics.ready().await }));
        }

        let results = self.run(probes).await;
        HealthReport {
            environment: clients.environment.name.clone(),
            status: overall(&results),
            probes: results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::MemoryEnvironment;
    use crate::domain::Environment;
    use crate::errors::CutoverError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn result(name: &str, healthy: bool) -> ProbeResult {
        ProbeResult { name: name.into(), healthy, detail: None, elapsed_ms: 0 }
    }

    #[test]
    fn test_overall_thresholds() {
        assert_eq!(overall(&[result("a", true), result("b", true)]), OverallHealth::Healthy);
        assert_eq!(
            overall(&[result("a", true), result("b", true), result("c", false)]),
            OverallHealth::Degraded
        );
        assert_eq!(overall(&[result("a", true), result("b", false)]), OverallHealth::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_times_out() {
        let prober = HealthProber::new(&HealthConfig::default()).with_timeout(Duration::from_secs(1));
        let results = prober
            .run(vec![
                Probe::new("fast", async { Ok(true) }),
                Probe::new("slow", async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(true)
                }),
                Probe::new("broken", async { Err(CutoverError::transport("registry", "refused")) }),
            ])
            .await;

        let names: Vec<_> = results.iter().map(|r| (r.name.as_str(), r.healthy)).collect();
        assert_eq!(names, vec![("broken", false), ("fast", true), ("slow", false)]);
        assert!(results[2].detail.as_deref().unwrap_or_default().contains("timed out"));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let prober = HealthProber::new(&HealthConfig { max_concurrency: 2, probe_timeout_seconds: 5 });
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let probes = (0..6)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                Probe::new(format!("probe-{i}"), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(true)
                })
            })
            .collect();

        let results = prober.run(probes).await;
        assert_eq!(results.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_environment_report() {
        let environment = Environment {
            name: "develop".into(),
            region: "eu-west-1".into(),
            datacenter: "dc1".into(),
            secret_store_addr: "http://vault.memory:8200".into(),
            cluster_addr: "http://nomad.memory:4646".into(),
        };
        let fakes = MemoryEnvironment::new(&environment, "s.root");
        let prober = HealthProber::new(&HealthConfig::default());

        let report = prober.environment_report(&fakes.clients(&environment)).await;
        assert_eq!(report.status, OverallHealth::Healthy);
        assert_eq!(report.probes.len(), 4);

        fakes.secret_store.set_reachable(false);
        let report = prober.environment_report(&fakes.clients(&environment)).await;
        assert_eq!(report.status, OverallHealth::Degraded);
    }
}
