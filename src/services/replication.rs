//! Replication Monitor
//!
//! Polls every replication link on a fixed interval, keeps the latest sample
//! per link and counts consecutive primary health failures. When a streak
//! reaches the threshold one [`DegradedPrimary`] is sent to the single
//! receiver, which belongs to the failover orchestrator. The monitor itself
//! never fails over.

use crate::clients::ReplicationLink;
use crate::config::ReplicationConfig;
use crate::domain::{compute_lag, DegradedPrimary, FailureCounter, ReplicationMode, ReplicationStatus};
use crate::errors::Result;
use crate::observability::MetricsRecorder;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SIGNAL_BUFFER: usize = 16;

/// Sample one link: primary health plus the secondary's WAL position
pub async fn sample_link(link: &ReplicationLink) -> Result<ReplicationStatus> {
    let primary_healthy = match link.primary.health().await {
        Ok(health) => health.is_serving(),
        Err(e) => {
            debug!(link = %link.id, error = %e, "primary health check failed");
            false
        }
    };

    let info = link.secondary.replication_status().await?;
    let last_wal = info.last_wal.unwrap_or(0);
    let last_remote_wal = info.last_remote_wal.unwrap_or(last_wal);
    let mode = if info.mode == "primary" { ReplicationMode::Primary } else { ReplicationMode::Secondary };

    Ok(ReplicationStatus {
        link_id: link.id.clone(),
        mode,
        last_wal,
        last_remote_wal,
        lag: compute_lag(last_wal, last_remote_wal),
        primary_healthy,
        sampled_at: Utc::now(),
    })
}

/// Read side of the monitor's latest samples
#[derive(Debug, Clone, Default)]
pub struct ReplicationView {
    latest: Arc<DashMap<String, ReplicationStatus>>,
}

impl ReplicationView {
    pub fn latest(&self, link_id: &str) -> Option<ReplicationStatus> {
        self.latest.get(link_id).map(|entry| entry.value().clone())
    }

    pub fn all(&self) -> Vec<ReplicationStatus> {
        let mut samples: Vec<_> = self.latest.iter().map(|entry| entry.value().clone()).collect();
        samples.sort_by(|a, b| a.link_id.cmp(&b.link_id));
        samples
    }
}

pub struct ReplicationMonitor {
    links: Vec<ReplicationLink>,
    config: ReplicationConfig,
    counters: HashMap<String, FailureCounter>,
    view: ReplicationView,
    signals: mpsc::Sender<DegradedPrimary>,
    metrics: MetricsRecorder,
}

impl ReplicationMonitor {
    /// Create the monitor and the receiving end of its degraded-primary channel
    pub fn new(links: Vec<ReplicationLink>, config: ReplicationConfig) -> (Self, mpsc::Receiver<DegradedPrimary>) {
        let (signals, receiver) = mpsc::channel(SIGNAL_BUFFER);
        let monitor = Self {
            links,
            config,
            counters: HashMap::new(),
            view: ReplicationView::default(),
            signals,
            metrics: MetricsRecorder::new(),
        };
        (monitor, receiver)
    }

    pub fn view(&self) -> ReplicationView {
        self.view.clone()
    }

    /// Sample every link once and emit any degraded-primary signals
    pub async fn poll_once(&mut self) -> Vec<ReplicationStatus> {
        let mut samples = Vec::with_capacity(self.links.len());

        for link in &self.links {
            let status = match sample_link(link).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(link = %link.id, error = %e, "secondary replication status unavailable");
                    // keep the last known WAL positions, but record the primary failure
                    let mut status = self.view.latest(&link.id).unwrap_or(ReplicationStatus {
                        link_id: link.id.clone(),
                        mode: ReplicationMode::Secondary,
                        last_wal: 0,
                        last_remote_wal: 0,
                        lag: 0,
                        primary_healthy: false,
                        sampled_at: Utc::now(),
                    });
                    status.primary_healthy = link.primary.health().await.is_ok_and(|h| h.is_serving());
                    status.sampled_at = Utc::now();
                    status
                }
            };

            self.metrics.set_replication_lag(&link.id, status.lag);
            let counter = self.counters.entry(link.id.clone()).or_default();
            if counter.record(status.primary_healthy, self.config.failure_threshold) {
                let signal = DegradedPrimary {
                    link_id: link.id.clone(),
                    environment: link.environment.clone(),
                    lag: status.lag,
                };
                warn!(
                    link = %link.id,
                    environment = %link.environment,
                    failures = counter.consecutive(),
                    lag = status.lag,
                    "primary degraded"
                );
                if self.signals.send(signal).await.is_err() {
                    warn!(link = %link.id, "no failover orchestrator is listening");
                }
            }

            self.view.latest.insert(link.id.clone(), status.clone());
            samples.push(status);
        }
        samples
    }

    /// Poll until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.poll_interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(links = self.links.len(), interval_secs = self.config.poll_interval_seconds, "replication monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("replication monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::MemorySecretStore;

    fn link() -> (ReplicationLink, Arc<MemorySecretStore>, Arc<MemorySecretStore>) {
        let primary = Arc::new(MemorySecretStore::new("http://vault-a:8200"));
        let secondary = Arc::new(MemorySecretStore::secondary("http://vault-b:8200"));
        let link = ReplicationLink {
            id: "prod-dr".into(),
            environment: "production".into(),
            primary: primary.clone(),
            secondary: secondary.clone(),
        };
        (link, primary, secondary)
    }

    fn config() -> ReplicationConfig {
        ReplicationConfig { poll_interval_seconds: 1, failure_threshold: 3 }
    }

    #[tokio::test]
    async fn test_lag_is_sampled_from_secondary() {
        let (link, _primary, secondary) = link();
        secondary.set_wal(150, 142);
        let (mut monitor, _rx) = ReplicationMonitor::new(vec![link], config());

        let samples = monitor.poll_once().await;
        assert_eq!(samples[0].lag, 8);
        assert!(samples[0].primary_healthy);
        assert_eq!(monitor.view().latest("prod-dr").map(|s| s.lag), Some(8));
    }

    #[tokio::test]
    async fn test_signals_once_per_failure_streak() {
        let (link, primary, _secondary) = link();
        let (mut monitor, mut rx) = ReplicationMonitor::new(vec![link], config());

        primary.set_reachable(false);
        for _ in 0..5 {
            monitor.poll_once().await;
        }
        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.link_id, "prod-dr");
        assert_eq!(signal.environment, "production");
        assert!(rx.try_recv().is_err());

        // a healthy sample resets the streak
        primary.set_reachable(true);
        monitor.poll_once().await;
        primary.set_reachable(false);
        for _ in 0..3 {
            monitor.poll_once().await;
        }
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_sealed_primary_counts_as_failure() {
        let (link, primary, _secondary) = link();
        let (mut monitor, mut rx) =
            ReplicationMonitor::new(vec![link], ReplicationConfig { poll_interval_seconds: 1, failure_threshold: 1 });

        primary.set_sealed(true);
        monitor.poll_once().await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let (link, primary, _secondary) = link();
        primary.set_reachable(false);
        let (monitor, mut rx) = ReplicationMonitor::new(vec![link], config());
        let view = monitor.view();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(monitor.run(cancel.clone()));
        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.link_id, "prod-dr");
        assert!(view.latest("prod-dr").is_some());

        cancel.cancel();
        handle.await.unwrap();
    }
}
