//! # Metrics Collection
//!
//! Counters and gauges for the orchestration state machines, recorded through
//! the `metrics` facade. Without an installed exporter every call is a no-op.

use crate::config::ObservabilityConfig;
use crate::errors::{CutoverError, Result};
use ::tracing::info;
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Metrics recorder for orchestration events
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    pub fn new() -> Self {
        Self
    }

    pub fn record_phase_transition(&self, environment: &str, phase: &str) {
        let labels = [("environment", environment.to_string()), ("phase", phase.to_string())];
        counter!("cutover_phase_transitions_total", &labels).increment(1);
    }

    pub fn record_rollback(&self, environment: &str) {
        counter!("cutover_rollbacks_total", "environment" => environment.to_string()).increment(1);
    }

    pub fn record_token_operation(&self, environment: &str, kind: &str, operation: &str) {
        let labels = [
            ("environment", environment.to_string()),
            ("kind", kind.to_string()),
            ("operation", operation.to_string()),
        ];
        counter!("cutover_token_operations_total", &labels).increment(1);
    }

    pub fn record_snapshot(&self, environment: &str, verified: bool) {
        let status = if verified { "verified" } else { "unverified" };
        let labels = [("environment", environment.to_string()), ("status", status.to_string())];
        counter!("cutover_snapshots_total", &labels).increment(1);
    }

    pub fn set_replication_lag(&self, link_id: &str, lag: u64) {
        gauge!("cutover_replication_lag", "link" => link_id.to_string()).set(lag as f64);
    }

    pub fn record_failover(&self, environment: &str, outcome: &str) {
        let labels = [("environment", environment.to_string()), ("outcome", outcome.to_string())];
        counter!("cutover_failovers_total", &labels).increment(1);
    }

    pub fn record_rollout(&self, application: &str, strategy: &str, outcome: &str) {
        let labels = [
            ("application", application.to_string()),
            ("strategy", strategy.to_string()),
            ("outcome", outcome.to_string()),
        ];
        counter!("cutover_rollouts_total", &labels).increment(1);
    }

    pub fn set_traffic_weight(&self, application: &str, version: &str, weight: u8) {
        let labels = [("application", application.to_string()), ("version", version.to_string())];
        gauge!("cutover_traffic_weight_percent", &labels).set(f64::from(weight));
    }

    fn describe(&self) {
        describe_counter!("cutover_phase_transitions_total", "Bootstrap phase transitions");
        describe_counter!("cutover_rollbacks_total", "Automatic and explicit bootstrap rollbacks");
        describe_counter!("cutover_token_operations_total", "Token migrate/rotate/revoke operations");
        describe_counter!("cutover_snapshots_total", "Backup snapshots taken");
        describe_gauge!("cutover_replication_lag", Unit::Count, "WAL entries the secondary is behind");
        describe_counter!("cutover_failovers_total", "Failover attempts by outcome");
        describe_counter!("cutover_rollouts_total", "Rollouts by strategy and outcome");
        describe_gauge!("cutover_traffic_weight_percent", Unit::Percent, "Traffic weight per version");
    }
}

/// Install the Prometheus listener when `metrics_port` is set
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let Some(metrics_addr) = config.metrics_bind_address() else {
        return Ok(());
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        CutoverError::config(format!("Invalid metrics bind address '{metrics_addr}': {e}"))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| CutoverError::config(format!("Failed to initialize metrics exporter: {e}")))?;

    MetricsRecorder::new().describe();
    info!(%metrics_addr, "metrics exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_exporter_is_noop() {
        let recorder = MetricsRecorder::new();
        recorder.record_phase_transition("develop", "PHASE1_RUNNING");
        recorder.set_replication_lag("link-a", 7);
        recorder.set_traffic_weight("web", "v2", 10);
    }

    #[test]
    fn test_disabled_when_port_is_zero() {
        let config = ObservabilityConfig { metrics_port: 0, ..Default::default() };
        assert!(init_metrics(&config).is_ok());
    }
}
