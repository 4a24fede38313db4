//! # Observability Infrastructure
//!
//! Structured logging through `tracing` and orchestration metrics through the
//! `metrics` facade, with an optional Prometheus listener for long-running
//! commands such as `failover watch`.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, log_config_info};
pub use metrics::{init_metrics, MetricsRecorder};

use crate::config::ObservabilityConfig;
use crate::errors::Result;

/// Initialize logging, then metrics
pub fn init_observability(config: &ObservabilityConfig, verbose: bool) -> Result<()> {
    init_logging(config, verbose)?;
    init_metrics(config)?;

    ::tracing::debug!(
        service_name = %config.service_name,
        log_level = %config.log_level,
        metrics_port = config.metrics_port,
        "observability initialized"
    );
    Ok(())
}
