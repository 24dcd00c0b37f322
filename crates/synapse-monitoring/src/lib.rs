//! Logging and metrics for the Synapse engine.
//!
//! Metrics are emitted as structured `tracing` events under the
//! `synapse::metrics` target so any subscriber can route them.

use serde::{Deserialize, Serialize};
use tracing::info;

pub mod logging;
pub mod metrics;

/// Configuration for initializing the monitoring system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Service name attached to the startup event
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Log level filter (e.g., "info,synapse_core=debug"); `RUST_LOG` wins when set
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Emit JSON lines instead of pretty output
    #[serde(default)]
    pub enable_json_logging: bool,
    /// Emit metric events
    #[serde(default = "default_enable_metrics")]
    pub enable_metrics: bool,
    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_service_name() -> String {
    "synapse".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_enable_metrics() -> bool {
    true
}

fn default_environment() -> String {
    "dev".to_string()
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_filter: default_log_filter(),
            enable_json_logging: false,
            enable_metrics: default_enable_metrics(),
            environment: default_environment(),
        }
    }
}

/// Initialize logging and metrics
pub fn init(config: &MonitoringConfig) -> anyhow::Result<()> {
    logging::init_logging(config)?;
    metrics::set_enabled(config.enable_metrics);
    info!(environment = %config.environment, "Monitoring initialized");
    Ok(())
}


pub use crate::logging::{init_logging, init_test_tracing, LogExt};
pub use crate::metrics::EngineMetrics;
