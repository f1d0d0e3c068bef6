//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

use crate::config::MonitoringConfig;
use crate::error::{Error, Result};

/// Install the global fmt subscriber
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a global
/// subscriber is already installed.
pub fn init_tracing(config: &MonitoringConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| Error::Configuration(format!("Invalid log level '{}': {}", config.log_level, e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .map_err(|e| Error::Configuration(format!("Failed to install tracing subscriber: {}", e)))?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Tracing initialized");
    Ok(())
}
