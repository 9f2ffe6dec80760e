//! Logging setup for Waddle processes.
//!
//! `RUST_LOG` takes precedence; otherwise the level from `[logging]` applies
//! to every target, with the Waddle crates following the same level.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// Build the filter used by [`init_logging`].
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let directives = default_directives(&config.level);
    EnvFilter::try_new(&directives).map_err(|error| TelemetryError::InvalidFilter {
        filter: directives,
        message: error.to_string(),
    })
}

/// Install the global subscriber: an env filter plus a fmt layer.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = build_filter(config)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|error| TelemetryError::AlreadyInitialized(error.to_string()))?;

    tracing::info!(level = %config.level, "logging initialized");
    Ok(())
}

fn default_directives(level: &str) -> String {
    format!("{level},waddle_core={level},waddle_xmpp={level}")
}
