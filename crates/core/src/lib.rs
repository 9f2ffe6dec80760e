use std::path::Path;

pub mod config;
pub mod error;
pub mod telemetry;

pub use config::{BytestreamConfig, Config, ConfigError, LoggingConfig};
pub use error::{Result, WaddleError};

/// Load the configuration at `path` (created with defaults if missing) and
/// install the global logging subscriber it describes.
pub fn bootstrap(path: impl AsRef<Path>) -> Result<Config> {
    let config = config::load_config_from(path)?;
    telemetry::init_logging(&config.logging)?;
    Ok(config)
}
