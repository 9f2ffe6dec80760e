use thiserror::Error;

/// The universal error type for the Waddle application.
#[derive(Error, Debug)]
pub enum WaddleError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Logging setup error: {0}")]
    Telemetry(#[from] crate::telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for Waddle operations.
pub type Result<T> = std::result::Result<T, WaddleError>;
