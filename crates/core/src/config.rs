use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub bytestream: BytestreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Tuning for in-band bytestreams (XEP-0047).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BytestreamConfig {
    /// Maximum raw payload bytes carried by one data fragment.
    #[serde(default = "default_block_size")]
    pub block_size: u16,
    /// Number of data fragments allowed in flight without a reply.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Upper bound on bytes held while the reader is blocked.
    #[serde(default = "default_read_buffer_capacity")]
    pub read_buffer_capacity: usize,
}

impl Default for BytestreamConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            window_size: default_window_size(),
            read_buffer_capacity: default_read_buffer_capacity(),
        }
    }
}

impl BytestreamConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "bytestream.block_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.window_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "bytestream.window_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    log_level: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_block_size() -> u16 {
    4096
}

fn default_window_size() -> usize {
    10
}

fn default_read_buffer_capacity() -> usize {
    512 * 1024
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const DEFAULT_CONFIG_TOML: &str = r#"[logging]
level = "info"

[bytestream]
block_size = 4096
window_size = 10
read_buffer_capacity = 524288
"#;

/// Load configuration from a specific path, merging environment variable
/// overrides. A missing file is created with the defaults.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(path.as_ref(), config_overrides_from_env())
}

/// Parse configuration from a TOML string directly.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

/// Load configuration from a path that must already exist.
pub fn load_existing_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    load_config_from(path)
}

fn load_config_from_with_overrides(
    path: &Path,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_default_config(path)?;
            DEFAULT_CONFIG_TOML.to_string()
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        log_level: std::env::var("WADDLE_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    config.bytestream.validate()
}

fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}
