//! Configuration management for replaykit
//!
//! Handles loading and validation of replaykit.toml configuration files.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::LogConfig;

/// File looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "replaykit.toml";

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Queue consumer settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Asset cache settings
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines for log shippers
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file, written in addition to stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Queue consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Topic name reported in record metadata
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Records larger than this many bytes are skipped
    #[serde(default = "default_message_size_limit")]
    pub message_size_limit: usize,

    /// Commit the consumed offset after this many records
    #[serde(default = "default_commit_every")]
    pub commit_every: u64,

    /// Pause before polling again when no record is available
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,

    /// Where committed offsets are persisted; resume point on restart
    #[serde(default)]
    pub offset_file: Option<PathBuf>,

    /// Largest payload accepted for messages from the extended code range
    #[serde(default = "default_max_opaque_payload")]
    pub max_opaque_payload: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            message_size_limit: default_message_size_limit(),
            commit_every: default_commit_every(),
            idle_backoff_ms: default_idle_backoff_ms(),
            offset_file: None,
            max_opaque_payload: default_max_opaque_payload(),
        }
    }
}

impl QueueConfig {
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }
}

fn default_topic() -> String {
    "cache".to_string()
}

fn default_message_size_limit() -> usize {
    1024 * 1024
}

fn default_commit_every() -> u64 {
    100
}

fn default_idle_backoff_ms() -> u64 {
    200
}

fn default_max_opaque_payload() -> usize {
    replaykit_codec::extra::DEFAULT_MAX_PAYLOAD_LEN
}

/// Asset cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of assets remembered for deduplication
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// How long a cached asset is considered fresh
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Interval between cache maintenance passes
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Optional JSON-lines manifest of planned asset jobs
    #[serde(default)]
    pub manifest_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ttl_secs: default_ttl_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            manifest_path: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

fn default_capacity() -> usize {
    64 * 1024
}

fn default_ttl_secs() -> u64 {
    60 * 60
}

fn default_maintenance_interval_secs() -> u64 {
    20 * 60
}

impl Config {
    /// Load configuration from `path`, or from `replaykit.toml` in the
    /// working directory when it exists, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load_from(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general
            .log_level
            .parse::<crate::logging::LogLevel>()
            .map_err(ConfigError::Invalid)?;
        if self.queue.message_size_limit == 0 {
            return Err(ConfigError::Invalid(
                "queue.message_size_limit must be greater than zero".into(),
            ));
        }
        if self.queue.commit_every == 0 {
            return Err(ConfigError::Invalid(
                "queue.commit_every must be greater than zero".into(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid(
                "cache.capacity must be greater than zero".into(),
            ));
        }
        if self.cache.maintenance_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "cache.maintenance_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.general.log_level.clone(),
            format: self.general.log_format,
            file: self.general.log_file.clone(),
        }
    }
}
