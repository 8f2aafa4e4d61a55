//! Structured logging for replaykit
//!
//! Built on `tracing`, with a pretty format for terminals and a JSON-lines
//! format for log shippers. An optional log file receives the same events
//! without ANSI colors.
//!
//! # Correlation Fields
//!
//! Use these field names consistently in spans and events:
//! - `session_id`: Recording session the batch belongs to
//! - `topic`, `offset`: Queue position of the record being processed
//! - `index`: Stamped message index inside a batch
//! - `url`, `key`: Asset being cached and its storage key
//!
//! Message payloads (console output, exception text) are never logged.

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter; `RUST_LOG` takes precedence when set
    pub level: String,

    pub format: LogFormat,

    /// Append logs here in addition to stderr
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to open log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn open_log_file(path: &Path) -> io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}

fn output_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_writer(writer)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

/// Install the global subscriber.
///
/// Call once at startup; later calls return
/// `Err(LogError::AlreadyInitialized)`.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }
    config
        .level
        .parse::<LogLevel>()
        .map_err(|_| LogError::InvalidLevel(config.level.clone()))?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let mut layers = vec![output_layer(config.format, io::stderr, true)];
    if let Some(path) = &config.file {
        let file = open_log_file(path)?;
        layers.push(output_layer(config.format, Mutex::new(file), false));
    }

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(layers).with(env_filter),
    )?;
    let _ = LOGGING_INITIALIZED.set(());

    tracing::info!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );
    Ok(())
}

/// Log levels accepted in configuration and on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: {s}. Expected one of: trace, debug, info, warn, error"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Captures formatted output in memory
    #[derive(Clone, Default)]
    struct CaptureWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl CaptureWriter {
        fn contents(&self) -> String {
            String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> fmt::MakeWriter<'a> for CaptureWriter {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn log_level_from_str() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("".parse::<LogLevel>().is_err());
        assert!(LogLevel::Trace < LogLevel::Error);
    }

    #[test]
    fn log_config_serde_defaults_from_empty_json() {
        let parsed: LogConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, LogConfig::default());
    }

    #[test]
    fn json_layer_emits_flat_parseable_lines() {
        let writer = CaptureWriter::default();
        let subscriber = tracing_subscriber::registry()
            .with(vec![output_layer(LogFormat::Json, writer.clone(), false)])
            .with(EnvFilter::new("info"));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(session_id = 42u64, topic = "cache", "record consumed");
            tracing::debug!("filtered out");
        });

        let output = writer.contents();
        let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
        assert_eq!(lines.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert!(parsed.get("timestamp").is_some());
        assert_eq!(
            parsed.get("session_id").and_then(serde_json::Value::as_u64),
            Some(42)
        );
        assert_eq!(parsed.get("topic").and_then(|v| v.as_str()), Some("cache"));
    }

    #[test]
    fn pretty_layer_without_ansi_is_plain_text() {
        let writer = CaptureWriter::default();
        let subscriber = tracing_subscriber::registry()
            .with(vec![output_layer(LogFormat::Pretty, writer.clone(), false)]);

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(url = "https://cdn/app.js", "asset rejected");
        });

        let output = writer.contents();
        assert!(output.contains("asset rejected"));
        assert!(!output.contains('\u{1b}'));
    }

    #[test]
    fn open_log_file_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("replaykit.log");
        open_log_file(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn log_error_display() {
        assert_eq!(
            LogError::AlreadyInitialized.to_string(),
            "logging already initialized"
        );
        assert!(
            LogError::InvalidLevel("loud".into())
                .to_string()
                .contains("loud")
        );
    }
}
