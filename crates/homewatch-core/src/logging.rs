//! Structured logging for homewatch
//!
//! `tracing` with two sinks:
//!
//! - **stderr**: pretty (colored) or JSON lines, per `[logging] format`
//! - **file**: the size-bounded [`RotatingFileWriter`], always without ANSI
//!
//! Initialize once at startup:
//!
//! ```ignore
//! use homewatch_core::config::Config;
//! use homewatch_core::logging::{init_logging, LogConfig};
//!
//! let config = Config::load()?;
//! let _handle = init_logging(&LogConfig::from_config(&config))?;
//! ```
//!
//! # Correlation fields
//!
//! Use these names consistently in spans and events:
//! - `device_id`, `device_type`: reading source
//! - `operation`, `attempt`: retry context
//! - `validator`: health check context
//!
//! Never log credentials. Health output goes through [`crate::redact`].

use serde::{Deserialize, Serialize};
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::Config;
use crate::rotation::{RotatingFileWriter, RotationConfig, RotationStats};

/// Global flag to track if logging has been initialized
static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Output format for stderr logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
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

/// Resolved logging settings
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level filter; `RUST_LOG` overrides it
    pub level: String,
    pub format: LogFormat,
    /// File sink; `None` logs to stderr only
    pub file: Option<RotationConfig>,
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

impl LogConfig {
    /// Derive from the loaded configuration, resolving paths against `data_dir`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let file = config.log_file().map(|path| {
            RotationConfig::from_logging(&config.logging, path, config.rotation_alert_path())
        });
        Self {
            level: config.general.log_level.clone(),
            format: config.logging.format,
            file,
        }
    }

    /// Raise the level to debug (CLI `--verbose`).
    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        if verbose {
            self.level = "debug".to_string();
        }
        self
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Keeps the file sink reachable after initialization.
///
/// The global subscriber only routes `tracing` events. Components that write
/// to the rotating sink directly, or report its stats, receive the writer from
/// [`LoggingHandle::file_writer`] through their constructors; nothing else
/// looks it up globally. The handle lives as long as the process.
#[derive(Debug, Clone, Default)]
pub struct LoggingHandle {
    file: Option<Arc<RotatingFileWriter>>,
}

impl LoggingHandle {
    #[must_use]
    pub fn file_writer(&self) -> Option<&Arc<RotatingFileWriter>> {
        self.file.as_ref()
    }

    #[must_use]
    pub fn rotation_stats(&self) -> Option<RotationStats> {
        self.file.as_ref().map(|w| w.stats())
    }

    pub fn flush(&self) {
        if let Some(writer) = &self.file {
            let _ = writer.flush_file();
        }
    }
}

fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let existed = parent.exists();
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            if !existed {
                let permissions = std::fs::Permissions::from_mode(0o700);
                std::fs::set_permissions(parent, permissions)?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path, mode: u32) -> io::Result<()> {
    let permissions = std::fs::Permissions::from_mode(mode);
    std::fs::set_permissions(path, permissions)
}

/// Open the rotating file sink, creating its directory with owner-only access.
pub fn open_file_sink(rotation: &RotationConfig) -> Result<Arc<RotatingFileWriter>, LogError> {
    ensure_parent_dir(&rotation.path)?;
    let existed = rotation.path.exists();
    let writer = RotatingFileWriter::open(rotation.clone())?;
    #[cfg(unix)]
    if !existed {
        set_file_permissions(&rotation.path, 0o600)?;
    }
    Ok(Arc::new(writer))
}

/// Initialize the global logging subscriber
///
/// Subsequent calls return `Err(LogError::AlreadyInitialized)`.
/// `RUST_LOG` overrides the configured level, e.g.
/// `RUST_LOG=homewatch_core=debug`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingHandle, LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let level: LogLevel = config.level.parse().map_err(LogError::InvalidLevel)?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::from(level).as_str().to_lowercase()));

    let file_writer = config.file.as_ref().map(open_file_sink).transpose()?;

    match config.format {
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_span_events(FmtSpan::NONE)
                    .with_ansi(true),
            );
            let file_layer = file_writer.clone().map(|writer| {
                fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_ansi(false)
            });
            tracing::subscriber::set_global_default(subscriber.with(file_layer))?;
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_timer(SystemTime)
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .flatten_event(true),
            );
            let file_layer = file_writer.clone().map(|writer| {
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_timer(SystemTime)
                    .with_target(true)
                    .with_current_span(true)
                    .flatten_event(true)
            });
            tracing::subscriber::set_global_default(subscriber.with(file_layer))?;
        }
    }

    let _ = LOGGING_INITIALIZED.set(true);

    tracing::info!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file.as_ref().map(|f| &f.path),
        "Logging initialized"
    );

    Ok(LoggingHandle { file: file_writer })
}

/// Check if logging has been initialized
pub fn is_logging_initialized() -> bool {
    LOGGING_INITIALIZED.get().is_some()
}

/// Log levels that can be used for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
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
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tracing_subscriber::fmt::MakeWriter;

    /// A mock writer that captures output to a shared buffer for testing
    #[derive(Clone)]
    struct MockLogWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl MockLogWriter {
        fn new() -> Self {
            Self {
                buffer: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn contents(&self) -> String {
            String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
        }
    }

    impl io::Write for MockLogWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for MockLogWriter {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }

    #[test]
    fn log_level_from_str() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("ERROR".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
    }

    #[test]
    fn log_config_from_defaults_has_file_sink() {
        let mut config = Config::default();
        config.general.data_dir = PathBuf::from("/var/lib/homewatch");
        let log = LogConfig::from_config(&config);
        let file = log.file.unwrap();
        assert_eq!(file.path, PathBuf::from("/var/lib/homewatch/logs/homewatch.log"));
        assert_eq!(file.max_bytes, 10 * 1024 * 1024);
        assert_eq!(file.backup_count, 5);
        assert!(file.alert_path.is_some());
        assert_eq!(LogConfig::default().verbose(true).level, "debug");
    }

    #[test]
    fn json_logs_are_parseable() {
        let writer = MockLogWriter::new();
        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new("info"))
            .with(
                fmt::layer()
                    .json()
                    .with_timer(SystemTime)
                    .with_target(true)
                    .with_current_span(true)
                    .flatten_event(true)
                    .with_writer(writer.clone()),
            );

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(device_id = "hue-1", attempt = 2u32, "reading stored");
        });

        let output = writer.contents();
        let line = output.lines().next().unwrap();
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["device_id"], "hue-1");
        assert_eq!(value["attempt"], 2);
        assert_eq!(value["level"], "INFO");
    }

    #[test]
    fn file_layer_rotates_through_tracing() {
        let dir = TempDir::new().unwrap();
        let rotation = RotationConfig::new(dir.path().join("logs/hw.log"), 512, 2);
        let writer = open_file_sink(&rotation).unwrap();

        let subscriber = tracing_subscriber::registry().with(EnvFilter::new("info")).with(
            fmt::layer()
                .with_writer(Arc::clone(&writer))
                .with_ansi(false),
        );
        tracing::subscriber::with_default(subscriber, || {
            for n in 0..200 {
                tracing::info!(n, "sensor poll complete");
            }
        });

        assert!(rotation.generation(1).exists());
        assert!(writer.footprint() <= rotation.footprint_bound());
        assert!(writer.stats().rotations > 0);
        let active = std::fs::read_to_string(&rotation.path).unwrap();
        assert!(active.contains("sensor poll complete"));
    }

    #[test]
    fn handle_hands_out_the_same_sink() {
        let dir = TempDir::new().unwrap();
        let rotation = RotationConfig::new(dir.path().join("hw.log"), 4096, 1);
        let sink = open_file_sink(&rotation).unwrap();
        let handle = LoggingHandle {
            file: Some(Arc::clone(&sink)),
        };

        let injected = handle.file_writer().unwrap();
        assert!(Arc::ptr_eq(injected, &sink));
        injected.write_record(b"collector started\n");
        handle.flush();

        let active = std::fs::read_to_string(&rotation.path).unwrap();
        assert!(active.contains("collector started"));
        assert_eq!(handle.rotation_stats().unwrap().rotations, 0);
        assert!(LoggingHandle::default().file_writer().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn file_sink_is_owner_only() {
        let dir = TempDir::new().unwrap();
        let rotation = RotationConfig::new(dir.path().join("private/hw.log"), 1024, 1);
        let _writer = open_file_sink(&rotation).unwrap();
        let mode = std::fs::metadata(&rotation.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(dir.path().join("private"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }
}
