//! Error types for homewatch-core
//!
//! Every error raised under the retry executor carries an [`ErrorKind`] tag
//! through the [`Classify`] trait. The executor switches on the tag instead of
//! matching concrete types.

use std::fmt::Write;
use thiserror::Error;

/// Retry classification for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retrying may succeed (network blip, lock contention, busy rename).
    Transient,
    /// Retrying can never succeed (bad input, auth format, constraint).
    Permanent,
    /// Not classified. Retried like a transient failure, but logged loudly.
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Errors that know whether retrying them is worthwhile.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl Classify for std::io::Error {
    fn kind(&self) -> ErrorKind {
        use std::io::ErrorKind as Io;
        match std::io::Error::kind(self) {
            Io::ResourceBusy
            | Io::WouldBlock
            | Io::Interrupted
            | Io::TimedOut
            | Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::HostUnreachable
            | Io::NetworkUnreachable
            | Io::NetworkDown => ErrorKind::Transient,
            Io::NotFound
            | Io::InvalidInput
            | Io::InvalidData
            | Io::PermissionDenied
            | Io::StorageFull
            | Io::ReadOnlyFilesystem
            | Io::AlreadyExists
            | Io::Unsupported => ErrorKind::Permanent,
            _ => ErrorKind::Unknown,
        }
    }
}

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error or failed health check
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for homewatch-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Failures talking to a vendor API or bridge
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Reading rejected before it reached the store
    #[error("Invalid reading: {0}")]
    InvalidReading(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Thread, channel or other runtime plumbing failures
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Classify for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage(e) => e.kind(),
            Self::Registry(e) => e.kind(),
            Self::Upstream(e) => e.kind(),
            Self::Io(e) => Classify::kind(e),
            Self::Config(_) | Self::InvalidReading(_) | Self::Json(_) | Self::Yaml(_) => {
                ErrorKind::Permanent
            }
            Self::Runtime(_) => ErrorKind::Unknown,
        }
    }
}

impl Error {
    /// Whether the failure concerns a single input record.
    ///
    /// Callers processing a batch may skip the record and continue. Every
    /// other error, permanent or not, means the store or registry itself is
    /// unusable and must stop the batch.
    #[must_use]
    pub const fn is_rejected_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidReading(_)
                | Self::Storage(StorageError::ConstraintViolation(_))
                | Self::Registry(RegistryError::DeviceTypeChanged { .. })
        )
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Storage(err) => Some(err.remediation()),
            Self::Registry(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Upstream(err) => Some(err.remediation()),
            Self::InvalidReading(_) => Some(
                Remediation::new("Reject the reading upstream; values outside physical ranges are never stored.")
                    .command("Inspect recent readings", "hw store stats")
                    .alternative("Check the collector's unit conversion (Fahrenheit vs Celsius)."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Diagnostics", "hw health")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
            Self::Yaml(_) => Some(
                Remediation::new("Fix the YAML syntax and retry.")
                    .command("Diagnostics", "hw health")
                    .alternative("Restore the registry file from a backup."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Retry the command. If it keeps failing, check the log file.")
                    .command("Diagnostics", "hw health"),
            ),
        }
    }
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Another connection holds the write lock
    #[error("Database is locked: {0}")]
    Locked(String),

    /// CHECK or NOT NULL constraint rejected the row
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Disk full, read-only filesystem or permission denied
    #[error("Database at {path} is not writable: {reason}")]
    NotWritable { path: String, reason: String },

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Database schema version ({current}) is newer than supported ({supported})")]
    SchemaTooNew { current: i32, supported: i32 },

    #[error("Database error: {0}")]
    Database(String),
}

impl Classify for StorageError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Locked(_) => ErrorKind::Transient,
            Self::ConstraintViolation(_)
            | Self::NotWritable { .. }
            | Self::MigrationFailed(_)
            | Self::SchemaTooNew { .. } => ErrorKind::Permanent,
            Self::Database(_) => ErrorKind::Unknown,
        }
    }
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Locked(_) => Remediation::new(
                "Another collector held the database lock for longer than the retry budget.",
            )
            .command("Check for stuck writers", "fuser -v ~/.local/share/homewatch/readings.db")
            .alternative("Raise storage.lock_retry_attempts or storage.busy_timeout_ms."),
            Self::ConstraintViolation(_) => Remediation::new(
                "A reading carried a physically impossible value and was rejected.",
            )
            .command("Inspect recent readings", "hw store stats")
            .alternative("Fix the collector's parsing or unit conversion."),
            Self::NotWritable { path, .. } => Remediation::new(format!(
                "Database {path} cannot be written. Free disk space or fix permissions."
            ))
            .command("Check disk space", "df -h")
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Point storage.db_path at a writable location."),
            Self::MigrationFailed(_) => {
                Remediation::new("Database migration failed. Check logs and retry after backup.")
                    .command("Diagnostics", "hw health")
                    .alternative("Backup the database file before retrying.")
            }
            Self::SchemaTooNew { current, supported } => Remediation::new(format!(
                "Database schema version {current} is newer than supported ({supported}). Upgrade homewatch."
            ))
            .command("Upgrade", "cargo install homewatch")
            .alternative("Restore an older database backup."),
            Self::Database(_) => Remediation::new(
                "Database operation failed. Check data directory permissions and retry.",
            )
            .command("Diagnostics", "hw health")
            .alternative("Run `hw store stats` to confirm the database opens."),
        }
    }
}

/// Device registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// A known id reported a different device type
    #[error("Device {unique_id} is registered as {stored}, refusing to change it to {requested}")]
    DeviceTypeChanged {
        unique_id: String,
        stored: String,
        requested: String,
    },

    #[error("Invalid device name for {unique_id}: {reason}")]
    InvalidName { unique_id: String, reason: String },

    #[error("Registry file {path} is malformed: {reason}")]
    Malformed { path: String, reason: String },

    #[error("Failed to lock registry {path}: {reason}")]
    LockFailed { path: String, reason: String },
}

impl Classify for RegistryError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::LockFailed { .. } => ErrorKind::Transient,
            Self::UnknownDevice(_)
            | Self::DeviceTypeChanged { .. }
            | Self::InvalidName { .. }
            | Self::Malformed { .. } => ErrorKind::Permanent,
        }
    }
}

impl RegistryError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::UnknownDevice(id) => Remediation::new(format!("No device with id {id} is registered."))
                .command("List devices", "hw devices list")
                .alternative("Run a collection cycle so the device registers itself."),
            Self::DeviceTypeChanged { unique_id, .. } => Remediation::new(format!(
                "Device {unique_id} changed type. Remove the stale entry if the hardware was replaced."
            ))
            .command("List devices", "hw devices list")
            .alternative("Edit the registry file and delete the old entry."),
            Self::InvalidName { .. } => Remediation::new("Device names must contain visible characters.")
                .command("Rename", "hw devices rename <id> \"Living Room Sensor\""),
            Self::Malformed { path, .. } => Remediation::new(format!(
                "Registry file {path} could not be parsed. Fix the YAML by hand."
            ))
            .command("Inspect", format!("cat \"{path}\""))
            .alternative("Move the file aside; devices re-register on the next cycle."),
            Self::LockFailed { path, .. } => Remediation::new(format!(
                "Could not lock the registry at {path}. Another process may be stuck."
            ))
            .command("Check lock holders", format!("fuser -v \"{path}.lock\""))
            .alternative("Retry once the other collector finishes."),
        }
    }
}

/// Errors reported by vendor API calls made by collectors
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Rate limited by upstream")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Credentials rejected or malformed. Never retried.
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl Classify for UpstreamError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited { .. } => {
                ErrorKind::Transient
            }
            Self::Auth(_) | Self::Malformed(_) => ErrorKind::Permanent,
        }
    }
}

impl UpstreamError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Network(_) | Self::Timeout(_) => {
                Remediation::new("The upstream service was unreachable. Check connectivity.")
                    .command("Connectivity", "hw health")
                    .alternative("Verify the bridge host and port in the [[upstream]] config.")
            }
            Self::RateLimited { retry_after_secs } => Remediation::new(match retry_after_secs {
                Some(secs) => format!("Upstream rate limit hit. Wait {secs}s before retrying."),
                None => "Upstream rate limit hit. Reduce the collection frequency.".to_string(),
            })
            .command("Diagnostics", "hw health"),
            Self::Auth(_) => Remediation::new(
                "Credentials were rejected. Refresh the vendor token or cookie.",
            )
            .command("Diagnostics", "hw health")
            .alternative("Clear the auth alert file after refreshing credentials."),
            Self::Malformed(_) => Remediation::new(
                "The upstream response did not match the expected format.",
            )
            .command("Diagnostics", "hw health")
            .alternative("Check whether the vendor API version changed."),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax and retry.")
                .command("Diagnostics", "hw health")
                .alternative("Compare against the defaults in the README."),
            Self::SerializeFailed(_) => {
                Remediation::new("Failed to serialize configuration. Check config values.")
                    .command("Diagnostics", "hw health")
                    .alternative("Recreate the config from known-good defaults.")
            }
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Diagnostics", "hw health")
                    .alternative("Review validation errors and adjust homewatch.toml.")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_available_for_error_variants() {
        let json_err = serde_json::from_str::<serde_json::Value>("").unwrap_err();
        let errors = vec![
            Error::Storage(StorageError::Locked("busy".to_string())),
            Error::Storage(StorageError::ConstraintViolation("check".to_string())),
            Error::Storage(StorageError::NotWritable {
                path: "/tmp/x.db".to_string(),
                reason: "disk full".to_string(),
            }),
            Error::Storage(StorageError::MigrationFailed("migrate".to_string())),
            Error::Storage(StorageError::SchemaTooNew {
                current: 9,
                supported: 2,
            }),
            Error::Storage(StorageError::Database("db".to_string())),
            Error::Registry(RegistryError::UnknownDevice("x".to_string())),
            Error::Registry(RegistryError::Malformed {
                path: "devices.yaml".to_string(),
                reason: "bad".to_string(),
            }),
            Error::Upstream(UpstreamError::Timeout(500)),
            Error::Upstream(UpstreamError::RateLimited {
                retry_after_secs: Some(30),
            }),
            Error::Upstream(UpstreamError::Auth("expired cookie".to_string())),
            Error::Config(ConfigError::FileNotFound("homewatch.toml".to_string())),
            Error::Config(ConfigError::ValidationError("invalid".to_string())),
            Error::InvalidReading("temperature_celsius=55".to_string()),
            Error::Io(std::io::Error::other("io")),
            Error::Json(json_err),
            Error::Runtime("runtime".to_string()),
        ];

        for error in errors {
            let remediation = error.remediation().expect("missing remediation");
            assert!(
                !remediation.summary.is_empty(),
                "remediation summary empty for {error:?}"
            );
            assert!(
                !remediation.commands.is_empty(),
                "remediation commands empty for {error:?}"
            );
        }
    }

    #[test]
    fn upstream_classification() {
        assert_eq!(
            UpstreamError::Network("reset".into()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(UpstreamError::Timeout(10).kind(), ErrorKind::Transient);
        assert_eq!(
            UpstreamError::RateLimited {
                retry_after_secs: None
            }
            .kind(),
            ErrorKind::Transient
        );
        assert_eq!(UpstreamError::Auth("bad".into()).kind(), ErrorKind::Permanent);
        assert_eq!(
            UpstreamError::Malformed("{".into()).kind(),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn storage_classification() {
        assert_eq!(
            Error::Storage(StorageError::Locked("x".into())).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            Error::Storage(StorageError::ConstraintViolation("x".into())).kind(),
            ErrorKind::Permanent
        );
        assert_eq!(
            Error::Storage(StorageError::Database("x".into())).kind(),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn io_classification() {
        use std::io::{Error as IoError, ErrorKind as Io};
        assert_eq!(
            Classify::kind(&IoError::from(Io::ResourceBusy)),
            ErrorKind::Transient
        );
        assert_eq!(
            Classify::kind(&IoError::from(Io::TimedOut)),
            ErrorKind::Transient
        );
        assert_eq!(
            Classify::kind(&IoError::from(Io::PermissionDenied)),
            ErrorKind::Permanent
        );
        assert_eq!(
            Classify::kind(&IoError::from(Io::StorageFull)),
            ErrorKind::Permanent
        );
        assert_eq!(Classify::kind(&IoError::other("?")), ErrorKind::Unknown);
    }

    #[test]
    fn config_and_input_errors_are_permanent() {
        assert_eq!(
            Error::Config(ConfigError::ParseFailed("x".into())).kind(),
            ErrorKind::Permanent
        );
        assert_eq!(
            Error::InvalidReading("x".into()).kind(),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn only_record_level_failures_are_rejected_input() {
        assert!(Error::InvalidReading("temp".to_string()).is_rejected_input());
        assert!(Error::Storage(StorageError::ConstraintViolation("check".to_string())).is_rejected_input());
        assert!(Error::Registry(RegistryError::DeviceTypeChanged {
            unique_id: "x".to_string(),
            stored: "hue_sensor".to_string(),
            requested: "weather_api".to_string(),
        })
        .is_rejected_input());

        let fatal = [
            Error::Storage(StorageError::NotWritable {
                path: "/data/readings.db".to_string(),
                reason: "disk full".to_string(),
            }),
            Error::Storage(StorageError::MigrationFailed("alter".to_string())),
            Error::Storage(StorageError::SchemaTooNew { current: 9, supported: 2 }),
            Error::Registry(RegistryError::Malformed {
                path: "devices.yaml".to_string(),
                reason: "bad indent".to_string(),
            }),
        ];
        for err in fatal {
            assert_eq!(err.kind(), ErrorKind::Permanent);
            assert!(!err.is_rejected_input(), "{err}");
        }
    }

    #[test]
    fn remediation_render_plain_lists_commands_and_alternatives() {
        let r = Remediation::new("summary")
            .command("Run", "hw health")
            .alternative("try again");
        let text = r.render_plain();
        assert!(text.starts_with("To fix:\n  summary\n"));
        assert!(text.contains("    - Run: hw health"));
        assert!(text.contains("  Alternatives:\n    - try again"));
    }

    #[test]
    fn format_error_includes_remediation() {
        let err = Error::Config(ConfigError::FileNotFound("/nope.toml".to_string()));
        let text = format_error_with_remediation(&err);
        assert!(text.starts_with("Error: Config error: Config file not found: /nope.toml"));
        assert!(text.contains("To fix:"));
    }

    #[test]
    fn remediation_serde_roundtrip() {
        let r = Remediation::new("fix it").command("Check", "ls");
        let json = serde_json::to_string(&r).unwrap();
        let back: Remediation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.summary, "fix it");
        assert_eq!(back.commands.len(), 1);
    }
}
