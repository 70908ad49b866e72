//! Configuration management for homewatch
//!
//! Handles loading and validation of `homewatch.toml`. Every section is
//! optional; missing sections fall back to defaults so a fresh install works
//! without a config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::logging::LogFormat;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "HOMEWATCH_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub health: HealthConfig,

    /// Upstream endpoints probed by the health check
    #[serde(default)]
    pub upstream: Vec<UpstreamConfig>,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Base directory for relative paths and default artifacts
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("homewatch")
}

/// Reading store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file path (relative paths resolve under `general.data_dir`)
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// WAL pages accumulated before SQLite checkpoints automatically
    #[serde(default = "default_wal_autocheckpoint")]
    pub wal_autocheckpoint_pages: u32,

    /// How long SQLite itself waits on a lock before reporting BUSY
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Insert attempts when the database stays locked
    #[serde(default = "default_lock_retry_attempts")]
    pub lock_retry_attempts: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            wal_autocheckpoint_pages: default_wal_autocheckpoint(),
            busy_timeout_ms: default_busy_timeout_ms(),
            lock_retry_attempts: default_lock_retry_attempts(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("readings.db")
}

fn default_wal_autocheckpoint() -> u32 {
    1000
}

fn default_busy_timeout_ms() -> u64 {
    250
}

fn default_lock_retry_attempts() -> u32 {
    5
}

/// Retry policy applied to upstream calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

/// Logging and rotation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Active log file. `None` disables the file sink (stderr only).
    #[serde(default = "default_log_file")]
    pub file: Option<PathBuf>,

    #[serde(default)]
    pub format: LogFormat,

    /// Rotation threshold in bytes
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Rotated generations kept next to the active file
    #[serde(default = "default_backup_count")]
    pub backup_count: u32,

    /// Written when rotation fails persistently
    #[serde(default = "default_rotation_alert_path")]
    pub rotation_alert_path: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: default_log_file(),
            format: LogFormat::default(),
            max_bytes: default_max_bytes(),
            backup_count: default_backup_count(),
            rotation_alert_path: default_rotation_alert_path(),
        }
    }
}

#[allow(clippy::unnecessary_wraps)]
fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from("logs/homewatch.log"))
}

fn default_max_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_backup_count() -> u32 {
    5
}

fn default_rotation_alert_path() -> PathBuf {
    PathBuf::from("alerts/log_rotation_failed.json")
}

/// Device registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("devices.yaml")
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Wall-clock budget for the whole validator batch
    #[serde(default = "default_health_timeout_secs")]
    pub timeout_secs: u64,

    /// Written by collectors when upstream authentication fails
    #[serde(default = "default_auth_alert_path")]
    pub auth_alert_path: PathBuf,

    /// Environment variables that must be set for collectors to authenticate
    #[serde(default)]
    pub required_env: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_health_timeout_secs(),
            auth_alert_path: default_auth_alert_path(),
            required_env: Vec::new(),
        }
    }
}

fn default_health_timeout_secs() -> u64 {
    30
}

fn default_auth_alert_path() -> PathBuf {
    PathBuf::from("alerts/auth_failed.json")
}

/// One upstream endpoint (local bridge, cloud API) probed for reachability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub host: String,
    pub port: u16,

    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,

    /// An unreachable critical upstream fails the health check outright
    #[serde(default)]
    pub critical: bool,
}

fn default_upstream_timeout_ms() -> u64 {
    3000
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Resolution order: `$HOMEWATCH_CONFIG`, then
    /// `<config_dir>/homewatch/homewatch.toml` when it exists, then defaults.
    pub fn load() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load_from(Path::new(&path));
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::ReadFailed(path.display().to_string(), e.to_string())
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()).into())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()).into())
    }

    /// Check value ranges. Reports every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.general.log_level.parse::<crate::logging::LogLevel>().is_err() {
            problems.push(format!("general.log_level '{}' is not a level", self.general.log_level));
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if !(self.retry.backoff_multiplier >= 1.0) {
            problems.push("retry.backoff_multiplier must be >= 1.0".to_string());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            problems.push("retry.max_delay_ms must be >= retry.base_delay_ms".to_string());
        }
        if self.storage.lock_retry_attempts == 0 {
            problems.push("storage.lock_retry_attempts must be at least 1".to_string());
        }
        if self.storage.wal_autocheckpoint_pages == 0 {
            problems.push("storage.wal_autocheckpoint_pages must be at least 1".to_string());
        }
        if self.logging.max_bytes == 0 {
            problems.push("logging.max_bytes must be greater than 0".to_string());
        }
        if self.health.timeout_secs == 0 {
            problems.push("health.timeout_secs must be at least 1".to_string());
        }
        for upstream in &self.upstream {
            if upstream.name.trim().is_empty() {
                problems.push("upstream.name must not be empty".to_string());
            }
            if upstream.host.trim().is_empty() {
                problems.push(format!("upstream '{}' has an empty host", upstream.name));
            }
            if upstream.port == 0 {
                problems.push(format!("upstream '{}' has port 0", upstream.name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError(problems.join("; ")).into())
        }
    }

    /// Resolve a configured path against `general.data_dir`.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.general.data_dir.join(path)
        }
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.resolve(&self.storage.db_path)
    }

    #[must_use]
    pub fn registry_path(&self) -> PathBuf {
        self.resolve(&self.registry.path)
    }

    #[must_use]
    pub fn log_file(&self) -> Option<PathBuf> {
        self.logging.file.as_deref().map(|p| self.resolve(p))
    }

    #[must_use]
    pub fn rotation_alert_path(&self) -> PathBuf {
        self.resolve(&self.logging.rotation_alert_path)
    }

    #[must_use]
    pub fn auth_alert_path(&self) -> PathBuf {
        self.resolve(&self.health.auth_alert_path)
    }

    #[must_use]
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health.timeout_secs)
    }
}

/// `<config_dir>/homewatch/homewatch.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("homewatch").join("homewatch.toml"))
}
