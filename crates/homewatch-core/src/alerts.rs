//! Alert artifacts at well-known paths.
//!
//! External monitoring watches these files. The log rotation sink raises one
//! when rotation fails persistently; collectors raise one when upstream
//! authentication fails and clear it after a successful login. The health
//! check reports any alert that is present.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;

/// What raised the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LogRotationFailed,
    UpstreamAuthFailed,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LogRotationFailed => write!(f, "log_rotation_failed"),
            Self::UpstreamAuthFailed => write!(f, "upstream_auth_failed"),
        }
    }
}

/// Contents of an alert file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
    pub pid: u32,
}

/// Handle on one alert path.
#[derive(Debug, Clone)]
pub struct AlertFile {
    path: PathBuf,
}

impl AlertFile {
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the alert atomically (temp file then rename).
    pub fn raise(&self, kind: AlertKind, message: impl Into<String>) -> Result<Alert> {
        let alert = Alert {
            kind,
            severity: "critical".to_string(),
            message: message.into(),
            raised_at: Utc::now(),
            pid: std::process::id(),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        std::fs::write(&tmp_path, serde_json::to_vec_pretty(&alert)?)?;
        std::fs::rename(&tmp_path, &self.path)?;

        warn!(path = %self.path.display(), kind = %kind, "Alert raised");
        Ok(alert)
    }

    /// Remove the alert. Returns whether one was present.
    pub fn clear(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Alert cleared");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Parse the alert if present.
    pub fn read(&self) -> Result<Option<Alert>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
