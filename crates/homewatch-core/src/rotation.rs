//! Size-bounded rotating log file.
//!
//! [`RotatingFileWriter`] is the file sink behind the `tracing` file layer.
//! Files on disk:
//!
//! ```text
//! homewatch.log      active, appended to
//! homewatch.log.1    newest rotated generation
//! ...
//! homewatch.log.N    oldest, N = backup_count
//! ```
//!
//! A non-empty active file is rotated before a record that would push it past
//! `max_bytes`, and again after any write that leaves it at or above
//! `max_bytes`. Every generation therefore stays within the threshold unless a
//! single record is larger, and the footprint is bounded by
//! `(backup_count + 1) * max_bytes`.
//!
//! Writers in one process are serialized by a mutex and each record is handed
//! to the OS in one `write` on an `O_APPEND` handle, so lines never interleave.
//! Rotation across processes is guarded by an exclusive lock on
//! `<active>.lock`; a writer whose handle was rotated away by another process
//! notices the inode change and reopens the active path.
//!
//! Renames are retried with [`RetryPolicy::file_rename`]. When they keep
//! failing, an alert file is raised, a notice goes to stderr, and records keep
//! going to the current file. Writing never returns an error to the caller.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::alerts::{AlertFile, AlertKind};
use crate::config::LoggingConfig;
use crate::retry::{RetryPolicy, with_retry};

/// Filesystem operations used during rotation.
///
/// Swappable so the failure path can be exercised without a broken disk.
pub trait RenameOps: Send + Sync {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// Plain `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFs;

impl RenameOps for StdFs {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }
}

/// Rotation settings.
#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub path: PathBuf,
    pub max_bytes: u64,
    pub backup_count: u32,
    /// Raised when renames fail after all retries.
    pub alert_path: Option<PathBuf>,
    pub rename_policy: RetryPolicy,
    /// Pause before trying again after a failed rotation.
    pub failure_cooldown: Duration,
}

impl RotationConfig {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, backup_count: u32) -> Self {
        Self {
            path: path.into(),
            max_bytes: max_bytes.max(1),
            backup_count,
            alert_path: None,
            rename_policy: RetryPolicy::file_rename(),
            failure_cooldown: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_alert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.alert_path = Some(path.into());
        self
    }

    /// Build from the `[logging]` section with paths already resolved.
    #[must_use]
    pub fn from_logging(config: &LoggingConfig, file: PathBuf, alert_path: PathBuf) -> Self {
        Self::new(file, config.max_bytes, config.backup_count).with_alert_path(alert_path)
    }

    /// Largest on-disk footprint across active and rotated files.
    #[must_use]
    pub fn footprint_bound(&self) -> u64 {
        (u64::from(self.backup_count) + 1).saturating_mul(self.max_bytes)
    }

    /// Path of generation `n` (0 is the active file).
    #[must_use]
    pub fn generation(&self, n: u32) -> PathBuf {
        if n == 0 {
            return self.path.clone();
        }
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }
}

struct ActiveFile {
    file: File,
    #[cfg(unix)]
    ino: u64,
}

impl ActiveFile {
    fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        #[cfg(unix)]
        let ino = {
            use std::os::unix::fs::MetadataExt;
            file.metadata()?.ino()
        };
        Ok(Self {
            file,
            #[cfg(unix)]
            ino,
        })
    }

    fn len(&self) -> u64 {
        self.file.metadata().map_or(0, |m| m.len())
    }

    /// Whether the active path now names a different file than ours.
    fn replaced_on_disk(&self, path: &Path) -> bool {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            std::fs::metadata(path).map_or(true, |m| m.ino() != self.ino)
        }
        #[cfg(not(unix))]
        {
            !path.exists()
        }
    }
}

#[derive(Default)]
struct State {
    active: Option<ActiveFile>,
    alert_raised: bool,
    retry_after: Option<Instant>,
    rotations: u64,
    failed_rotations: u64,
}

/// Counters exposed for health checks and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationStats {
    pub rotations: u64,
    pub failed_rotations: u64,
    pub alert_raised: bool,
}

/// Thread-safe rotating file sink.
pub struct RotatingFileWriter {
    config: RotationConfig,
    ops: Arc<dyn RenameOps>,
    state: Mutex<State>,
}

impl std::fmt::Debug for RotatingFileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingFileWriter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RotatingFileWriter {
    /// Open (or create) the active file.
    pub fn open(config: RotationConfig) -> io::Result<Self> {
        Self::with_ops(config, Arc::new(StdFs))
    }

    pub fn with_ops(config: RotationConfig, ops: Arc<dyn RenameOps>) -> io::Result<Self> {
        let active = ActiveFile::open(&config.path)?;
        Ok(Self {
            config,
            ops,
            state: Mutex::new(State {
                active: Some(active),
                ..State::default()
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> RotationStats {
        let state = self.lock_state();
        RotationStats {
            rotations: state.rotations,
            failed_rotations: state.failed_rotations,
            alert_raised: state.alert_raised,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one record, rotating around it as needed.
    pub fn write_record(&self, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        let incoming = buf.len() as u64;
        let mut state = self.lock_state();

        // Anything logged from inside the sink would re-enter it.
        let notices = tracing::dispatcher::with_default(&tracing::Dispatch::none(), || {
            let mut notices = Vec::new();
            self.ensure_current(&mut state, &mut notices);

            let size = state.active.as_ref().map_or(0, ActiveFile::len);
            if size > 0 && size + incoming > self.config.max_bytes {
                self.rotate(&mut state, incoming, &mut notices);
            }

            match state.active.as_mut() {
                Some(active) => {
                    if let Err(e) = active.file.write_all(buf) {
                        notices.push(format!("failed to write log record: {e}"));
                    }
                }
                None => notices.push("log file unavailable, record dropped from file sink".to_string()),
            }

            let size = state.active.as_ref().map_or(0, ActiveFile::len);
            if size >= self.config.max_bytes {
                self.rotate(&mut state, 0, &mut notices);
            }
            notices
        });
        drop(state);

        for notice in notices {
            eprintln!("homewatch: {notice} ({})", self.config.path.display());
        }
    }

    /// Reopen the active path if another process rotated it away.
    fn ensure_current(&self, state: &mut State, notices: &mut Vec<String>) {
        let stale = state
            .active
            .as_ref()
            .is_none_or(|a| a.replaced_on_disk(&self.config.path));
        if stale {
            match ActiveFile::open(&self.config.path) {
                Ok(active) => state.active = Some(active),
                Err(e) => notices.push(format!("cannot reopen log file: {e}")),
            }
        }
    }

    fn over_threshold(&self, size: u64, incoming: u64) -> bool {
        size >= self.config.max_bytes || (size > 0 && size + incoming > self.config.max_bytes)
    }

    fn rotate(&self, state: &mut State, incoming: u64, notices: &mut Vec<String>) {
        if state.retry_after.is_some_and(|t| Instant::now() < t) {
            return;
        }

        let lock = match OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.config.lock_path())
        {
            Ok(file) => file,
            Err(e) => {
                self.rotation_failed(state, &format!("cannot open rotation lock: {e}"), notices);
                return;
            }
        };
        if let Err(e) = FileExt::lock_exclusive(&lock) {
            self.rotation_failed(state, &format!("cannot take rotation lock: {e}"), notices);
            return;
        }

        // Another process may have rotated while we waited for the lock.
        self.ensure_current(state, notices);
        let size = state.active.as_ref().map_or(0, ActiveFile::len);
        if self.over_threshold(size, incoming) {
            match self.shift_generations() {
                Ok(()) => self.rotation_succeeded(state, notices),
                Err(e) => self.rotation_failed(state, &format!("log rotation failed: {e}"), notices),
            }
        }

        let _ = FileExt::unlock(&lock);
    }

    /// Drop the oldest generation and move every other one up by one.
    fn shift_generations(&self) -> io::Result<()> {
        let n = self.config.backup_count;

        // Generations beyond the configured count (e.g. after lowering it).
        let mut extra = n + 1;
        while self.config.generation(extra).exists() {
            self.remove(&self.config.generation(extra))?;
            extra += 1;
        }

        if n == 0 {
            return self.remove(&self.config.path);
        }

        self.remove(&self.config.generation(n))?;
        for i in (1..n).rev() {
            let from = self.config.generation(i);
            if from.exists() {
                self.rename(&from, &self.config.generation(i + 1))?;
            }
        }
        self.rename(&self.config.path, &self.config.generation(1))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let result = with_retry(&self.config.rename_policy, "log.rotate.rename", || {
            self.ops.rename(from, to)
        });
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let result = with_retry(&self.config.rename_policy, "log.rotate.remove", || {
            self.ops.remove(path)
        });
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn rotation_succeeded(&self, state: &mut State, notices: &mut Vec<String>) {
        match ActiveFile::open(&self.config.path) {
            Ok(active) => state.active = Some(active),
            Err(e) => {
                state.active = None;
                notices.push(format!("cannot open fresh log file: {e}"));
                return;
            }
        }
        state.rotations += 1;
        state.retry_after = None;

        if state.alert_raised {
            if let Some(alert_path) = &self.config.alert_path {
                match AlertFile::at(alert_path).clear() {
                    Ok(_) => notices.push("log rotation recovered, alert cleared".to_string()),
                    Err(e) => notices.push(format!("cannot clear rotation alert: {e}")),
                }
            }
            state.alert_raised = false;
        }
    }

    fn rotation_failed(&self, state: &mut State, reason: &str, notices: &mut Vec<String>) {
        state.failed_rotations += 1;
        state.retry_after = Some(Instant::now() + self.config.failure_cooldown);
        notices.push(format!("{reason}; continuing to append to the current file"));

        if !state.alert_raised {
            if let Some(alert_path) = &self.config.alert_path {
                match AlertFile::at(alert_path).raise(AlertKind::LogRotationFailed, reason) {
                    Ok(_) => state.alert_raised = true,
                    Err(e) => notices.push(format!("cannot write rotation alert: {e}")),
                }
            }
        }

        // The active handle may have been renamed before the failure.
        if state.active.is_none() {
            if let Ok(active) = ActiveFile::open(&self.config.path) {
                state.active = Some(active);
            }
        }
    }

    pub fn flush_file(&self) -> io::Result<()> {
        let mut state = self.lock_state();
        match state.active.as_mut() {
            Some(active) => active.file.flush(),
            None => Ok(()),
        }
    }

    /// Total bytes across the active file and rotated generations.
    #[must_use]
    pub fn footprint(&self) -> u64 {
        (0..=self.config.backup_count + 1)
            .filter_map(|n| std::fs::metadata(self.config.generation(n)).ok())
            .map(|m| m.len())
            .sum()
    }
}

impl Write for &RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_record(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_file()
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_record(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_file()
    }
}
