//! SQLite-backed reading store.
//!
//! One long-lived connection per process, shared behind a mutex. Concurrent
//! writer processes rely on SQLite's own lock arbitration in WAL mode; this
//! module adds no locking of its own beyond bounded retry when the database
//! reports BUSY or LOCKED.
//!
//! Outcomes of [`ReadingStore::insert`]:
//!
//! | Condition                    | Result                              |
//! |------------------------------|-------------------------------------|
//! | stored                       | `Ok(true)`                          |
//! | `(device_id, timestamp)` dup | `Ok(false)`, logged at DEBUG        |
//! | busy / locked                | retried, then `StorageError::Locked`|
//! | out of range, NOT NULL       | `StorageError::ConstraintViolation` |
//! | disk full, read-only, perms  | `StorageError::NotWritable`         |

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::reading::{DeviceType, Reading};
use crate::retry::{RetryPolicy, with_retry};

/// Current schema version, tracked in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 2;

/// DDL for a fresh database.
const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS readings (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp           TEXT NOT NULL,
    device_id           TEXT NOT NULL CHECK (length(device_id) > 0),
    temperature_celsius REAL NOT NULL CHECK (temperature_celsius BETWEEN -40 AND 50),
    location            TEXT,
    name                TEXT,
    device_type         TEXT NOT NULL CHECK (device_type IN
                            ('hue_sensor', 'nest_thermostat', 'weather_api', 'alexa_aqm', 'amazon_aqm')),
    humidity_percent    REAL CHECK (humidity_percent IS NULL OR humidity_percent BETWEEN 0 AND 100),
    pm25_ugm3           REAL CHECK (pm25_ugm3 IS NULL OR pm25_ugm3 >= 0),
    voc_ppb             REAL CHECK (voc_ppb IS NULL OR voc_ppb >= 0),
    co_ppm              REAL CHECK (co_ppm IS NULL OR co_ppm >= 0),
    co2_ppm             REAL CHECK (co2_ppm IS NULL OR co2_ppm >= 0),
    iaq_score           REAL CHECK (iaq_score IS NULL OR iaq_score BETWEEN 0 AND 100),
    battery_level       INTEGER CHECK (battery_level IS NULL OR battery_level BETWEEN 0 AND 100),
    signal_strength     INTEGER CHECK (signal_strength IS NULL OR signal_strength BETWEEN 0 AND 100),
    thermostat_mode     TEXT,
    thermostat_state    TEXT,
    raw_response        TEXT,
    created_at          TEXT,
    is_anomaly          INTEGER NOT NULL DEFAULT 0,
    UNIQUE (device_id, timestamp)
);
";

/// Columns that older databases may lack, added in place by the migration.
///
/// Only nullable or defaulted columns belong here: `ALTER TABLE ADD COLUMN`
/// cannot add NOT NULL without a default.
const ADDITIVE_COLUMNS: &[(&str, &str)] = &[
    ("location", "TEXT"),
    ("name", "TEXT"),
    ("humidity_percent", "REAL CHECK (humidity_percent IS NULL OR humidity_percent BETWEEN 0 AND 100)"),
    ("pm25_ugm3", "REAL CHECK (pm25_ugm3 IS NULL OR pm25_ugm3 >= 0)"),
    ("voc_ppb", "REAL CHECK (voc_ppb IS NULL OR voc_ppb >= 0)"),
    ("co_ppm", "REAL CHECK (co_ppm IS NULL OR co_ppm >= 0)"),
    ("co2_ppm", "REAL CHECK (co2_ppm IS NULL OR co2_ppm >= 0)"),
    ("iaq_score", "REAL CHECK (iaq_score IS NULL OR iaq_score BETWEEN 0 AND 100)"),
    ("battery_level", "INTEGER CHECK (battery_level IS NULL OR battery_level BETWEEN 0 AND 100)"),
    ("signal_strength", "INTEGER CHECK (signal_strength IS NULL OR signal_strength BETWEEN 0 AND 100)"),
    ("thermostat_mode", "TEXT"),
    ("thermostat_state", "TEXT"),
    ("raw_response", "TEXT"),
    ("created_at", "TEXT"),
    ("is_anomaly", "INTEGER NOT NULL DEFAULT 0"),
];

const INDEX_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_readings_timestamp ON readings(timestamp);
CREATE INDEX IF NOT EXISTS idx_readings_device ON readings(device_id);
CREATE INDEX IF NOT EXISTS idx_readings_device_time ON readings(device_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_readings_location ON readings(location);
CREATE INDEX IF NOT EXISTS idx_readings_device_type ON readings(device_type);
CREATE INDEX IF NOT EXISTS idx_readings_anomaly ON readings(timestamp) WHERE is_anomaly = 1;
";

const SELECT_COLUMNS: &str = "timestamp, device_id, temperature_celsius, location, name, device_type, \
     humidity_percent, pm25_ugm3, voc_ppb, co_ppm, co2_ppm, iaq_score, battery_level, \
     signal_strength, thermostat_mode, thermostat_state, raw_response, created_at";

/// Tunables for [`ReadingStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// WAL pages before SQLite checkpoints automatically.
    pub wal_autocheckpoint_pages: u32,
    /// How long SQLite waits on a lock internally before reporting BUSY.
    pub busy_timeout: Duration,
    /// Insert attempts when BUSY/LOCKED persists.
    pub lock_retry_attempts: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for StoreOptions {
    fn from(config: &StorageConfig) -> Self {
        Self {
            wal_autocheckpoint_pages: config.wal_autocheckpoint_pages.max(1),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            lock_retry_attempts: config.lock_retry_attempts.max(1),
        }
    }
}

/// Result of a batch insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertSummary {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Result of an explicit WAL checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointResult {
    /// Whether a reader or writer prevented a full checkpoint.
    pub busy: bool,
    pub wal_pages: i64,
    pub checkpointed_pages: i64,
}

/// Summary shown by `hw store stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_readings: u64,
    pub devices: u64,
    pub anomalies: u64,
    pub oldest: Option<String>,
    pub newest: Option<String>,
    pub db_size_bytes: Option<u64>,
    pub journal_mode: String,
    pub schema_version: i32,
}

/// How a single insert attempt failed.
enum InsertFailure {
    Duplicate,
    Storage(StorageError),
}

/// Durable, idempotent store of readings.
pub struct ReadingStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    options: StoreOptions,
}

impl std::fmt::Debug for ReadingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadingStore")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ReadingStore {
    /// Open or create the store at `path`, migrating the schema forward.
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self> {
        let _span = info_span!("store_open", path = %path.display()).entered();
        let display = path.display().to_string();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::NotWritable {
                    path: display.clone(),
                    reason: e.to_string(),
                })?;
            }
        }

        let conn = Connection::open(path).map_err(|e| storage_error(e, &display))?;
        conn.busy_timeout(options.busy_timeout)
            .map_err(|e| storage_error(e, &display))?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA wal_autocheckpoint={};",
            options.wal_autocheckpoint_pages
        ))
        .map_err(|e| storage_error(e, &display))?;

        initialize_schema(&conn).map_err(|e| match e {
            crate::Error::Storage(StorageError::Database(msg)) => {
                StorageError::MigrationFailed(msg).into()
            }
            other => other,
        })?;

        let store_path = &display;
        info!(path = %store_path, "Reading store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
            options,
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| storage_error(e, ":memory:"))?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            options: StoreOptions::default(),
        })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn display_path(&self) -> String {
        self.path
            .as_ref()
            .map_or_else(|| ":memory:".to_string(), |p| p.display().to_string())
    }

    // A panic while holding the lock leaves SQLite itself consistent.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert one reading. `Ok(false)` means it was already stored.
    pub fn insert(&self, reading: &Reading) -> Result<bool> {
        // Range checks must not depend on the CHECK constraints of a migrated table.
        reading
            .validate()
            .map_err(|e| StorageError::ConstraintViolation(e.to_string()))?;
        let key = reading.timestamp_key();
        let policy = RetryPolicy::db_lock(self.options.lock_retry_attempts);

        let outcome = with_retry(&policy, "store.insert", || {
            match self.try_insert(reading, &key) {
                Ok(()) => Ok(true),
                Err(InsertFailure::Duplicate) => Ok(false),
                Err(InsertFailure::Storage(e)) => Err(e),
            }
        });

        match outcome {
            Ok(true) => {
                debug!(device_id = %reading.device_id, timestamp = %key, "Reading stored");
                Ok(true)
            }
            Ok(false) => {
                debug!(
                    device_id = %reading.device_id,
                    timestamp = %key,
                    "Duplicate reading ignored"
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn try_insert(&self, reading: &Reading, key: &str) -> std::result::Result<(), InsertFailure> {
        reject_non_finite(reading).map_err(InsertFailure::Storage)?;

        let conn = self.lock();
        let created_at = now_key();
        conn.execute(
            "INSERT INTO readings (timestamp, device_id, temperature_celsius, location, name, \
             device_type, humidity_percent, pm25_ugm3, voc_ppb, co_ppm, co2_ppm, iaq_score, \
             battery_level, signal_strength, thermostat_mode, thermostat_state, raw_response, \
             created_at, is_anomaly) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                key,
                reading.device_id,
                reading.temperature_celsius,
                reading.location,
                reading.name,
                reading.device_type.as_str(),
                reading.humidity_percent,
                reading.pm25_ugm3,
                reading.voc_ppb,
                reading.co_ppm,
                reading.co2_ppm,
                reading.iaq_score,
                reading.battery_level,
                reading.signal_strength,
                reading.thermostat_mode,
                reading.thermostat_state,
                reading.raw_response,
                created_at,
                reading.is_anomalous(),
            ],
        )
        .map(|_| ())
        .map_err(|e| {
            if is_unique_violation(&e) {
                InsertFailure::Duplicate
            } else {
                InsertFailure::Storage(storage_error(e, &self.display_path()))
            }
        })
    }

    /// Insert a batch, one transaction per reading so a bad row never
    /// discards its neighbours. Stops at the first hard error.
    pub fn insert_many(&self, readings: &[Reading]) -> Result<InsertSummary> {
        let mut summary = InsertSummary::default();
        for reading in readings {
            if self.insert(reading)? {
                summary.inserted += 1;
            } else {
                summary.duplicates += 1;
            }
        }
        Ok(summary)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.lock();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))
            .map_err(|e| storage_error(e, &self.display_path()))?;
        Ok(n as u64)
    }

    pub fn count_for_device(&self, device_id: &str) -> Result<u64> {
        let conn = self.lock();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM readings WHERE device_id = ?1",
                [device_id],
                |row| row.get(0),
            )
            .map_err(|e| storage_error(e, &self.display_path()))?;
        Ok(n as u64)
    }

    /// Most recent reading for a device.
    pub fn latest_for_device(&self, device_id: &str) -> Result<Option<Reading>> {
        let conn = self.lock();
        conn.query_row(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM readings WHERE device_id = ?1 \
                 ORDER BY timestamp DESC LIMIT 1"
            ),
            [device_id],
            reading_from_row,
        )
        .optional()
        .map_err(|e| storage_error(e, &self.display_path()).into())
    }

    /// Readings in `[start, end)`, oldest first, optionally for one device.
    pub fn readings_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        device_id: Option<&str>,
    ) -> Result<Vec<Reading>> {
        let start_key = time_key(start);
        let end_key = time_key(end);
        let conn = self.lock();
        let map_err = |e| storage_error(e, &self.display_path());

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM readings \
                 WHERE timestamp >= ?1 AND timestamp < ?2 AND (?3 IS NULL OR device_id = ?3) \
                 ORDER BY timestamp, device_id"
            ))
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![start_key, end_key, device_id], reading_from_row)
            .map_err(map_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| storage_error(e, &self.display_path()).into())
    }

    /// Rewrite `name` on every stored reading of a device.
    pub fn rename_device_readings(&self, device_id: &str, name: &str) -> Result<usize> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE readings SET name = ?1 WHERE device_id = ?2",
                params![name, device_id],
            )
            .map_err(|e| storage_error(e, &self.display_path()))?;
        info!(device_id, name, rows = changed, "Renamed historical readings");
        Ok(changed)
    }

    /// Take the write lock, insert a probe row, and roll back.
    ///
    /// Surfaces disk-full and permission problems as
    /// [`StorageError::NotWritable`] without leaving data behind.
    pub fn probe_writable(&self) -> Result<()> {
        let display = self.display_path();
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| storage_error(e, &display))?;
        tx.execute(
            "INSERT INTO readings (timestamp, device_id, temperature_celsius, device_type, created_at) \
             VALUES (?1, '__homewatch_probe__', 0, 'weather_api', ?1)",
            [now_key()],
        )
        .map_err(|e| storage_error(e, &display))?;
        tx.rollback().map_err(|e| storage_error(e, &display))?;
        Ok(())
    }

    /// Fold the WAL back into the main file and truncate it.
    pub fn checkpoint(&self) -> Result<CheckpointResult> {
        let conn = self.lock();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
            Ok(CheckpointResult {
                busy: row.get::<_, i64>(0)? != 0,
                wal_pages: row.get(1)?,
                checkpointed_pages: row.get(2)?,
            })
        })
        .map_err(|e| storage_error(e, &self.display_path()).into())
    }

    pub fn journal_mode(&self) -> Result<String> {
        let conn = self.lock();
        conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .map_err(|e| storage_error(e, &self.display_path()).into())
    }

    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.lock();
        user_version(&conn).map_err(|e| storage_error(e, &self.display_path()).into())
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let journal_mode = self.journal_mode()?;
        let schema_version = self.schema_version()?;
        let conn = self.lock();
        let (total, devices, anomalies, oldest, newest) = conn
            .query_row(
                "SELECT COUNT(*), COUNT(DISTINCT device_id), COALESCE(SUM(is_anomaly), 0), \
                 MIN(timestamp), MAX(timestamp) FROM readings",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .map_err(|e| storage_error(e, &self.display_path()))?;

        let db_size_bytes = self
            .path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len());

        Ok(StoreStats {
            total_readings: total as u64,
            devices: devices as u64,
            anomalies: anomalies as u64,
            oldest,
            newest,
            db_size_bytes,
            journal_mode,
            schema_version,
        })
    }
}

/// Create the schema if absent, otherwise add any missing columns.
///
/// Never drops or rewrites existing columns.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    let map = |e| storage_error(e, "schema");
    let current = user_version(conn).map_err(map)?;
    if current > SCHEMA_VERSION {
        return Err(StorageError::SchemaTooNew {
            current,
            supported: SCHEMA_VERSION,
        }
        .into());
    }

    conn.execute_batch(SCHEMA_SQL).map_err(map)?;

    let existing = existing_columns(conn).map_err(map)?;
    for (column, decl) in ADDITIVE_COLUMNS {
        if !existing.iter().any(|c| c == column) {
            conn.execute_batch(&format!("ALTER TABLE readings ADD COLUMN {column} {decl};"))
                .map_err(map)?;
            warn!(column, "Migrated readings table: added missing column");
        }
    }

    ensure_unique_key(conn).map_err(map)?;
    conn.execute_batch(INDEX_SQL).map_err(map)?;
    if current != SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(map)?;
        info!(from = current, to = SCHEMA_VERSION, "Schema version updated");
    }
    Ok(())
}

/// Guarantee a unique index on `(device_id, timestamp)`.
///
/// Tables created by older versions may lack the UNIQUE constraint. Rows that
/// repeat a key are collapsed onto the earliest one before the index is built.
fn ensure_unique_key(conn: &Connection) -> rusqlite::Result<()> {
    if has_unique_key(conn)? {
        return Ok(());
    }
    let removed = conn.execute(
        "DELETE FROM readings WHERE rowid NOT IN \
         (SELECT MIN(rowid) FROM readings GROUP BY device_id, timestamp)",
        [],
    )?;
    if removed > 0 {
        warn!(removed, "Collapsed duplicate readings before adding unique key");
    }
    conn.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_readings_device_timestamp \
         ON readings(device_id, timestamp);",
    )?;
    info!("Added unique key on (device_id, timestamp)");
    Ok(())
}

fn has_unique_key(conn: &Connection) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare("PRAGMA index_list(readings)")?;
    let unique_indexes = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, bool>(2)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for (index, unique) in unique_indexes {
        if !unique {
            continue;
        }
        let mut info = conn.prepare(&format!("PRAGMA index_info(\"{index}\")"))?;
        let mut columns = info
            .query_map([], |row| row.get::<_, Option<String>>(2))?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();
        columns.sort();
        if columns == ["device_id", "timestamp"] {
            return Ok(true);
        }
    }
    Ok(false)
}

fn user_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

fn existing_columns(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA table_info(readings)")?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    names.collect()
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

/// Map a SQLite failure onto the store's error taxonomy.
fn storage_error(err: rusqlite::Error, path: &str) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            let detail = msg.clone().unwrap_or_else(|| e.to_string());
            match e.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StorageError::Locked(detail),
                ErrorCode::ConstraintViolation => StorageError::ConstraintViolation(detail),
                ErrorCode::DiskFull
                | ErrorCode::ReadOnly
                | ErrorCode::PermissionDenied
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure => StorageError::NotWritable {
                    path: path.to_string(),
                    reason: detail,
                },
                _ => StorageError::Database(detail),
            }
        }
        _ => StorageError::Database(err.to_string()),
    }
}

/// SQLite stores NaN as NULL; refuse it instead of letting it vanish.
fn reject_non_finite(reading: &Reading) -> std::result::Result<(), StorageError> {
    let fields = [
        ("temperature_celsius", Some(reading.temperature_celsius)),
        ("humidity_percent", reading.humidity_percent),
        ("pm25_ugm3", reading.pm25_ugm3),
        ("voc_ppb", reading.voc_ppb),
        ("co_ppm", reading.co_ppm),
        ("co2_ppm", reading.co2_ppm),
        ("iaq_score", reading.iaq_score),
    ];
    for (field, value) in fields {
        if value.is_some_and(|v| !v.is_finite()) {
            return Err(StorageError::ConstraintViolation(format!(
                "{field} is not a finite number"
            )));
        }
    }
    Ok(())
}

fn time_key(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn now_key() -> String {
    time_key(Utc::now())
}

fn parse_time(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<Reading> {
    let timestamp: String = row.get(0)?;
    let device_type: String = row.get(5)?;
    let created_at: Option<String> = row.get(17)?;

    Ok(Reading {
        timestamp: parse_time(0, &timestamp)?,
        device_id: row.get(1)?,
        temperature_celsius: row.get(2)?,
        location: row.get(3)?,
        name: row.get(4)?,
        device_type: device_type.parse::<DeviceType>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        humidity_percent: row.get(6)?,
        pm25_ugm3: row.get(7)?,
        voc_ppb: row.get(8)?,
        co_ppm: row.get(9)?,
        co2_ppm: row.get(10)?,
        iaq_score: row.get(11)?,
        battery_level: row.get(12)?,
        signal_strength: row.get(13)?,
        thermostat_mode: row.get(14)?,
        thermostat_state: row.get(15)?,
        raw_response: row.get(16)?,
        created_at: created_at.as_deref().map(|t| parse_time(17, t)).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 12, minute, 0).unwrap()
    }

    fn reading(device: &str, minute: u32, temp: f64) -> Reading {
        Reading::new(device, DeviceType::HueSensor, ts(minute), temp).location("Hall")
    }

    #[test]
    fn insert_then_duplicate_returns_false() {
        let store = ReadingStore::open_in_memory().unwrap();
        assert!(store.insert(&reading("hue:1", 0, 21.0)).unwrap());
        assert!(!store.insert(&reading("hue:1", 0, 22.0)).unwrap());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn same_instant_different_offsets_is_duplicate() {
        let store = ReadingStore::open_in_memory().unwrap();
        let local = DateTime::parse_from_rfc3339("2025-01-15T13:00:00+01:00")
            .unwrap()
            .with_timezone(&Utc);
        let a = Reading::new("hue:1", DeviceType::HueSensor, ts(0), 21.0);
        let b = Reading::new("hue:1", DeviceType::HueSensor, local, 21.0);
        assert!(store.insert(&a).unwrap());
        assert!(!store.insert(&b).unwrap());
    }

    #[test]
    fn out_of_range_temperature_is_hard_error() {
        let store = ReadingStore::open_in_memory().unwrap();
        let err = store.insert(&reading("hue:1", 0, 55.0)).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Storage(StorageError::ConstraintViolation(_))
        ));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn out_of_range_optional_fields_are_rejected() {
        let store = ReadingStore::open_in_memory().unwrap();
        assert!(store.insert(&reading("a", 0, 20.0).humidity(101.0)).is_err());
        assert!(store.insert(&reading("b", 0, 20.0).battery(-1)).is_err());
        assert!(store.insert(&reading("c", 0, 20.0).signal(200)).is_err());
        let mut r = reading("d", 0, 20.0);
        r.pm25_ugm3 = Some(-0.5);
        assert!(store.insert(&r).is_err());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn nan_is_rejected_not_nulled() {
        let store = ReadingStore::open_in_memory().unwrap();
        let mut r = reading("hue:1", 0, 20.0);
        r.co2_ppm = Some(f64::NAN);
        let err = store.insert(&r).unwrap_err();
        assert!(err.to_string().contains("co2_ppm"));
    }

    #[test]
    fn latest_and_range_queries() {
        let store = ReadingStore::open_in_memory().unwrap();
        for minute in [5, 1, 3] {
            store.insert(&reading("hue:1", minute, 20.0 + f64::from(minute))).unwrap();
        }
        store.insert(&reading("hue:2", 2, 19.0)).unwrap();

        let latest = store.latest_for_device("hue:1").unwrap().unwrap();
        assert_eq!(latest.timestamp, ts(5));
        assert_eq!(latest.temperature_celsius, 25.0);
        assert!(latest.created_at.is_some());
        assert!(store.latest_for_device("missing").unwrap().is_none());

        let all = store.readings_between(ts(0), ts(4), None).unwrap();
        let minutes: Vec<_> = all.iter().map(|r| r.timestamp).collect();
        assert_eq!(minutes, vec![ts(1), ts(2), ts(3)]);

        let one = store.readings_between(ts(0), ts(10), Some("hue:2")).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].device_type, DeviceType::HueSensor);
    }

    #[test]
    fn rename_rewrites_only_that_device() {
        let store = ReadingStore::open_in_memory().unwrap();
        store.insert(&reading("hue:1", 0, 20.0).name("Hall Sensor")).unwrap();
        store.insert(&reading("hue:1", 1, 20.0).name("Hall Sensor")).unwrap();
        store.insert(&reading("hue:2", 0, 20.0).name("Hall Sensor")).unwrap();

        assert_eq!(store.rename_device_readings("hue:1", "Front Door").unwrap(), 2);
        let other = store.latest_for_device("hue:2").unwrap().unwrap();
        assert_eq!(other.name.as_deref(), Some("Hall Sensor"));
        let renamed = store.latest_for_device("hue:1").unwrap().unwrap();
        assert_eq!(renamed.name.as_deref(), Some("Front Door"));
    }

    #[test]
    fn anomalies_are_flagged() {
        let store = ReadingStore::open_in_memory().unwrap();
        store.insert(&reading("hue:1", 0, 21.0)).unwrap();
        store.insert(&reading("hue:1", 1, 40.0)).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_readings, 2);
        assert_eq!(stats.anomalies, 1);
        assert_eq!(stats.devices, 1);
        assert_eq!(stats.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn probe_leaves_no_rows() {
        let store = ReadingStore::open_in_memory().unwrap();
        store.probe_writable().unwrap();
        store.probe_writable().unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn insert_many_counts_duplicates() {
        let store = ReadingStore::open_in_memory().unwrap();
        let batch = vec![
            reading("hue:1", 0, 20.0),
            reading("hue:1", 0, 20.0),
            reading("hue:1", 1, 20.0),
        ];
        let summary = store.insert_many(&batch).unwrap();
        assert_eq!(
            summary,
            InsertSummary {
                inserted: 2,
                duplicates: 1
            }
        );
    }

    #[test]
    fn legacy_table_is_migrated_additively() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                device_id TEXT NOT NULL,
                temperature_celsius REAL NOT NULL,
                device_type TEXT NOT NULL,
                UNIQUE (device_id, timestamp)
            );
            INSERT INTO readings (timestamp, device_id, temperature_celsius, device_type)
            VALUES ('2024-06-01T00:00:00.000000Z', 'old:1', 18.5, 'hue_sensor');",
        )
        .unwrap();

        initialize_schema(&conn).unwrap();

        let columns = existing_columns(&conn).unwrap();
        for (column, _) in ADDITIVE_COLUMNS {
            assert!(columns.iter().any(|c| c == column), "missing {column}");
        }
        let kept: f64 = conn
            .query_row(
                "SELECT temperature_celsius FROM readings WHERE device_id = 'old:1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(kept, 18.5);
        assert_eq!(user_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        let err = initialize_schema(&conn).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Storage(StorageError::SchemaTooNew { .. })
        ));
    }
}
