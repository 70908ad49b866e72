//! File-backed reading store: WAL mode, concurrent writers across
//! connections, and lock contention handling.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use homewatch_core::storage::{ReadingStore, StoreOptions};
use homewatch_core::{DeviceType, Error, Reading, StorageError};
use rusqlite::Connection;
use tempfile::TempDir;

fn reading(device: &str, minute: i64, temp: f64) -> Reading {
    let ts = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap() + chrono::Duration::minutes(minute);
    Reading::new(device, DeviceType::HueSensor, ts, temp).location("Hall")
}

fn options(busy_ms: u64, attempts: u32) -> StoreOptions {
    StoreOptions {
        busy_timeout: Duration::from_millis(busy_ms),
        lock_retry_attempts: attempts,
        ..StoreOptions::default()
    }
}

#[test]
fn file_store_uses_wal_and_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data/readings.db");

    {
        let store = ReadingStore::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(store.journal_mode().unwrap().to_lowercase(), "wal");
        assert!(store.insert(&reading("hue-1", 0, 21.0)).unwrap());
    }

    let store = ReadingStore::open(&path, StoreOptions::default()).unwrap();
    assert_eq!(store.count().unwrap(), 1);
    assert!(!store.insert(&reading("hue-1", 0, 21.0)).unwrap());
    assert_eq!(store.count().unwrap(), 1);
}

#[test]
fn constraint_free_legacy_table_still_dedups_and_range_checks() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("legacy.db");
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE readings (
                timestamp TEXT NOT NULL,
                device_id TEXT NOT NULL,
                temperature_celsius REAL NOT NULL,
                device_type TEXT NOT NULL
            );
            CREATE INDEX idx_readings_device_time ON readings(device_id, timestamp);
            INSERT INTO readings VALUES ('2025-01-15T12:00:00.000000Z', 'old', 18.5, 'hue_sensor');
            INSERT INTO readings VALUES ('2025-01-15T12:00:00.000000Z', 'old', 18.5, 'hue_sensor');
            INSERT INTO readings VALUES ('2025-01-15T12:01:00.000000Z', 'old', 61.0, 'hue_sensor');",
        )
        .unwrap();
    }

    let store = ReadingStore::open(&path, StoreOptions::default()).unwrap();
    assert_eq!(store.count_for_device("old").unwrap(), 2);

    assert!(store.insert(&reading("hue-1", 0, 21.0)).unwrap());
    assert!(!store.insert(&reading("hue-1", 0, 21.0)).unwrap());
    assert!(!store.insert(&reading("old", 0, 18.5)).unwrap());

    let err = store.insert(&reading("hue-1", 5, 55.0)).unwrap_err();
    assert!(matches!(err, Error::Storage(StorageError::ConstraintViolation(_))));
    assert_eq!(store.count().unwrap(), 3);
}

#[test]
fn concurrent_connections_store_each_reading_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("readings.db");
    ReadingStore::open(&path, StoreOptions::default()).unwrap();

    // Four "collectors", each with its own connection, overlapping on half
    // the readings.
    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let path = path.clone();
            thread::spawn(move || {
                let store = ReadingStore::open(&path, options(2_000, 8)).unwrap();
                let mut inserted = 0_u64;
                for minute in 0..25 {
                    let device = if minute % 2 == 0 {
                        "shared".to_string()
                    } else {
                        format!("own-{worker}")
                    };
                    if store.insert(&reading(&device, minute, 20.0)).unwrap() {
                        inserted += 1;
                    }
                }
                inserted
            })
        })
        .collect();

    let total_inserted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    let store = ReadingStore::open(&path, StoreOptions::default()).unwrap();

    // 13 shared minutes once, plus 12 odd minutes per worker.
    assert_eq!(store.count().unwrap(), 13 + 4 * 12);
    assert_eq!(total_inserted, 13 + 4 * 12);
    assert_eq!(store.count_for_device("shared").unwrap(), 13);
}

#[test]
fn shared_store_across_threads() {
    let store = Arc::new(ReadingStore::open_in_memory().unwrap());
    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for minute in 0..10 {
                    store.insert(&reading(&format!("t{worker}"), minute, 19.5)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(store.count().unwrap(), 40);
}

#[test]
fn held_write_lock_exhausts_retries_as_locked() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("readings.db");
    let store = ReadingStore::open(&path, options(0, 3)).unwrap();

    let blocker = Connection::open(&path).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

    let err = store.insert(&reading("hue-1", 0, 21.0)).unwrap_err();
    assert!(
        matches!(err, Error::Storage(StorageError::Locked(_))),
        "unexpected error: {err}"
    );

    blocker.execute_batch("ROLLBACK").unwrap();
    assert!(store.insert(&reading("hue-1", 0, 21.0)).unwrap());
}

#[test]
fn insert_succeeds_once_lock_is_released() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("readings.db");
    let store = ReadingStore::open(&path, options(0, 6)).unwrap();

    let blocker_path = path.clone();
    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let blocker = thread::spawn(move || {
        let conn = Connection::open(&blocker_path).unwrap();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        locked_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(80));
        conn.execute_batch("ROLLBACK").unwrap();
    });

    locked_rx.recv().unwrap();
    assert!(store.insert(&reading("hue-1", 0, 21.0)).unwrap());
    blocker.join().unwrap();
    assert_eq!(store.count().unwrap(), 1);
}

#[test]
fn out_of_range_reading_is_rejected_and_not_stored() {
    let dir = TempDir::new().unwrap();
    let store = ReadingStore::open(&dir.path().join("readings.db"), StoreOptions::default()).unwrap();

    let err = store.insert(&reading("hue-1", 0, 55.0)).unwrap_err();
    assert!(matches!(err, Error::Storage(StorageError::ConstraintViolation(_))));
    assert_eq!(store.count().unwrap(), 0);
}

#[test]
fn checkpoint_truncates_wal() {
    let dir = TempDir::new().unwrap();
    let store = ReadingStore::open(&dir.path().join("readings.db"), StoreOptions::default()).unwrap();
    for minute in 0..50 {
        store.insert(&reading("hue-1", minute, 20.0)).unwrap();
    }
    let result = store.checkpoint().unwrap();
    assert!(!result.busy);
    let stats = store.stats().unwrap();
    assert_eq!(stats.total_readings, 50);
    assert!(stats.db_size_bytes.unwrap_or(0) > 0);
}
