//! Device registry: stable device ids mapped to editable names and locations.
//!
//! Backed by a YAML file keyed by `unique_id` so an operator can fix a name
//! with a text editor. Every operation re-reads the file, so hand edits take
//! effect on the next call without a restart.
//!
//! Read-modify-write cycles are serialized by an in-process mutex and an
//! exclusive `fs2` lock on `<registry>.lock`, so two collectors registering
//! devices at the same moment never lose each other's entries.
//!
//! Naming rules:
//! - A new device gets `"{location} {TypeLabel}"`, or just `TypeLabel`.
//! - When a known device moves, its name is re-inferred only if it still
//!   equals what inference produced for the old location.
//! - Names set through [`DeviceRegistry::set_name`] are never overwritten.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RegistryError, Result};
use crate::reading::DeviceType;
use crate::storage::ReadingStore;

const FILE_HEADER: &str = "# homewatch device registry\n# Keys are device ids. Edit `name` freely; other fields are refreshed by collectors.\n";

/// On-disk record. The id is the map key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DeviceRecord {
    name: String,
    #[serde(default)]
    location: Option<String>,
    device_type: DeviceType,
    #[serde(default)]
    model_info: Option<String>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// One known device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub unique_id: String,
    pub device_type: DeviceType,
    pub name: String,
    pub location: Option<String>,
    pub model_info: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl DeviceEntry {
    fn from_record(unique_id: &str, record: &DeviceRecord) -> Self {
        Self {
            unique_id: unique_id.to_string(),
            device_type: record.device_type,
            name: record.name.clone(),
            location: record.location.clone(),
            model_info: record.model_info.clone(),
            first_seen: record.first_seen,
            last_seen: record.last_seen,
        }
    }

    /// Whether the name was set by a person rather than inferred.
    #[must_use]
    pub fn has_custom_name(&self) -> bool {
        self.name != infer_name(self.location.as_deref(), self.device_type)
    }
}

/// Display name derived from location and device type.
#[must_use]
pub fn infer_name(location: Option<&str>, device_type: DeviceType) -> String {
    match location.map(str::trim).filter(|l| !l.is_empty()) {
        Some(location) => format!("{location} {}", device_type.label()),
        None => device_type.label().to_string(),
    }
}

fn normalize_location(location: Option<&str>) -> Option<String> {
    location
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
}

type Records = BTreeMap<String, DeviceRecord>;

/// YAML-backed registry of known devices.
#[derive(Debug)]
pub struct DeviceRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
}

impl DeviceRegistry {
    /// Registry stored at `path`. The file is created on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
            guard: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a sighting of a device and return its display name.
    pub fn register(
        &self,
        unique_id: &str,
        device_type: DeviceType,
        location: Option<&str>,
        model_info: Option<&str>,
    ) -> Result<String> {
        let location = normalize_location(location);
        let now = Utc::now();

        self.update(|records| {
            let Some(record) = records.get_mut(unique_id) else {
                let name = infer_name(location.as_deref(), device_type);
                info!(unique_id, device_type = %device_type, name = %name, "Registered new device");
                records.insert(
                    unique_id.to_string(),
                    DeviceRecord {
                        name: name.clone(),
                        location,
                        device_type,
                        model_info: model_info.map(str::to_string),
                        first_seen: now,
                        last_seen: now,
                    },
                );
                return Ok(name);
            };

            if record.device_type != device_type {
                return Err(RegistryError::DeviceTypeChanged {
                    unique_id: unique_id.to_string(),
                    stored: record.device_type.to_string(),
                    requested: device_type.to_string(),
                }
                .into());
            }

            record.last_seen = now;
            if let Some(model) = model_info {
                record.model_info = Some(model.to_string());
            }

            if record.location != location {
                let previous = infer_name(record.location.as_deref(), record.device_type);
                if record.name == previous {
                    let renamed = infer_name(location.as_deref(), device_type);
                    info!(
                        unique_id,
                        old_name = %record.name,
                        new_name = %renamed,
                        "Device moved, re-inferred name"
                    );
                    record.name = renamed;
                } else {
                    debug!(unique_id, name = %record.name, "Device moved, keeping custom name");
                }
                record.location = location;
            }

            Ok(record.name.clone())
        })
    }

    /// Overwrite a device's display name. Stored readings are untouched.
    pub fn set_name(&self, unique_id: &str, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::InvalidName {
                unique_id: unique_id.to_string(),
                reason: "name is empty".to_string(),
            }
            .into());
        }

        self.update(|records| {
            let record = records
                .get_mut(unique_id)
                .ok_or_else(|| RegistryError::UnknownDevice(unique_id.to_string()))?;
            info!(unique_id, old_name = %record.name, new_name = name, "Device renamed");
            record.name = name.to_string();
            Ok(())
        })
    }

    /// Rename a device and rewrite the name on all of its stored readings.
    pub fn set_name_with_history(
        &self,
        unique_id: &str,
        name: &str,
        store: &ReadingStore,
    ) -> Result<usize> {
        self.set_name(unique_id, name)?;
        store.rename_device_readings(unique_id, name.trim())
    }

    pub fn get(&self, unique_id: &str) -> Result<Option<DeviceEntry>> {
        self.read(|records| {
            records
                .get(unique_id)
                .map(|r| DeviceEntry::from_record(unique_id, r))
        })
    }

    /// All devices sorted by id, optionally restricted to one type.
    pub fn list(&self, device_type: Option<DeviceType>) -> Result<Vec<DeviceEntry>> {
        self.read(|records| {
            records
                .iter()
                .filter(|(_, r)| device_type.is_none_or(|t| r.device_type == t))
                .map(|(id, r)| DeviceEntry::from_record(id, r))
                .collect()
        })
    }

    /// Forget a device. Returns whether it was known.
    pub fn remove(&self, unique_id: &str) -> Result<bool> {
        self.update(|records| {
            let removed = records.remove(unique_id).is_some();
            if removed {
                info!(unique_id, "Device removed from registry");
            }
            Ok(removed)
        })
    }

    fn read<T>(&self, f: impl FnOnce(&Records) -> T) -> Result<T> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let records = self.load()?;
        Ok(f(&records))
    }

    /// Load, mutate and persist under both locks.
    fn update<T>(&self, f: impl FnOnce(&mut Records) -> Result<T>) -> Result<T> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);

        ensure_parent_dir(&self.lock_path)?;
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| self.lock_failed(&e))?;
        FileExt::lock_exclusive(&lock_file).map_err(|e| self.lock_failed(&e))?;

        let result = self.load().and_then(|mut records| {
            let value = f(&mut records)?;
            self.save(&records)?;
            Ok(value)
        });

        let _ = FileExt::unlock(&lock_file);
        result
    }

    fn lock_failed(&self, err: &std::io::Error) -> RegistryError {
        RegistryError::LockFailed {
            path: self.path.display().to_string(),
            reason: err.to_string(),
        }
    }

    fn load(&self) -> Result<Records> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Records::new()),
            Err(e) => return Err(e.into()),
        };
        let parsed: Option<Records> =
            serde_yaml::from_str(&content).map_err(|e| RegistryError::Malformed {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(parsed.unwrap_or_default())
    }

    /// Write to a temp file and rename it into place.
    fn save(&self, records: &Records) -> Result<()> {
        ensure_parent_dir(&self.path)?;
        let body = serde_yaml::to_string(records)?;
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        std::fs::write(&tmp_path, format!("{FILE_HEADER}{body}"))?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
