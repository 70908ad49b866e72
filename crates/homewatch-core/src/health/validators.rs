//! Built-in validators.

use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{Validator, ValidatorResult};
use crate::alerts::AlertFile;
use crate::config::{Config, UpstreamConfig};
use crate::error::{Remediation, Result};
use crate::registry::DeviceRegistry;
use crate::storage::{ReadingStore, StoreOptions};

/// Configuration ranges and paths.
#[derive(Debug, Clone)]
pub struct ConfigValidator {
    config: Config,
}

impl ConfigValidator {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl Validator for ConfigValidator {
    fn name(&self) -> &str {
        "config"
    }

    fn critical(&self) -> bool {
        true
    }

    fn validate(&self) -> Result<ValidatorResult> {
        match self.config.validate() {
            Ok(()) => Ok(ValidatorResult::pass(format!(
                "configuration valid, data dir {}",
                self.config.general.data_dir.display()
            ))),
            Err(err) => {
                let failed = ValidatorResult::fail(err.to_string());
                Ok(match err.remediation() {
                    Some(remediation) => failed.with_guidance(&remediation),
                    None => failed,
                })
            }
        }
    }
}

/// Required environment variables are set and non-empty.
///
/// Only names are reported, never values.
#[derive(Debug, Clone)]
pub struct SecretsValidator {
    required: Vec<String>,
}

impl SecretsValidator {
    #[must_use]
    pub fn new(required: Vec<String>) -> Self {
        Self { required }
    }
}

impl Validator for SecretsValidator {
    fn name(&self) -> &str {
        "secrets"
    }

    fn critical(&self) -> bool {
        true
    }

    fn validate(&self) -> Result<ValidatorResult> {
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|var| std::env::var(var.as_str()).map_or(true, |v| v.trim().is_empty()))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            return Ok(ValidatorResult::pass(format!(
                "{} required environment variables present",
                self.required.len()
            )));
        }
        Ok(ValidatorResult::fail(format!(
            "missing environment variables {}",
            missing.join(", ")
        ))
        .with_guidance(
            &Remediation::new("Export the missing variables in the collector's environment.")
                .alternative("Remove names from [health] required_env if a collector is retired."),
        ))
    }
}

/// Opens the store and runs a write-then-rollback probe.
#[derive(Debug, Clone)]
pub struct StorageProbeValidator {
    db_path: PathBuf,
    options: StoreOptions,
}

impl StorageProbeValidator {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>, options: StoreOptions) -> Self {
        Self {
            db_path: db_path.into(),
            options,
        }
    }
}

impl Validator for StorageProbeValidator {
    fn name(&self) -> &str {
        "storage"
    }

    fn critical(&self) -> bool {
        true
    }

    fn validate(&self) -> Result<ValidatorResult> {
        let store = ReadingStore::open(&self.db_path, self.options.clone())?;
        store.probe_writable()?;
        let mode = store.journal_mode()?;
        if !mode.eq_ignore_ascii_case("wal") {
            return Ok(ValidatorResult::fail(format!(
                "{} is writable but runs in {mode} journal mode",
                self.db_path.display()
            ))
            .critical(false)
            .with_remediation("Reopen the store with hw store init to switch it to WAL."));
        }
        Ok(ValidatorResult::pass(format!(
            "{} writable in WAL mode, {} readings",
            self.db_path.display(),
            store.count()?
        )))
    }
}

/// The log directory is writable and rotation is bounded.
#[derive(Debug, Clone)]
pub struct LogSinkValidator {
    log_file: Option<PathBuf>,
    max_bytes: u64,
    backup_count: u32,
}

impl LogSinkValidator {
    #[must_use]
    pub fn new(log_file: Option<PathBuf>, max_bytes: u64, backup_count: u32) -> Self {
        Self {
            log_file,
            max_bytes,
            backup_count,
        }
    }
}

impl Validator for LogSinkValidator {
    fn name(&self) -> &str {
        "log_sink"
    }

    fn validate(&self) -> Result<ValidatorResult> {
        let Some(file) = &self.log_file else {
            return Ok(ValidatorResult::fail("file logging disabled, stderr only")
                .with_remediation("Set [logging] file to keep logs across restarts."));
        };
        if self.max_bytes == 0 {
            return Ok(ValidatorResult::fail("log rotation threshold is 0")
                .with_remediation("Set [logging] max_bytes to a positive size."));
        }

        let dir = file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), std::path::Path::to_path_buf);
        std::fs::create_dir_all(&dir)?;
        let probe = dir.join(".homewatch-write-probe");
        std::fs::write(&probe, b"probe")?;
        std::fs::remove_file(&probe)?;

        let bound = (u64::from(self.backup_count) + 1).saturating_mul(self.max_bytes);
        Ok(ValidatorResult::pass(format!(
            "{} writable, rotation at {} bytes with {} backups (max {} bytes on disk)",
            dir.display(),
            self.max_bytes,
            self.backup_count,
            bound
        )))
    }
}

/// Fails while an alert artifact exists.
#[derive(Debug, Clone)]
pub struct AlertAbsentValidator {
    name: String,
    alert: AlertFile,
    critical: bool,
    remediation: String,
}

impl AlertAbsentValidator {
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, critical: bool) -> Self {
        Self {
            name: name.into(),
            alert: AlertFile::at(path),
            critical,
            remediation: "Resolve the cause, then delete the alert file.".to_string(),
        }
    }

    #[must_use]
    pub fn log_rotation(path: impl Into<PathBuf>) -> Self {
        let mut validator = Self::new("log_rotation", path, true);
        validator.remediation =
            "Free disk space or release whatever holds the log file, then delete the alert file."
                .to_string();
        validator
    }

    #[must_use]
    pub fn upstream_auth(path: impl Into<PathBuf>) -> Self {
        let mut validator = Self::new("upstream_login", path, true);
        validator.remediation =
            "Refresh the vendor credentials; the collector clears the alert on its next successful login."
                .to_string();
        validator
    }
}

impl Validator for AlertAbsentValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn critical(&self) -> bool {
        self.critical
    }

    fn validate(&self) -> Result<ValidatorResult> {
        match self.alert.read()? {
            None => Ok(ValidatorResult::pass("no alert raised")),
            Some(alert) => Ok(ValidatorResult::fail(format!(
                "{} since {}: {}",
                alert.kind,
                alert.raised_at.format("%Y-%m-%d %H:%M:%S UTC"),
                alert.message
            ))
            .with_remediation(format!(
                "{}\nAlert file {}",
                self.remediation,
                self.alert.path().display()
            ))),
        }
    }
}

/// The device registry parses.
#[derive(Debug, Clone)]
pub struct RegistryValidator {
    path: PathBuf,
}

impl RegistryValidator {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Validator for RegistryValidator {
    fn name(&self) -> &str {
        "registry"
    }

    fn validate(&self) -> Result<ValidatorResult> {
        let devices = DeviceRegistry::new(&self.path).list(None)?;
        let custom = devices.iter().filter(|d| d.has_custom_name()).count();
        Ok(ValidatorResult::pass(format!(
            "{} devices registered ({custom} with custom names)",
            devices.len()
        )))
    }
}

/// TCP reachability of a vendor endpoint.
#[derive(Debug, Clone)]
pub struct UpstreamProbeValidator {
    name: String,
    upstream: UpstreamConfig,
}

impl UpstreamProbeValidator {
    #[must_use]
    pub fn new(upstream: UpstreamConfig) -> Self {
        Self {
            name: format!("upstream:{}", upstream.name),
            upstream,
        }
    }
}

impl Validator for UpstreamProbeValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn critical(&self) -> bool {
        self.upstream.critical
    }

    fn validate(&self) -> Result<ValidatorResult> {
        let target = format!("{}:{}", self.upstream.host, self.upstream.port);
        let timeout = Duration::from_millis(self.upstream.timeout_ms.max(1));
        let remediation = Remediation::new(format!(
            "Check that {} is powered on and reachable from this host.",
            self.upstream.name
        ))
        .command("Probe the port", format!("nc -vz {} {}", self.upstream.host, self.upstream.port));

        let addrs = match target.to_socket_addrs() {
            Ok(addrs) => addrs.collect::<Vec<_>>(),
            Err(e) => {
                return Ok(ValidatorResult::fail(format!("cannot resolve {target}: {e}"))
                    .with_guidance(&remediation));
            }
        };

        let mut last_error = None;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(_) => return Ok(ValidatorResult::pass(format!("reached {target} ({addr})"))),
                Err(e) => last_error = Some(e),
            }
        }
        let why = last_error.map_or_else(|| "no addresses".to_string(), |e| e.to_string());
        Ok(ValidatorResult::fail(format!("cannot reach {target}: {why}")).with_guidance(&remediation))
    }
}

type CheckFn = dyn Fn() -> Result<ValidatorResult> + Send + Sync;

/// Ad-hoc validator from a closure.
pub struct FnValidator {
    name: String,
    critical: bool,
    check: Box<CheckFn>,
}

impl FnValidator {
    pub fn new<F>(name: impl Into<String>, critical: bool, check: F) -> Self
    where
        F: Fn() -> Result<ValidatorResult> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            critical,
            check: Box::new(check),
        }
    }
}

impl std::fmt::Debug for FnValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnValidator")
            .field("name", &self.name)
            .field("critical", &self.critical)
            .finish_non_exhaustive()
    }
}

impl Validator for FnValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn critical(&self) -> bool {
        self.critical
    }

    fn validate(&self) -> Result<ValidatorResult> {
        (self.check)()
    }
}

/// Validators for a loaded configuration, in reporting order.
#[must_use]
pub fn default_validators(config: &Config) -> Vec<Arc<dyn Validator>> {
    let mut validators: Vec<Arc<dyn Validator>> = vec![
        Arc::new(ConfigValidator::new(config.clone())),
        Arc::new(SecretsValidator::new(config.health.required_env.clone())),
        Arc::new(StorageProbeValidator::new(
            config.db_path(),
            StoreOptions::from(&config.storage),
        )),
        Arc::new(LogSinkValidator::new(
            config.log_file(),
            config.logging.max_bytes,
            config.logging.backup_count,
        )),
        Arc::new(AlertAbsentValidator::log_rotation(config.rotation_alert_path())),
        Arc::new(AlertAbsentValidator::upstream_auth(config.auth_alert_path())),
        Arc::new(RegistryValidator::new(config.registry_path())),
    ];
    for upstream in &config.upstream {
        validators.push(Arc::new(UpstreamProbeValidator::new(upstream.clone())));
    }
    validators
}
