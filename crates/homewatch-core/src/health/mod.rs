//! Health check coordinator.
//!
//! Runs independent [`Validator`]s one after another under a single
//! wall-clock budget and folds their results into a [`HealthCheckReport`].
//!
//! Each validator runs on its own worker thread. An `Err` or a panic becomes a
//! failed result for that validator only and the batch continues. When the
//! budget runs out, the validator in flight and every validator not yet run
//! are recorded as critical timeout failures. A timed-out worker thread is
//! detached, not killed.
//!
//! | Outcome                        | Status     | Exit code |
//! |--------------------------------|------------|-----------|
//! | all passed                     | `PASS`     | 0         |
//! | only non-critical failures     | `WARNING`  | 1         |
//! | any critical failure / timeout | `CRITICAL` | 2         |
//!
//! Messages and remediation text are redacted when the report is built, so
//! neither the text nor the JSON rendering can carry a raw credential.

pub mod validators;

use std::fmt::Write as _;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::config::Config;
use crate::error::{Remediation, Result};
use crate::redact::redact;

pub use validators::{
    AlertAbsentValidator, ConfigValidator, FnValidator, LogSinkValidator, RegistryValidator,
    SecretsValidator, StorageProbeValidator, UpstreamProbeValidator, default_validators,
};

/// A self-contained check.
///
/// Validators share no state with each other. They may touch the store, the
/// registry or the network, and they may block; the coordinator bounds them.
pub trait Validator: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Whether a failure of this validator makes the whole report critical.
    fn critical(&self) -> bool {
        false
    }

    fn validate(&self) -> Result<ValidatorResult>;
}

/// Outcome of one validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorResult {
    /// Filled in by the coordinator from [`Validator::name`].
    pub name: String,
    pub passed: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    pub critical: bool,
}

impl ValidatorResult {
    #[must_use]
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            passed: true,
            message: message.into(),
            remediation: None,
            critical: false,
        }
    }

    #[must_use]
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            ..Self::pass(message)
        }
    }

    #[must_use]
    pub fn with_remediation(mut self, text: impl Into<String>) -> Self {
        self.remediation = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_guidance(self, remediation: &Remediation) -> Self {
        self.with_remediation(remediation.render_plain().trim_end().to_string())
    }

    #[must_use]
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Failed and flagged critical.
    #[must_use]
    pub fn is_critical_failure(&self) -> bool {
        !self.passed && self.critical
    }
}

/// Aggregate status, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OverallStatus {
    Pass,
    Warning,
    Critical,
}

impl OverallStatus {
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Pass => 0,
            Self::Warning => 1,
            Self::Critical => 2,
        }
    }

    /// Fold results: any critical failure wins, then any failure.
    #[must_use]
    pub fn from_results(results: &[ValidatorResult]) -> Self {
        results.iter().fold(Self::Pass, |worst, r| {
            let status = if r.passed {
                Self::Pass
            } else if r.critical {
                Self::Critical
            } else {
                Self::Warning
            };
            worst.max(status)
        })
    }
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Result of a full health check run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckReport {
    pub overall_status: OverallStatus,
    pub exit_code: i32,
    pub checked_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub results: Vec<ValidatorResult>,
}

impl HealthCheckReport {
    /// Build a report, redacting every message and remediation.
    #[must_use]
    pub fn from_results(results: Vec<ValidatorResult>, elapsed: Duration) -> Self {
        let results: Vec<ValidatorResult> = results
            .into_iter()
            .map(|mut r| {
                r.message = redact(&r.message).into_owned();
                r.remediation = r.remediation.map(|text| redact(&text).into_owned());
                r
            })
            .collect();
        let overall_status = OverallStatus::from_results(&results);
        Self {
            overall_status,
            exit_code: overall_status.exit_code(),
            checked_at: Utc::now(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            results,
        }
    }

    pub fn successes(&self) -> impl Iterator<Item = &ValidatorResult> {
        self.results.iter().filter(|r| r.passed)
    }

    /// Non-critical failures.
    pub fn warnings(&self) -> impl Iterator<Item = &ValidatorResult> {
        self.results.iter().filter(|r| !r.passed && !r.critical)
    }

    /// Critical failures.
    pub fn failures(&self) -> impl Iterator<Item = &ValidatorResult> {
        self.results.iter().filter(|r| r.is_critical_failure())
    }

    #[must_use]
    pub fn result(&self, name: &str) -> Option<&ValidatorResult> {
        self.results.iter().find(|r| r.name == name)
    }

    /// Human-readable report; each failure is followed by its remediation.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "homewatch health: {}", self.overall_status);
        let _ = writeln!(out);

        for r in &self.results {
            let tag = if r.passed {
                "ok"
            } else if r.critical {
                "CRIT"
            } else {
                "WARN"
            };
            let _ = writeln!(out, "  [{tag:>4}] {}: {}", r.name, r.message);
            if !r.passed {
                if let Some(remediation) = &r.remediation {
                    for line in remediation.lines() {
                        let _ = writeln!(out, "         {line}");
                    }
                }
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{} checks: {} passed, {} warnings, {} critical ({} ms)",
            self.results.len(),
            self.successes().count(),
            self.warnings().count(),
            self.failures().count(),
            self.elapsed_ms
        );
        out
    }

    pub fn render_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Runs validators sequentially under one time budget.
pub struct HealthCheck {
    validators: Vec<Arc<dyn Validator>>,
    timeout: Duration,
}

impl std::fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheck")
            .field(
                "validators",
                &self.validators.iter().map(|v| v.name().to_string()).collect::<Vec<_>>(),
            )
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HealthCheck {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            validators: Vec::new(),
            timeout,
        }
    }

    /// The built-in validator set with the configured budget.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let mut check = Self::new(config.health_timeout());
        for validator in default_validators(config) {
            check.push(validator);
        }
        check
    }

    #[must_use]
    pub fn with_validator(mut self, validator: impl Validator) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    pub fn push(&mut self, validator: Arc<dyn Validator>) {
        self.validators.push(validator);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Run every validator and aggregate.
    #[must_use]
    pub fn run(&self) -> HealthCheckReport {
        let _span = info_span!(
            "health_check",
            validators = self.validators.len(),
            timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
        )
        .entered();

        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut results = Vec::with_capacity(self.validators.len());

        let mut pending = self.validators.iter();
        while let Some(validator) = pending.next() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                results.push(timeout_result(validator.as_ref(), "not run, time budget exhausted"));
                results.extend(
                    pending.by_ref().map(|v| timeout_result(v.as_ref(), "not run, time budget exhausted")),
                );
                break;
            }

            match run_isolated(validator, remaining) {
                Some(result) => results.push(result),
                None => {
                    warn!(validator = validator.name(), "Validator exceeded the time budget");
                    results.push(timeout_result(
                        validator.as_ref(),
                        &format!("timed out after {} ms", self.timeout.as_millis()),
                    ));
                    results.extend(
                        pending.by_ref().map(|v| timeout_result(v.as_ref(), "not run, time budget exhausted")),
                    );
                    break;
                }
            }
        }

        let report = HealthCheckReport::from_results(results, start.elapsed());
        info!(
            status = %report.overall_status,
            passed = report.successes().count(),
            warnings = report.warnings().count(),
            critical = report.failures().count(),
            elapsed_ms = report.elapsed_ms,
            "Health check complete"
        );
        report
    }
}

/// Run one validator on a worker thread. `None` means it did not finish in time.
fn run_isolated(validator: &Arc<dyn Validator>, budget: Duration) -> Option<ValidatorResult> {
    let name = validator.name().to_string();
    let critical = validator.critical();
    let (tx, rx) = channel::bounded(1);
    let worker = Arc::clone(validator);

    let spawned = std::thread::Builder::new()
        .name(format!("health-{name}"))
        .spawn(move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| worker.validate()));
            let _ = tx.send(outcome);
        });
    if let Err(e) = spawned {
        return Some(
            ValidatorResult::fail(format!("could not start validator thread: {e}"))
                .critical(critical)
                .named(&name),
        );
    }

    let result = match rx.recv_timeout(budget) {
        Ok(Ok(Ok(result))) => {
            let critical = result.critical || critical;
            result.critical(critical)
        }
        Ok(Ok(Err(err))) => {
            let failed = ValidatorResult::fail(format!("check failed: {err}")).critical(critical);
            match err.remediation() {
                Some(remediation) => failed.with_guidance(&remediation),
                None => failed,
            }
        }
        Ok(Err(panic)) => ValidatorResult::fail(format!(
            "validator panicked: {}",
            panic_message(panic.as_ref())
        ))
        .critical(critical),
        Err(RecvTimeoutError::Timeout) => return None,
        Err(RecvTimeoutError::Disconnected) => {
            ValidatorResult::fail("validator exited without a result").critical(critical)
        }
    };

    debug!(
        validator = %name,
        passed = result.passed,
        critical = result.critical,
        "Validator finished"
    );
    Some(result.named(&name))
}

fn timeout_result(validator: &dyn Validator, why: &str) -> ValidatorResult {
    ValidatorResult::fail(why)
        .with_remediation("Raise [health] timeout_secs or investigate the slow dependency.")
        .critical(true)
        .named(validator.name())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl ValidatorResult {
    fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}
