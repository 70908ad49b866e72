//! Health check aggregation, isolation and redaction through the public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use homewatch_core::config::Config;
use homewatch_core::error::UpstreamError;
use homewatch_core::health::{FnValidator, HealthCheck, OverallStatus, ValidatorResult};
use homewatch_core::alerts::{AlertFile, AlertKind};
use homewatch_core::Error;
use tempfile::TempDir;

fn pass(name: &str) -> FnValidator {
    FnValidator::new(name, false, || Ok(ValidatorResult::pass("fine")))
}

fn fail(name: &str, critical: bool) -> FnValidator {
    FnValidator::new(name, critical, || Ok(ValidatorResult::fail("not fine")))
}

fn budget() -> Duration {
    Duration::from_secs(10)
}

#[test]
fn one_critical_failure_is_critical() {
    let report = HealthCheck::new(budget())
        .with_validator(pass("config"))
        .with_validator(fail("storage", true))
        .with_validator(pass("registry"))
        .run();
    assert_eq!(report.overall_status, OverallStatus::Critical);
    assert_eq!(report.exit_code, 2);
}

#[test]
fn one_ordinary_failure_is_warning() {
    let report = HealthCheck::new(budget())
        .with_validator(pass("config"))
        .with_validator(fail("log_sink", false))
        .with_validator(pass("registry"))
        .run();
    assert_eq!(report.overall_status, OverallStatus::Warning);
    assert_eq!(report.exit_code, 1);
}

#[test]
fn all_passing_is_pass() {
    let report = HealthCheck::new(budget())
        .with_validator(pass("a"))
        .with_validator(pass("b"))
        .with_validator(pass("c"))
        .run();
    assert_eq!(report.overall_status, OverallStatus::Pass);
    assert_eq!(report.exit_code, 0);
    assert_eq!(report.successes().count(), 3);
}

#[test]
fn result_flag_can_escalate_a_non_critical_validator() {
    let report = HealthCheck::new(budget())
        .with_validator(FnValidator::new("auth", false, || {
            Ok(ValidatorResult::fail("token rejected").critical(true))
        }))
        .run();
    assert_eq!(report.exit_code, 2);
}

#[test]
fn panicking_validator_does_not_stop_the_rest() {
    let ran_after = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran_after);

    let report = HealthCheck::new(budget())
        .with_validator(FnValidator::new("explodes", false, || panic!("bridge exploded")))
        .with_validator(FnValidator::new("after", false, move || {
            flag.store(true, Ordering::SeqCst);
            Ok(ValidatorResult::pass("still ran"))
        }))
        .run();

    assert!(ran_after.load(Ordering::SeqCst));
    let exploded = report.result("explodes").unwrap();
    assert!(!exploded.passed);
    assert!(exploded.message.contains("bridge exploded"));
    assert!(report.result("after").unwrap().passed);
    assert_eq!(report.overall_status, OverallStatus::Warning);
}

#[test]
fn erroring_validator_is_a_failure_with_remediation() {
    let report = HealthCheck::new(budget())
        .with_validator(FnValidator::new("upstream:weather", false, || {
            Err(Error::Upstream(UpstreamError::Timeout(3000)))
        }))
        .run();
    let result = report.result("upstream:weather").unwrap();
    assert!(!result.passed);
    assert!(result.remediation.is_some());
    assert_eq!(report.exit_code, 1);
}

#[test]
fn budget_exhaustion_marks_running_and_unrun_as_critical() {
    let start = Instant::now();
    let report = HealthCheck::new(Duration::from_millis(200))
        .with_validator(pass("quick"))
        .with_validator(FnValidator::new("slow", false, || {
            std::thread::sleep(Duration::from_secs(2));
            Ok(ValidatorResult::pass("too late"))
        }))
        .with_validator(pass("never"))
        .run();

    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(report.results.len(), 3);
    assert!(report.result("quick").unwrap().passed);
    let slow = report.result("slow").unwrap();
    assert!(slow.is_critical_failure());
    assert!(slow.message.contains("timed out"));
    assert!(report.result("never").unwrap().is_critical_failure());
    assert_eq!(report.overall_status, OverallStatus::Critical);
    assert_eq!(report.exit_code, 2);
}

#[test]
fn long_token_never_reaches_the_report() {
    let token = "Zq8Kx2Lm9Np4Rt7Vw3Yb6Hd1";
    assert_eq!(token.len(), 24);

    let report = HealthCheck::new(budget())
        .with_validator(FnValidator::new("hue", false, move || {
            Ok(ValidatorResult::fail(format!("bridge refused key {token}"))
                .with_remediation(format!("Re-pair; current key {token} is stale")))
        }))
        .with_validator(FnValidator::new("cloud", false, || {
            Ok(ValidatorResult::fail("login failed password=hunter2"))
        }))
        .run();

    let text = report.render_text();
    let json = report.render_json().unwrap();
    for rendered in [&text, &json] {
        assert!(!rendered.contains(token));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
    }
}

#[test]
fn token_behind_an_underscore_prefix_is_redacted() {
    let token = "Zq8Kx2Lm9Np4Rt7Vw3Yb6Hd1";
    let report = HealthCheck::new(budget())
        .with_validator(FnValidator::new("cloud", false, move || {
            Ok(ValidatorResult::fail(format!("bridge refused sk_live_{token}"))
                .with_remediation(format!("rotate {token}_v2")))
        }))
        .run();

    let text = report.render_text();
    let json = report.render_json().unwrap();
    for rendered in [&text, &json] {
        assert!(!rendered.contains(token), "{rendered}");
        assert!(rendered.contains("sk_live_[REDACTED]"));
    }
}

#[test]
fn default_validators_pass_on_fresh_data_dir() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.general.data_dir = dir.path().to_path_buf();

    let report = HealthCheck::from_config(&config).run();
    assert_eq!(report.overall_status, OverallStatus::Pass, "{}", report.render_text());

    AlertFile::at(config.auth_alert_path())
        .raise(AlertKind::UpstreamAuthFailed, "refresh token expired")
        .unwrap();
    let report = HealthCheck::from_config(&config).run();
    assert_eq!(report.exit_code, 2);
    assert!(!report.result("upstream_login").unwrap().passed);
}
