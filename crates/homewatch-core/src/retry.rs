//! Retry with classified exponential backoff.
//!
//! Wraps any fallible operation that collectors run against the outside
//! world or the filesystem. Failures are switched on their [`ErrorKind`]:
//!
//! - `Permanent`: returned immediately, no sleep, logged at ERROR.
//! - `Transient`: retried after `base_delay * multiplier^(attempt-1)` until
//!   `max_attempts` is reached, then the last failure is returned.
//! - `Unknown`: retried like a transient failure, with a WARNING on each
//!   occurrence so unclassified errors get noticed and classified.
//!
//! # Usage
//!
//! ```rust,ignore
//! use homewatch_core::retry::{RetryPolicy, with_retry};
//!
//! let policy = RetryPolicy::network();
//! let body = with_retry(&policy, "hue.fetch_sensors", || bridge.fetch_sensors())?;
//! ```
//!
//! The executor holds no state between invocations, so independent
//! operations can be retried concurrently from any number of threads.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, warn};

use crate::config::RetryConfig;
use crate::error::{Classify, ErrorKind};

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Random jitter range as a fraction of the delay (0.1 = ±10%).
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            config.backoff_multiplier,
            Duration::from_millis(config.max_delay_ms),
        )
    }
}

impl RetryPolicy {
    /// Create a policy without jitter. Out-of-range values are clamped.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        backoff_multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff_multiplier: if backoff_multiplier.is_finite() {
                backoff_multiplier.max(1.0)
            } else {
                1.0
            },
            max_delay: max_delay.max(base_delay),
            jitter_percent: 0.0,
        }
    }

    /// Add ±`percent` random jitter to every delay.
    #[must_use]
    pub fn with_jitter(mut self, percent: f64) -> Self {
        self.jitter_percent = if percent.is_finite() {
            percent.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Vendor API calls: 3 attempts, 1s initial, 2x, 10% jitter.
    #[must_use]
    pub fn network() -> Self {
        Self::new(3, Duration::from_secs(1), 2.0, Duration::from_secs(30)).with_jitter(0.1)
    }

    /// Database lock contention: `attempts` tries, 50ms initial.
    #[must_use]
    pub fn db_lock(attempts: u32) -> Self {
        Self::new(attempts, Duration::from_millis(50), 2.0, Duration::from_secs(2))
    }

    /// Log file renames during rotation: 3 attempts, 10ms initial.
    #[must_use]
    pub fn file_rename() -> Self {
        Self::new(3, Duration::from_millis(10), 2.0, Duration::from_millis(200))
    }

    /// Delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_secs_f64() * 1000.0;
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;

        // Cap the exponent; 2^31 times any base delay already exceeds max_delay.
        let exp = attempt.saturating_sub(1).min(31) as i32;
        let delay_ms = (base_ms * self.backoff_multiplier.powi(exp)).min(max_ms);

        let jitter = if self.jitter_percent > 0.0 && delay_ms > 0.0 {
            let range = delay_ms * self.jitter_percent;
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        let total_ms = (delay_ms + jitter).max(0.0);
        Duration::from_micros((total_ms * 1000.0).round() as u64)
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// The result (success or final error).
    pub result: Result<T, E>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent (including delays).
    pub elapsed: Duration,
}

/// What the loop does after a failed attempt.
enum Step {
    Retry(Duration),
    GiveUp,
}

/// Classify a failure, log it and decide whether to try again.
fn after_failure<E>(policy: &RetryPolicy, operation: &str, attempt: u32, err: &E) -> Step
where
    E: Classify + Display,
{
    let max_attempts = policy.max_attempts;
    let kind = err.kind();

    if kind == ErrorKind::Permanent {
        error!(
            operation,
            attempt,
            max_attempts,
            error = %err,
            "Permanent failure, not retrying"
        );
        return Step::GiveUp;
    }

    if kind == ErrorKind::Unknown {
        warn!(
            operation,
            attempt,
            max_attempts,
            error = %err,
            "Unclassified failure, treating as transient"
        );
    }

    if attempt >= max_attempts {
        warn!(
            operation,
            attempt,
            max_attempts,
            delay_ms = 0u64,
            error = %err,
            "Operation failed after all retry attempts"
        );
        return Step::GiveUp;
    }

    let delay = policy.delay_for_attempt(attempt);
    warn!(
        operation,
        attempt,
        max_attempts,
        delay_ms = delay.as_millis() as u64,
        error = %err,
        "Retrying operation after transient failure"
    );
    Step::Retry(delay)
}

/// Run `op` under `policy`, returning its value or the classified error.
pub fn with_retry<T, E, F>(policy: &RetryPolicy, operation: &str, op: F) -> Result<T, E>
where
    E: Classify + Display,
    F: FnMut() -> Result<T, E>,
{
    with_retry_outcome(policy, operation, op).result
}

/// Like [`with_retry`], also reporting attempts and elapsed time.
pub fn with_retry_outcome<T, E, F>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> RetryOutcome<T, E>
where
    E: Classify + Display,
    F: FnMut() -> Result<T, E>,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op() {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        operation,
                        total_attempts = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) => match after_failure(policy, operation, attempt, &e) {
                Step::Retry(delay) => std::thread::sleep(delay),
                Step::GiveUp => {
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }
            },
        }
    }
}

/// Async variant for collectors running on tokio. Same classification rules.
pub async fn with_retry_async<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Classify + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        operation,
                        total_attempts = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(value);
            }
            Err(e) => match after_failure(policy, operation, attempt, &e) {
                Step::Retry(delay) => tokio::time::sleep(delay).await,
                Step::GiveUp => return Err(e),
            },
        }
    }
}
