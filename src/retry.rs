//! Retry helpers with exponential backoff
//!
//! Two flavours:
//! - [`retry_with_backoff`] retries an async operation in place, used for
//!   one-off startup calls such as CRD installation
//! - [`ErrorBackoff`] tracks consecutive reconcile failures per object so the
//!   controllers' error policy can requeue each object on its own schedule

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::time::Instant;
use tracing::{error, warn};

/// Retry policy for one-off calls made outside a reconcile
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Give up after this many attempts; 0 retries forever
    pub max_attempts: u32,
    /// Wait after the first failure
    pub initial_delay: Duration,
    /// Upper bound on a single wait
    pub max_delay: Duration,
    /// Growth factor applied to the wait after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default timings, bounded to `attempts` tries
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt >= self.max_attempts
    }

    fn grow(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.backoff_multiplier).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, sleeping with jittered exponential
/// backoff between failures. Returns the last error once `max_attempts`
/// tries have failed.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;
    loop {
        attempt = attempt.saturating_add(1);
        let e = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if config.exhausted(attempt) {
            error!(operation = %operation_name, attempt, error = %e, "giving up");
            return Err(e);
        }

        let wait = delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5));
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            wait_ms = wait.as_millis() as u64,
            "attempt failed, retrying"
        );
        tokio::time::sleep(wait).await;
        delay = config.grow(delay);
    }
}

/// Per-object failure counter driving reconcile error backoff
///
/// The delay doubles with every consecutive failure of the same key, from
/// `base` up to `max`. A successful reconcile resets the key. Keys that have
/// not failed for twice the cap are dropped, which covers objects deleted
/// while failing.
#[derive(Debug)]
pub struct ErrorBackoff {
    base: Duration,
    max: Duration,
    failures: DashMap<String, Failures>,
}

#[derive(Debug)]
struct Failures {
    count: u32,
    last: Instant,
}

impl Default for ErrorBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl ErrorBackoff {
    /// Create a tracker with the given bounds
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: DashMap::new(),
        }
    }

    /// Delay after a first failure
    pub fn initial_delay(&self) -> Duration {
        self.base
    }

    /// Record a failure of `key` and return how long to wait before retrying
    pub fn next_delay(&self, key: &str) -> Duration {
        let now = Instant::now();
        let stale_after = self.max.saturating_mul(2);
        self.failures
            .retain(|_, f| now.saturating_duration_since(f.last) <= stale_after);

        let mut failures = self
            .failures
            .entry(key.to_string())
            .or_insert(Failures { count: 0, last: now });
        let exponent = failures.count.min(16);
        failures.count = failures.count.saturating_add(1);
        failures.last = now;
        self.base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max)
    }

    /// Forget the failures of `key`
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|f| f.count).unwrap_or(0)
    }

    /// Number of keys currently tracked
    pub fn tracked(&self) -> usize {
        self.failures.len()
    }
}
