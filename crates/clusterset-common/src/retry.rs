//! Exponential backoff with jitter for startup-time operations
//!
//! Reconciliation passes never retry internally; the next tick is the retry.
//! This module is for the one-shot work around them, such as building the
//! client before the first pass.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Backoff configuration
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied after each failed attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Delay that follows `delay` after one more failure, capped at `max_delay`
    pub fn next_delay(&self, delay: Duration) -> Duration {
        let scaled = delay.as_secs_f64() * self.backoff_multiplier;
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Scale a delay by a random factor in [0.5, 1.5)
fn jittered(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

/// Run `operation` until it succeeds or `config.max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_while(config, operation_name, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but gives up immediately on errors that
/// [`Error::is_retryable`] rejects (validation, forbidden, ...).
pub async fn retry_retryable<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    retry_while(config, operation_name, operation, Error::is_retryable).await
}

async fn retry_while<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&e) {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "operation failed permanently"
            );
            return Err(e);
        }
        if config.exhausted(attempt) {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "operation failed after max retries"
            );
            return Err(e);
        }

        let wait = jittered(delay);
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = wait.as_millis(),
            "operation failed, retrying"
        );
        tokio::time::sleep(wait).await;
        delay = config.next_delay(delay);
    }
}
