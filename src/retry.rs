//! Bounded retry with exponential backoff and jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::MailError;

/// Retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "crate::config::duration_secs")]
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    #[serde(with = "crate::config::duration_secs")]
    pub max_delay: Duration,
    /// Growth factor between retries.
    pub exponential_base: f64,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Executes an operation, retrying transient failures.
///
/// Only errors for which [`MailError::is_retryable`] holds are retried.
/// Anything else (a permanent rejection, an open circuit) is returned
/// straight away without using up an attempt.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff before retry `retry` (0 = the delay after the first failure).
    ///
    /// `min(base_delay * exponential_base^retry, max_delay)`, then scaled by
    /// a uniform factor in `[0.5, 1.0]` when jitter is on.
    ///
    /// ```
    /// use courier::retry::{RetryConfig, RetryPolicy};
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::new(RetryConfig { jitter: false, ..RetryConfig::default() });
    /// assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    /// assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    /// assert_eq!(policy.delay_for(10), Duration::from_secs(60));
    /// ```
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.config.base_delay.as_secs_f64();
        let max = self.config.max_delay.as_secs_f64();
        let exp = self.config.exponential_base.powi(retry.min(i32::MAX as u32) as i32);

        let mut delay = (base * exp).min(max);
        if !delay.is_finite() || delay < 0.0 {
            delay = max;
        }
        if self.config.jitter {
            delay *= rand::thread_rng().gen_range(0.5..=1.0);
        }
        Duration::from_secs_f64(delay)
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of
    /// attempts. Returns the first success or the last error.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, MailError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, MailError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() || attempt >= max_attempts => return Err(err),
                Err(err) => {
                    let delay = self.delay_for(attempt - 1);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
