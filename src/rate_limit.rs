//! Sliding-window rate limiting keyed by operation (and optionally recipient).

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::message::Message;

/// Rate limit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Calls admitted per window and key.
    pub max_calls: u32,
    /// Length of the trailing window.
    #[serde(with = "crate::config::duration_secs")]
    pub window: Duration,
    /// Add the first `to` recipient to the key.
    pub per_recipient: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 100,
            window: Duration::from_secs(60),
            per_recipient: false,
        }
    }
}

impl RateLimitConfig {
    /// `calls` per minute.
    pub fn per_minute(calls: u32) -> Self {
        Self {
            max_calls: calls,
            ..Self::default()
        }
    }
}

/// Per-key sliding-window admission control.
///
/// Each key keeps the instants of the calls admitted within the trailing
/// window. Entries older than the window are dropped on every check.
///
/// ```
/// use courier::rate_limit::{RateLimitConfig, RateLimiter};
/// use std::time::Duration;
///
/// let limiter = RateLimiter::new(RateLimitConfig {
///     max_calls: 1,
///     window: Duration::from_secs(60),
///     per_recipient: false,
/// });
///
/// assert!(limiter.admit("deliver:smtp").is_zero());
/// assert!(limiter.admit("deliver:smtp") > Duration::ZERO);
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    calls: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Key for delivering `message` through `provider`.
    pub fn key_for(&self, provider: &str, message: &Message) -> String {
        let mut key = format!("deliver:{}", provider);
        if self.config.per_recipient {
            if let Some(first) = message.to.first() {
                key.push(':');
                key.push_str(&first.normalized());
            }
        }
        key
    }

    /// Try to admit one call for `key`.
    ///
    /// Returns [`Duration::ZERO`] and records the call when the key has
    /// capacity. Otherwise nothing is recorded and the returned duration is
    /// how long until the oldest call leaves the window.
    pub fn admit(&self, key: &str) -> Duration {
        let now = Instant::now();
        let window = self.config.window;

        let mut calls = self.calls.lock();
        let history = calls.entry(key.to_string()).or_default();

        while let Some(oldest) = history.front() {
            if now.saturating_duration_since(*oldest) >= window {
                history.pop_front();
            } else {
                break;
            }
        }

        if history.len() < self.config.max_calls as usize {
            history.push_back(now);
            return Duration::ZERO;
        }

        match history.front() {
            // saturating_sub clamps a skewed clock to zero
            Some(oldest) => window.saturating_sub(now.saturating_duration_since(*oldest)),
            // max_calls == 0 never admits
            None => window,
        }
    }

    /// Wait until `key` has capacity, then record the call.
    ///
    /// Returns the total time spent waiting.
    pub async fn acquire(&self, key: &str) -> Duration {
        let started = Instant::now();
        loop {
            let wait = self.admit(key);
            if wait.is_zero() {
                return started.elapsed();
            }
            tracing::warn!(key = %key, wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Calls currently counted against `key`.
    pub fn in_window(&self, key: &str) -> usize {
        let now = Instant::now();
        self.calls
            .lock()
            .get(key)
            .map(|history| {
                history
                    .iter()
                    .filter(|at| now.saturating_duration_since(**at) < self.config.window)
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_calls: u32, secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_calls,
            window: Duration::from_secs(secs),
            per_recipient: false,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_capacity() {
        let limiter = limiter(3, 60);
        for _ in 0..3 {
            assert_eq!(limiter.admit("k"), Duration::ZERO);
        }
        assert_eq!(limiter.admit("k"), Duration::from_secs(60));
        assert_eq!(limiter.in_window("k"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_shrinks_as_window_slides() {
        let limiter = limiter(1, 60);
        assert!(limiter.admit("k").is_zero());

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(limiter.admit("k"), Duration::from_secs(40));

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(limiter.admit("k").is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = limiter(1, 60);
        assert!(limiter.admit("deliver:a").is_zero());
        assert!(limiter.admit("deliver:b").is_zero());
        assert!(!limiter.admit("deliver:a").is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_capacity() {
        let limiter = limiter(1, 60);
        assert!(limiter.acquire("k").await.is_zero());

        let waited = limiter.acquire("k").await;
        assert_eq!(waited, Duration::from_secs(60));
        assert_eq!(limiter.in_window("k"), 1);
    }

    #[test]
    fn test_key_derivation() {
        let message = Message::new().to("First@Example.com").to("second@example.com");

        let global = limiter(10, 60);
        assert_eq!(global.key_for("smtp", &message), "deliver:smtp");

        let per_recipient = RateLimiter::new(RateLimitConfig {
            per_recipient: true,
            ..RateLimitConfig::default()
        });
        assert_eq!(
            per_recipient.key_for("smtp", &message),
            "deliver:smtp:first@example.com"
        );
    }
}
