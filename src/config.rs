//! Courier configuration.
//!
//! Configure in code with struct update syntax, deserialize from any serde
//! format, or read from the environment:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `EMAIL_PROVIDER` | `default_provider` |
//! | `EMAIL_FALLBACK_PROVIDERS` | `fallback_providers` (comma separated) |
//! | `EMAIL_FROM` | `default_from_email` |
//! | `EMAIL_FROM_NAME` | `default_from_name` |
//! | `EMAIL_MAX_CONCURRENT_SENDS` | `max_concurrent_sends` |
//! | `EMAIL_QUEUE_ENABLED` | `queue_enabled` |
//! | `EMAIL_RATE_LIMIT_PER_MINUTE` | `rate_limit_per_minute` |
//! | `EMAIL_CIRCUIT_BREAKER_ENABLED` | `circuit_breaker_enabled` |
//! | `EMAIL_DEDUPLICATION_ENABLED` | `enable_deduplication` |
//! | `EMAIL_DEDUPLICATION_WINDOW_HOURS` | `deduplication_window_hours` |

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::address::Address;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::MailError;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryConfig;

/// Settings for a [`Courier`](crate::Courier).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// Provider tried first (after a per-call preferred provider).
    /// Falls back to the first registered provider.
    pub default_provider: Option<String>,
    /// Providers tried, in order, after the default.
    pub fallback_providers: Vec<String>,
    /// Global bound on in-flight immediate deliveries.
    pub max_concurrent_sends: usize,
    /// Hand scheduled and low-priority messages to the queue.
    pub queue_enabled: bool,
    /// Deliveries per provider per minute.
    pub rate_limit_per_minute: u32,
    /// Rate limit per provider and first recipient instead of per provider.
    pub rate_limit_per_recipient: bool,
    pub circuit_breaker_enabled: bool,
    pub enable_deduplication: bool,
    pub deduplication_window_hours: u64,
    /// Sender used when a message has none.
    pub default_from_email: Option<String>,
    pub default_from_name: Option<String>,
    /// Retries against a single provider.
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Bound on a single provider call.
    #[serde(with = "duration_secs")]
    pub provider_timeout: Duration,
    /// Pause between batches in [`send_bulk`](crate::Courier::send_bulk).
    #[serde(with = "duration_secs")]
    pub bulk_batch_pause: Duration,
    /// Delay before a failed queued message is attempted again.
    #[serde(with = "duration_secs")]
    pub queue_retry_delay: Duration,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            default_provider: None,
            fallback_providers: Vec::new(),
            max_concurrent_sends: 10,
            queue_enabled: true,
            rate_limit_per_minute: 60,
            rate_limit_per_recipient: false,
            circuit_breaker_enabled: true,
            enable_deduplication: true,
            deduplication_window_hours: 24,
            default_from_email: None,
            default_from_name: None,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            provider_timeout: Duration::from_secs(30),
            bulk_batch_pause: Duration::from_millis(100),
            queue_retry_delay: Duration::from_secs(300),
        }
    }
}

impl CourierConfig {
    /// Defaults overridden by `EMAIL_*` environment variables.
    ///
    /// Unset variables keep their defaults; a variable that does not parse
    /// is a [`MailError::Configuration`].
    pub fn from_env() -> Result<Self, MailError> {
        let mut config = Self::default();

        if let Some(provider) = env_string("EMAIL_PROVIDER") {
            config.default_provider = Some(provider.to_lowercase());
        }
        if let Some(list) = env_string("EMAIL_FALLBACK_PROVIDERS") {
            config.fallback_providers = list
                .split(',')
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect();
        }
        config.default_from_email = env_string("EMAIL_FROM").or(config.default_from_email);
        config.default_from_name = env_string("EMAIL_FROM_NAME").or(config.default_from_name);

        if let Some(n) = env_parse("EMAIL_MAX_CONCURRENT_SENDS")? {
            config.max_concurrent_sends = n;
        }
        if let Some(n) = env_parse("EMAIL_RATE_LIMIT_PER_MINUTE")? {
            config.rate_limit_per_minute = n;
        }
        if let Some(hours) = env_parse("EMAIL_DEDUPLICATION_WINDOW_HOURS")? {
            config.deduplication_window_hours = hours;
        }
        if let Some(flag) = env_bool("EMAIL_QUEUE_ENABLED")? {
            config.queue_enabled = flag;
        }
        if let Some(flag) = env_bool("EMAIL_CIRCUIT_BREAKER_ENABLED")? {
            config.circuit_breaker_enabled = flag;
        }
        if let Some(flag) = env_bool("EMAIL_DEDUPLICATION_ENABLED")? {
            config.enable_deduplication = flag;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the courier cannot run with.
    pub fn validate(&self) -> Result<(), MailError> {
        if self.max_concurrent_sends == 0 {
            return Err(MailError::Configuration(
                "max_concurrent_sends must be at least 1".into(),
            ));
        }
        if self.rate_limit_per_minute == 0 {
            return Err(MailError::Configuration(
                "rate_limit_per_minute must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(MailError::Configuration(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(MailError::Configuration(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if let Some(ref from) = self.default_from_email {
            Address::parse(from).map_err(|e| {
                MailError::Configuration(format!("default_from_email: {}", e))
            })?;
        }
        Ok(())
    }

    /// Configured default sender, if any.
    pub fn default_from(&self) -> Option<Address> {
        let email = self.default_from_email.as_ref()?;
        Some(match self.default_from_name {
            Some(ref name) => Address::with_name(name, email),
            None => Address::new(email),
        })
    }

    /// Rate limiter settings derived from this config.
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_calls: self.rate_limit_per_minute,
            window: Duration::from_secs(60),
            per_recipient: self.rate_limit_per_recipient,
        }
    }

    pub fn deduplication_window(&self) -> Duration {
        Duration::from_secs(self.deduplication_window_hours.saturating_mul(3600))
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, MailError> {
    match env_string(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| MailError::Configuration(format!("{} has invalid value '{}'", name, raw))),
    }
}

fn env_bool(name: &str) -> Result<Option<bool>, MailError> {
    match env_string(name) {
        None => Ok(None),
        Some(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(MailError::Configuration(format!(
                "{} must be a boolean, got '{}'",
                name, raw
            ))),
        },
    }
}

/// Serde helpers for durations written as (fractional) seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CourierConfig::default();
        assert_eq!(config.max_concurrent_sends, 10);
        assert!(config.queue_enabled);
        assert!(config.enable_deduplication);
        assert_eq!(config.deduplication_window(), Duration::from_secs(24 * 3600));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_secs(300));
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let bad = [
            CourierConfig {
                max_concurrent_sends: 0,
                ..CourierConfig::default()
            },
            CourierConfig {
                rate_limit_per_minute: 0,
                ..CourierConfig::default()
            },
            CourierConfig {
                retry: RetryConfig {
                    max_attempts: 0,
                    ..RetryConfig::default()
                },
                ..CourierConfig::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(MailError::Configuration(_))));
        }
    }

    #[test]
    fn test_validate_rejects_bad_sender() {
        let config = CourierConfig {
            default_from_email: Some("nope".into()),
            ..CourierConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_from() {
        let config = CourierConfig {
            default_from_email: Some("noreply@example.com".into()),
            default_from_name: Some("My App".into()),
            ..CourierConfig::default()
        };
        assert_eq!(
            config.default_from().unwrap().formatted(),
            "My App <noreply@example.com>"
        );
        assert!(CourierConfig::default().default_from().is_none());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: CourierConfig = serde_json::from_value(serde_json::json!({
            "default_provider": "smtp",
            "fallback_providers": ["sendgrid", "ses"],
            "max_concurrent_sends": 25,
            "provider_timeout": 2.5,
            "circuit_breaker": { "failure_threshold": 2 }
        }))
        .unwrap();

        assert_eq!(config.default_provider.as_deref(), Some("smtp"));
        assert_eq!(config.fallback_providers, vec!["sendgrid", "ses"]);
        assert_eq!(config.max_concurrent_sends, 25);
        assert_eq!(config.provider_timeout, Duration::from_millis(2500));
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_secs(300));
        assert!(config.queue_enabled);
    }

    // All env assertions live in one test; the process environment is shared
    // between test threads.
    #[test]
    fn test_from_env() {
        env::set_var("EMAIL_PROVIDER", "SMTP");
        env::set_var("EMAIL_FALLBACK_PROVIDERS", "sendgrid, ses,");
        env::set_var("EMAIL_MAX_CONCURRENT_SENDS", "4");
        env::set_var("EMAIL_QUEUE_ENABLED", "false");
        env::set_var("EMAIL_DEDUPLICATION_WINDOW_HOURS", "1");

        let config = CourierConfig::from_env().unwrap();
        assert_eq!(config.default_provider.as_deref(), Some("smtp"));
        assert_eq!(config.fallback_providers, vec!["sendgrid", "ses"]);
        assert_eq!(config.max_concurrent_sends, 4);
        assert!(!config.queue_enabled);
        assert_eq!(config.deduplication_window(), Duration::from_secs(3600));

        env::set_var("EMAIL_MAX_CONCURRENT_SENDS", "many");
        assert!(matches!(
            CourierConfig::from_env(),
            Err(MailError::Configuration(msg)) if msg.contains("EMAIL_MAX_CONCURRENT_SENDS")
        ));

        env::set_var("EMAIL_MAX_CONCURRENT_SENDS", "4");
        env::set_var("EMAIL_QUEUE_ENABLED", "maybe");
        assert!(CourierConfig::from_env().is_err());

        for var in [
            "EMAIL_PROVIDER",
            "EMAIL_FALLBACK_PROVIDERS",
            "EMAIL_MAX_CONCURRENT_SENDS",
            "EMAIL_QUEUE_ENABLED",
            "EMAIL_DEDUPLICATION_WINDOW_HOURS",
        ] {
            env::remove_var(var);
        }
    }
}
