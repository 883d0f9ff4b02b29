//! Mailer layers applied around every provider adapter.
//!
//! A layer is a [`Mailer`] that wraps another `Mailer` and does something
//! before or after each delivery. The [`Courier`](crate::Courier) stacks
//! them when a provider is registered:
//!
//! ```text
//! WithRateLimit -> WithTimeout -> adapter
//! ```
//!
//! so a rate-limit wait never eats into the per-call timeout. Layers are
//! plain generics; no dynamic dispatch happens between them.
//!
//! # Example
//!
//! ```
//! use courier::layer::LayerExt;
//! use courier::providers::LoggerMailer;
//! use courier::rate_limit::{RateLimitConfig, RateLimiter};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let limiter = Arc::new(RateLimiter::new(RateLimitConfig::per_minute(60)));
//! let mailer = LoggerMailer::new()
//!     .with_timeout(Duration::from_secs(30))
//!     .with_rate_limit("logger", limiter);
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::MailError;
use crate::mailer::{DeliveryResult, Mailer};
use crate::message::Message;
use crate::rate_limit::RateLimiter;

/// Fails a delivery with [`MailError::Timeout`] when it takes too long.
///
/// Created by [`LayerExt::with_timeout`].
#[derive(Debug, Clone)]
pub struct WithTimeout<M> {
    inner: M,
    timeout: Duration,
}

#[async_trait]
impl<M: Mailer> Mailer for WithTimeout<M> {
    async fn deliver(&self, message: &Message) -> Result<DeliveryResult, MailError> {
        match tokio::time::timeout(self.timeout, self.inner.deliver(message)).await {
            Ok(result) => result,
            Err(_) => Err(MailError::Timeout(format!(
                "{} did not respond within {:?}",
                self.inner.provider_name(),
                self.timeout
            ))),
        }
    }

    async fn health_check(&self) -> Result<bool, MailError> {
        match tokio::time::timeout(self.timeout, self.inner.health_check()).await {
            Ok(result) => result,
            Err(_) => Ok(false),
        }
    }

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    fn validate_config(&self) -> Result<(), MailError> {
        self.inner.validate_config()
    }
}

/// Waits for rate-limiter admission before each delivery.
///
/// Created by [`LayerExt::with_rate_limit`].
#[derive(Debug, Clone)]
pub struct WithRateLimit<M> {
    inner: M,
    name: String,
    limiter: Arc<RateLimiter>,
}

#[async_trait]
impl<M: Mailer> Mailer for WithRateLimit<M> {
    async fn deliver(&self, message: &Message) -> Result<DeliveryResult, MailError> {
        let key = self.limiter.key_for(&self.name, message);
        let waited = self.limiter.acquire(&key).await;
        if !waited.is_zero() {
            tracing::debug!(
                provider = %self.name,
                message_id = %message.id,
                waited_ms = waited.as_millis() as u64,
                "Admitted after rate limit wait"
            );
        }
        self.inner.deliver(message).await
    }

    async fn health_check(&self) -> Result<bool, MailError> {
        self.inner.health_check().await
    }

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    fn validate_config(&self) -> Result<(), MailError> {
        self.inner.validate_config()
    }
}

/// Extension trait for layering any mailer.
pub trait LayerExt: Mailer + Sized {
    /// Bound every delivery by `timeout`.
    fn with_timeout(self, timeout: Duration) -> WithTimeout<Self> {
        WithTimeout {
            inner: self,
            timeout,
        }
    }

    /// Admit every delivery through `limiter`, keyed by `name`.
    fn with_rate_limit(self, name: impl Into<String>, limiter: Arc<RateLimiter>) -> WithRateLimit<Self> {
        WithRateLimit {
            inner: self,
            name: name.into(),
            limiter,
        }
    }
}

impl<M: Mailer + Sized> LayerExt for M {}
