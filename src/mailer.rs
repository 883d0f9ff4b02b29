//! Mailer trait and delivery result types.
//!
//! A [`Mailer`] is one provider adapter: SMTP, an HTTP API, or a test
//! double. The [`Courier`](crate::Courier) holds each registered provider as
//! an `Arc<dyn Mailer>`, so the trait uses `#[async_trait]`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::MailError;
use crate::message::Message;

/// Result of a successful delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    /// Message ID assigned by the provider
    pub message_id: String,
    /// Optional provider-specific response data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_response: Option<serde_json::Value>,
}

impl DeliveryResult {
    /// Create a new delivery result with just a message ID.
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            provider_response: None,
        }
    }

    /// Create a delivery result with provider response.
    pub fn with_response(message_id: impl Into<String>, response: serde_json::Value) -> Self {
        Self {
            message_id: message_id.into(),
            provider_response: Some(response),
        }
    }
}

/// A delivery provider.
///
/// Implementations send exactly one message per [`deliver`](Mailer::deliver)
/// call and report failures as:
///
/// - [`MailError::ProviderError`]: transient (network, 5xx); retried.
/// - [`MailError::Permanent`]: the provider refused the message; not
///   retried against this provider, the next provider is still tried.
/// - [`MailError::Timeout`]: the call took too long; retried.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use courier::{DeliveryResult, MailError, Mailer, Message};
///
/// struct Webhook;
///
/// #[async_trait]
/// impl Mailer for Webhook {
///     async fn deliver(&self, message: &Message) -> Result<DeliveryResult, MailError> {
///         if message.to.is_empty() {
///             return Err(MailError::permanent("webhook", "no recipients"));
///         }
///         Ok(DeliveryResult::new(format!("wh-{}", message.id)))
///     }
///
///     fn provider_name(&self) -> &str {
///         "webhook"
///     }
/// }
/// ```
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send a single message. Returns the provider's message ID on success.
    async fn deliver(&self, message: &Message) -> Result<DeliveryResult, MailError>;

    /// Whether the provider is currently able to accept mail.
    ///
    /// Defaults to healthy. Adapters with a cheap status endpoint should
    /// override this.
    async fn health_check(&self) -> Result<bool, MailError> {
        Ok(true)
    }

    /// Get the provider name (for logging/debugging).
    fn provider_name(&self) -> &str {
        "unknown"
    }

    /// Validate configuration.
    ///
    /// Called when the provider is registered.
    fn validate_config(&self) -> Result<(), MailError> {
        Ok(())
    }
}

#[async_trait]
impl<M: Mailer + ?Sized> Mailer for Arc<M> {
    async fn deliver(&self, message: &Message) -> Result<DeliveryResult, MailError> {
        (**self).deliver(message).await
    }

    async fn health_check(&self) -> Result<bool, MailError> {
        (**self).health_check().await
    }

    fn provider_name(&self) -> &str {
        (**self).provider_name()
    }

    fn validate_config(&self) -> Result<(), MailError> {
        (**self).validate_config()
    }
}

#[async_trait]
impl<M: Mailer + ?Sized> Mailer for Box<M> {
    async fn deliver(&self, message: &Message) -> Result<DeliveryResult, MailError> {
        (**self).deliver(message).await
    }

    async fn health_check(&self) -> Result<bool, MailError> {
        (**self).health_check().await
    }

    fn provider_name(&self) -> &str {
        (**self).provider_name()
    }

    fn validate_config(&self) -> Result<(), MailError> {
        (**self).validate_config()
    }
}
