//! Error types for courier.

use thiserror::Error;

use crate::message::MessageStatus;

/// Errors that can occur while delivering emails.
///
/// Provider adapters report failures through [`MailError::ProviderError`],
/// [`MailError::Permanent`] or [`MailError::Timeout`]. The [`Courier`](crate::Courier)
/// never hands these back directly: they are folded into a
/// [`SendResult`](crate::SendResult).
#[derive(Debug, Clone, Error)]
pub enum MailError {
    /// Configuration error (missing env var, invalid value, etc.)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The message is missing something required to send it.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid email address format.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// The message passed its `expires_at`.
    #[error("Message expired: {0}")]
    Expired(String),

    /// An identical message was sent within the deduplication window.
    #[error("Duplicate message: {0}")]
    Duplicate(String),

    /// Template lookup or rendering failed.
    #[error("Template error: {0}")]
    Template(String),

    /// Provider-specific error with details.
    ///
    /// Treated as transient unless `status` is a permanent HTTP status.
    #[error("Provider error ({provider}): {message}")]
    ProviderError {
        provider: String,
        message: String,
        /// Optional HTTP status code
        status: Option<u16>,
    },

    /// Provider refused the message outright (bad address, auth failure).
    #[error("Provider rejected message ({provider}): {message}")]
    Permanent { provider: String, message: String },

    /// A provider call or a message deadline timed out.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The provider's circuit breaker is open.
    #[error("Circuit breaker is open for provider {0}")]
    CircuitOpen(String),

    /// Every provider and retry was used up.
    #[error("All providers failed. Last error: {0}")]
    Exhausted(String),

    /// Queue bridge failure.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Illegal message state change.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: MessageStatus,
        to: MessageStatus,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MailError {
    /// Create a provider-specific (transient) error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderError {
            provider: provider.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Create a provider error with HTTP status.
    pub fn provider_with_status(
        provider: impl Into<String>,
        message: impl Into<String>,
        status: u16,
    ) -> Self {
        Self::ProviderError {
            provider: provider.into(),
            message: message.into(),
            status: Some(status),
        }
    }

    /// Create a permanent provider rejection.
    pub fn permanent(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Whether the provider refused the message itself.
    ///
    /// Retrying the same provider is pointless; a different provider may
    /// still accept it.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Permanent { .. } => true,
            Self::ProviderError {
                status: Some(status),
                ..
            } => (400..500).contains(status) && *status != 408 && *status != 429,
            _ => false,
        }
    }

    /// Whether another attempt against the same provider may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProviderError { .. } => !self.is_permanent(),
            Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Whether the error rejects the message before any provider is contacted.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::InvalidAddress(_)
                | Self::Expired(_)
                | Self::Duplicate(_)
                | Self::Template(_)
        )
    }
}

impl From<serde_json::Error> for MailError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}
