//! # Courier
//!
//! Resilient multi-provider email delivery.
//!
//! A [`Courier`] sits between your application and one or more email
//! providers. For every message it validates, deduplicates, optionally
//! renders a template, then either queues it (scheduled or low priority)
//! or delivers it now. Immediate delivery walks an ordered list of
//! providers, retrying transient errors with backoff, skipping providers
//! whose circuit breaker is open, and respecting a global concurrency
//! bound and a per-provider rate limit.
//!
//! ## Quick Start
//!
//! ```
//! use courier::prelude::*;
//! use courier::providers::LoggerMailer;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let courier = Courier::builder()
//!     .provider("primary", LoggerMailer::new())
//!     .provider("backup", LoggerMailer::full())
//!     .config(CourierConfig {
//!         fallback_providers: vec!["backup".into()],
//!         default_from_email: Some("noreply@example.com".into()),
//!         ..CourierConfig::default()
//!     })
//!     .build()?;
//!
//! let mut message = Message::new()
//!     .to("user@example.com")
//!     .subject("Welcome!")
//!     .text_body("Hello");
//!
//! let result = courier.send(&mut message).await;
//! assert_eq!(result.status, SendStatus::Sent);
//! # Ok::<(), MailError>(())
//! # }).unwrap();
//! ```
//!
//! ## Process-wide Courier
//!
//! Like a logger, a courier is usually configured once at startup and used
//! everywhere:
//!
//! ```rust,ignore
//! courier::configure(Courier::builder().provider("ses", ses).build()?);
//!
//! // anywhere else
//! courier::send(&mut message).await?;
//! ```
//!
//! ## Environment Variables
//!
//! [`CourierBuilder::from_env`] reads:
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `EMAIL_PROVIDER` | Default provider name (`logger`, `logger_full`, `local` are built in) |
//! | `EMAIL_FALLBACK_PROVIDERS` | Comma separated fallback provider names |
//! | `EMAIL_FROM` | Default sender email |
//! | `EMAIL_FROM_NAME` | Default sender name |
//! | `EMAIL_MAX_CONCURRENT_SENDS` | Global in-flight bound (default: 10) |
//! | `EMAIL_RATE_LIMIT_PER_MINUTE` | Deliveries per provider per minute (default: 60) |
//! | `EMAIL_QUEUE_ENABLED` | Queue scheduled and low-priority messages (default: true) |
//! | `EMAIL_CIRCUIT_BREAKER_ENABLED` | Default: true |
//! | `EMAIL_DEDUPLICATION_ENABLED` | Default: true |
//! | `EMAIL_DEDUPLICATION_WINDOW_HOURS` | Default: 24 |
//!
//! ## Feature Flags
//!
//! - `local` - `LocalMailer`, `MemoryQueue` and the [`testing`] helpers
//! - `metrics` - Prometheus-style metrics (counters/histograms)
//!
//! ## Metrics
//!
//! Enable `features = ["metrics"]` to emit:
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `courier_emails_total` | Counter | provider, status | Provider outcomes, rejections and queued messages |
//! | `courier_delivery_duration_seconds` | Histogram | provider | Time spent on one provider, retries included |
//! | `courier_breaker_open_total` | Counter | provider | Circuit breaker trips |
//!
//! Install a recorder (e.g., `metrics-exporter-prometheus`) in your app to collect them.

/// The version of the courier crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

mod address;
mod attachment;
mod config;
mod courier;
mod error;
mod mailer;
mod message;

pub mod circuit_breaker;
pub mod dedup;
pub mod layer;
pub mod providers;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod template;

#[cfg(feature = "local")]
mod storage;

#[cfg(feature = "local")]
pub mod testing;

use parking_lot::RwLock;
use std::sync::Arc;

// Re-exports
pub use address::{Address, ToAddress};
pub use attachment::{Attachment, AttachmentType};
pub use config::CourierConfig;
pub use courier::{
    BulkResult, Courier, CourierBuilder, QueueStats, SendOptions, SendResult, SendStatus,
};
pub use error::MailError;
pub use mailer::{DeliveryResult, Mailer};
pub use message::{Message, MessageStatus, Priority};
pub use queue::{QueueBridge, QueueMessage};
pub use template::{EmailTemplate, TemplateEngine, TemplateType};

#[cfg(feature = "local")]
pub use queue::MemoryQueue;
#[cfg(feature = "local")]
pub use storage::{MemoryStorage, Storage, StoredMessage};

// ============================================================================
// Process-wide Courier
// ============================================================================

static COURIER: RwLock<Option<Arc<Courier>>> = RwLock::new(None);

/// Install the process-wide courier. Later calls replace it.
pub fn configure(courier: Courier) {
    *COURIER.write() = Some(Arc::new(courier));
}

/// Install the process-wide courier from `EMAIL_*` variables.
///
/// Only built-in providers can be named this way; use [`configure`] with a
/// builder for anything else.
pub fn init() -> Result<(), MailError> {
    let courier = CourierBuilder::from_env()?.build()?;
    tracing::debug!(providers = ?courier.providers(), "Courier initialized from environment");
    configure(courier);
    Ok(())
}

/// Remove the process-wide courier.
pub fn reset() {
    *COURIER.write() = None;
}

/// The process-wide courier, if configured.
pub fn courier() -> Option<Arc<Courier>> {
    COURIER.read().clone()
}

/// Send through the process-wide courier.
///
/// Fails with [`MailError::Configuration`] when none is configured;
/// otherwise the outcome (including rejections) is in the [`SendResult`].
pub async fn send(message: &mut Message) -> Result<SendResult, MailError> {
    let courier = courier().ok_or_else(|| {
        MailError::Configuration(
            "no courier configured; call courier::configure() or courier::init() first".into(),
        )
    })?;
    Ok(courier.send(message).await)
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::template::{MemoryTemplateEngine, TemplateEngine};
    pub use crate::{
        Address, Attachment, BulkResult, Courier, CourierConfig, DeliveryResult, MailError,
        Mailer, Message, Priority, QueueBridge, SendOptions, SendResult, SendStatus, ToAddress,
    };

    #[cfg(feature = "local")]
    pub use crate::{providers::LocalMailer, MemoryQueue};
}
