//! Local mailer for development and testing.
//!
//! Captures delivered messages in memory and can be scripted to fail, stall
//! or report itself unhealthy, which makes it the standard stand-in for a
//! real provider when exercising a [`Courier`](crate::Courier).
//!
//! ```
//! use courier::providers::LocalMailer;
//! use courier::{Courier, Message};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let primary = LocalMailer::named("primary");
//! let backup = LocalMailer::named("backup");
//! primary.set_failure("connection refused");
//!
//! let courier = Courier::builder()
//!     .provider("primary", primary.clone())
//!     .provider("backup", backup.clone())
//!     .config(courier::CourierConfig {
//!         fallback_providers: vec!["backup".into()],
//!         retry: courier::retry::RetryConfig::none(),
//!         ..Default::default()
//!     })
//!     .build()
//!     .unwrap();
//!
//! let mut message = Message::new().from("app@example.com").to("user@example.com").subject("Hi");
//! courier.send(&mut message).await;
//!
//! assert_eq!(primary.message_count(), 0);
//! assert!(backup.sent_to("user@example.com"));
//! # });
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::MailError;
use crate::mailer::{DeliveryResult, Mailer};
use crate::message::Message;
use crate::storage::{MemoryStorage, Storage, StoredMessage};

#[derive(Debug, Default)]
struct Behavior {
    fail_with: Option<String>,
    fail_times: u32,
    permanent: Option<String>,
    delay: Option<Duration>,
    unhealthy: bool,
}

#[derive(Debug, Default)]
struct Stats {
    calls: AtomicU32,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a Stats);

impl<'a> InFlight<'a> {
    fn enter(stats: &'a Stats) -> Self {
        stats.calls.fetch_add(1, Ordering::SeqCst);
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory mailer. Clones share storage, scripted behavior and counters.
#[derive(Debug, Clone)]
pub struct LocalMailer {
    name: String,
    storage: Arc<MemoryStorage>,
    behavior: Arc<RwLock<Behavior>>,
    stats: Arc<Stats>,
}

impl LocalMailer {
    pub fn new() -> Self {
        Self::named("local")
    }

    /// A local mailer whose errors are attributed to `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self::with_storage(name, MemoryStorage::shared())
    }

    /// A local mailer writing into existing storage.
    pub fn with_storage(name: impl Into<String>, storage: Arc<MemoryStorage>) -> Self {
        Self {
            name: name.into(),
            storage,
            behavior: Arc::default(),
            stats: Arc::default(),
        }
    }

    pub fn storage(&self) -> Arc<MemoryStorage> {
        Arc::clone(&self.storage)
    }

    // =========================================================================
    // Scripted behavior
    // =========================================================================

    /// Fail every delivery with a transient provider error.
    pub fn set_failure(&self, message: impl Into<String>) {
        self.behavior.write().fail_with = Some(message.into());
    }

    /// Fail the next `n` deliveries with a transient error, then recover.
    pub fn fail_times(&self, n: u32) {
        self.behavior.write().fail_times = n;
    }

    /// Refuse every delivery with a permanent error.
    pub fn set_permanent_failure(&self, message: impl Into<String>) {
        self.behavior.write().permanent = Some(message.into());
    }

    /// Clear every scripted failure mode.
    pub fn clear_failure(&self) {
        let mut behavior = self.behavior.write();
        behavior.fail_with = None;
        behavior.fail_times = 0;
        behavior.permanent = None;
    }

    /// Wait `delay` before answering each delivery.
    pub fn set_delay(&self, delay: Duration) {
        self.behavior.write().delay = Some(delay);
    }

    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.behavior.write().unhealthy = unhealthy;
    }

    // =========================================================================
    // Call accounting
    // =========================================================================

    /// Deliveries attempted, successful or not.
    pub fn call_count(&self) -> u32 {
        self.stats.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of deliveries ever running at once.
    pub fn peak_in_flight(&self) -> usize {
        self.stats.peak_in_flight.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Captured messages
    // =========================================================================

    /// Captured messages, newest first.
    pub fn messages(&self) -> Vec<StoredMessage> {
        self.storage.all()
    }

    pub fn last_message(&self) -> Option<StoredMessage> {
        self.storage.all().into_iter().next()
    }

    pub fn message_count(&self) -> usize {
        self.storage.count()
    }

    pub fn has_messages(&self) -> bool {
        self.storage.count() > 0
    }

    pub fn clear(&self) {
        self.storage.clear();
    }

    /// Remove and return every captured message.
    pub fn flush(&self) -> Vec<StoredMessage> {
        self.storage.flush()
    }

    /// Whether any captured message was addressed to `email`.
    pub fn sent_to(&self, email: &str) -> bool {
        self.storage.all().iter().any(|stored| {
            stored
                .message
                .all_recipients()
                .iter()
                .any(|addr| addr.email.eq_ignore_ascii_case(email))
        })
    }

    pub fn sent_with_subject(&self, subject: &str) -> bool {
        self.storage
            .all()
            .iter()
            .any(|stored| stored.message.subject == subject)
    }

    pub fn sent_with_subject_containing(&self, text: &str) -> bool {
        self.storage
            .all()
            .iter()
            .any(|stored| stored.message.subject.contains(text))
    }

    pub fn find_messages<F>(&self, predicate: F) -> Vec<StoredMessage>
    where
        F: Fn(&Message) -> bool,
    {
        self.storage
            .all()
            .into_iter()
            .filter(|stored| predicate(&stored.message))
            .collect()
    }
}

impl Default for LocalMailer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mailer for LocalMailer {
    async fn deliver(&self, message: &Message) -> Result<DeliveryResult, MailError> {
        let _in_flight = InFlight::enter(&self.stats);

        let delay = self.behavior.read().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut behavior = self.behavior.write();
            if let Some(ref reason) = behavior.permanent {
                return Err(MailError::permanent(&self.name, reason.clone()));
            }
            if let Some(ref reason) = behavior.fail_with {
                return Err(MailError::provider(&self.name, reason.clone()));
            }
            if behavior.fail_times > 0 {
                behavior.fail_times -= 1;
                return Err(MailError::provider(&self.name, "simulated transient failure"));
            }
        }

        let id = self.storage.push(message.clone());
        tracing::debug!(provider = %self.name, id = %id, "Message captured");
        Ok(DeliveryResult::new(id))
    }

    async fn health_check(&self) -> Result<bool, MailError> {
        Ok(!self.behavior.read().unhealthy)
    }

    fn provider_name(&self) -> &str {
        &self.name
    }
}
