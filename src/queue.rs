//! Queue bridge for deferred and retried messages.
//!
//! The [`Courier`](crate::Courier) hands scheduled and low-priority messages
//! to a [`QueueBridge`] and drains it in
//! [`process_queue`](crate::Courier::process_queue). Persistence and
//! scheduling belong to the bridge; the courier only enqueues, pulls due
//! batches and acknowledges.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MailError;
use crate::message::{Message, Priority};

/// A queued delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Queue entry id (distinct from the message id).
    pub id: String,
    /// The serialized [`Message`].
    pub payload: serde_json::Value,
    pub priority: Priority,
    /// Not handed out by [`QueueBridge::get_batch`] before this time.
    pub scheduled_at: DateTime<Utc>,
    /// Times this entry was re-enqueued after a failed delivery.
    #[serde(default)]
    pub retry_count: u32,
}

impl QueueMessage {
    /// Wrap a message, scheduled at its `send_at` (or now).
    pub fn from_message(message: &Message) -> Result<Self, MailError> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload: serde_json::to_value(message)?,
            priority: message.priority,
            scheduled_at: message.send_at.unwrap_or_else(Utc::now),
            retry_count: message.retry_count(),
        })
    }

    /// Decode the payload.
    pub fn message(&self) -> Result<Message, MailError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Persistent backlog consumed by the courier.
#[async_trait]
pub trait QueueBridge: Send + Sync {
    /// Add an entry.
    async fn enqueue(&self, item: QueueMessage) -> Result<(), MailError>;

    /// Take up to `n` due entries, most urgent first.
    ///
    /// Returned entries are owned by the caller until they are requeued,
    /// completed or failed.
    async fn get_batch(&self, n: usize) -> Result<Vec<QueueMessage>, MailError>;

    /// Put an entry back unchanged (e.g. it is not due yet).
    async fn requeue(&self, item: QueueMessage) -> Result<(), MailError>;

    /// Acknowledge a delivered entry.
    async fn mark_completed(&self, id: &str) -> Result<(), MailError>;

    /// Acknowledge an entry that will not be attempted again.
    async fn mark_failed(&self, id: &str, reason: &str) -> Result<(), MailError>;
}

#[cfg(feature = "local")]
pub use memory::MemoryQueue;

#[cfg(feature = "local")]
mod memory {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Debug, Default)]
    struct State {
        pending: Vec<QueueMessage>,
        completed: Vec<String>,
        failed: HashMap<String, String>,
    }

    /// In-memory [`QueueBridge`] for development and tests.
    ///
    /// Only entries whose `scheduled_at` has passed are handed out, highest
    /// priority first, then oldest schedule first.
    #[derive(Debug, Default)]
    pub struct MemoryQueue {
        state: Mutex<State>,
    }

    impl MemoryQueue {
        pub fn new() -> Self {
            Self::default()
        }

        /// Entries waiting in the queue (due or not).
        pub fn len(&self) -> usize {
            self.state.lock().pending.len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Snapshot of the waiting entries.
        pub fn pending(&self) -> Vec<QueueMessage> {
            self.state.lock().pending.clone()
        }

        /// Ids acknowledged as delivered.
        pub fn completed(&self) -> Vec<String> {
            self.state.lock().completed.clone()
        }

        /// Failure reason recorded for `id`.
        pub fn failure_reason(&self, id: &str) -> Option<String> {
            self.state.lock().failed.get(id).cloned()
        }

        pub fn failed_count(&self) -> usize {
            self.state.lock().failed.len()
        }
    }

    #[async_trait]
    impl QueueBridge for MemoryQueue {
        async fn enqueue(&self, item: QueueMessage) -> Result<(), MailError> {
            self.state.lock().pending.push(item);
            Ok(())
        }

        async fn get_batch(&self, n: usize) -> Result<Vec<QueueMessage>, MailError> {
            let now = Utc::now();
            let mut state = self.state.lock();

            let (mut due, later): (Vec<_>, Vec<_>) = state
                .pending
                .drain(..)
                .partition(|item| item.scheduled_at <= now);
            state.pending = later;

            due.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.scheduled_at.cmp(&b.scheduled_at))
            });
            if due.len() > n {
                state.pending.extend(due.split_off(n));
            }
            Ok(due)
        }

        async fn requeue(&self, item: QueueMessage) -> Result<(), MailError> {
            self.enqueue(item).await
        }

        async fn mark_completed(&self, id: &str) -> Result<(), MailError> {
            self.state.lock().completed.push(id.to_string());
            Ok(())
        }

        async fn mark_failed(&self, id: &str, reason: &str) -> Result<(), MailError> {
            self.state
                .lock()
                .failed
                .insert(id.to_string(), reason.to_string());
            Ok(())
        }
    }
}
