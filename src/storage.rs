//! Capture storage for the local mailer.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::message::Message;

/// A message captured by [`LocalMailer`](crate::providers::LocalMailer).
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Provider message id handed back to the courier.
    pub id: String,
    pub message: Message,
    pub sent_at: DateTime<Utc>,
}

/// Where captured messages go.
pub trait Storage: Send + Sync {
    /// Store a message and return its id.
    fn push(&self, message: Message) -> String;

    fn get(&self, id: &str) -> Option<StoredMessage>;

    /// All stored messages, newest first.
    fn all(&self) -> Vec<StoredMessage>;

    fn delete(&self, id: &str) -> bool;

    fn clear(&self);

    fn count(&self) -> usize;

    /// Remove and return everything, newest first.
    fn flush(&self) -> Vec<StoredMessage>;
}

#[derive(Debug, Default)]
struct Inner {
    messages: HashMap<String, StoredMessage>,
    order: Vec<String>,
}

impl Inner {
    fn newest_first(&self) -> Vec<StoredMessage> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.messages.get(id).cloned())
            .collect()
    }
}

/// Thread-safe in-memory [`Storage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage wrapped in an `Arc` for sharing between mailer clones.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Storage for MemoryStorage {
    fn push(&self, message: Message) -> String {
        let id = format!("local-{}", uuid::Uuid::new_v4());
        let stored = StoredMessage {
            id: id.clone(),
            message,
            sent_at: Utc::now(),
        };

        let mut inner = self.inner.write();
        inner.messages.insert(id.clone(), stored);
        inner.order.push(id.clone());
        id
    }

    fn get(&self, id: &str) -> Option<StoredMessage> {
        self.inner.read().messages.get(id).cloned()
    }

    fn all(&self) -> Vec<StoredMessage> {
        self.inner.read().newest_first()
    }

    fn delete(&self, id: &str) -> bool {
        let mut inner = self.inner.write();
        if inner.messages.remove(id).is_some() {
            inner.order.retain(|x| x != id);
            true
        } else {
            false
        }
    }

    fn clear(&self) {
        let mut inner = self.inner.write();
        inner.messages.clear();
        inner.order.clear();
    }

    fn count(&self) -> usize {
        self.inner.read().messages.len()
    }

    fn flush(&self) -> Vec<StoredMessage> {
        let mut inner = self.inner.write();
        let flushed = inner.newest_first();
        inner.messages.clear();
        inner.order.clear();
        flushed
    }
}
