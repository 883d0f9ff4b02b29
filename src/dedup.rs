//! Content-based duplicate detection over a sliding time window.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::message::Message;

/// Compute the fingerprint of a message.
///
/// SHA-256 (hex) over the normalized, sorted `to`, `cc` and `bcc` lists,
/// the subject, both bodies and one `filename:size` entry per attachment,
/// joined with `|`. Sender, headers and metadata are not part of a
/// message's identity.
///
/// ```
/// use courier::{dedup::fingerprint, Message};
///
/// let a = Message::new().to("A@Example.com").to("b@example.com").subject("Hi");
/// let b = Message::new().to("b@example.com").to("a@example.com").subject("Hi");
/// assert_eq!(fingerprint(&a), fingerprint(&b));
/// ```
pub fn fingerprint(message: &Message) -> String {
    let sorted = |addrs: &[crate::Address]| {
        let mut list: Vec<String> = addrs.iter().map(|a| a.normalized()).collect();
        list.sort();
        list.join(",")
    };

    let mut parts = vec![
        sorted(&message.to),
        sorted(&message.cc),
        sorted(&message.bcc),
        message.subject.clone(),
        message.text_body.clone().unwrap_or_default(),
        message.html_body.clone().unwrap_or_default(),
    ];
    parts.extend(message.attachments.iter().map(|a| a.summary()));
    // Unrendered templates differ only by name and context.
    if let Some(ref name) = message.template_name {
        let context: BTreeMap<_, _> = message.template_context.iter().collect();
        parts.push(name.clone());
        parts.push(serde_json::to_string(&context).unwrap_or_default());
    }

    hex::encode(Sha256::digest(parts.join("|").as_bytes()))
}

#[derive(Debug, Default)]
struct Seen {
    last_seen: HashMap<String, DateTime<Utc>>,
    // Insertion order; entries may be stale if a fingerprint was re-recorded.
    order: VecDeque<(DateTime<Utc>, String)>,
}

impl Seen {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while let Some((at, _)) = self.order.front() {
            if *at >= cutoff {
                break;
            }
            if let Some((at, fp)) = self.order.pop_front() {
                if self.last_seen.get(&fp) == Some(&at) {
                    self.last_seen.remove(&fp);
                }
            }
        }
    }
}

/// Rejects messages whose fingerprint was seen within the window.
///
/// Check and record happen under one lock, so two identical messages racing
/// through [`is_duplicate`](Self::is_duplicate) cannot both pass.
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    seen: Mutex<Seen>,
}

impl Deduplicator {
    /// Create a deduplicator with the given window.
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::weeks(52 * 100)),
            seen: Mutex::new(Seen::default()),
        }
    }

    /// Whether the message repeats one seen within the window.
    ///
    /// Records the message when it is not a duplicate; a duplicate leaves
    /// the table untouched.
    pub fn is_duplicate(&self, message: &Message) -> bool {
        self.is_duplicate_at(message, Utc::now())
    }

    /// [`is_duplicate`](Self::is_duplicate) against an explicit clock.
    pub fn is_duplicate_at(&self, message: &Message, now: DateTime<Utc>) -> bool {
        let fp = fingerprint(message);
        let cutoff = now - self.window;

        let mut seen = self.seen.lock();
        seen.prune(cutoff);

        if let Some(at) = seen.last_seen.get(&fp) {
            if *at >= cutoff {
                tracing::debug!(message_id = %message.id, fingerprint = %fp, "Duplicate message");
                return true;
            }
        }

        seen.last_seen.insert(fp.clone(), now);
        seen.order.push_back((now, fp));
        false
    }

    /// Drop a message's fingerprint so it can be submitted again.
    pub fn forget(&self, message: &Message) {
        self.seen.lock().last_seen.remove(&fingerprint(message));
    }

    /// Number of fingerprints currently tracked.
    pub fn len(&self) -> usize {
        self.seen.lock().last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
