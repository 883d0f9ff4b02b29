//! Message struct with builder pattern and delivery state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::address::{Address, ToAddress};
use crate::attachment::Attachment;
use crate::error::MailError;

/// Default number of resubmissions allowed after a failed delivery.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default lifetime of a message before it expires.
pub const DEFAULT_TTL_DAYS: i64 = 30;

/// Delivery priority. Ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl Priority {
    /// Numeric rank used by queues (higher is more urgent).
    pub fn rank(self) -> u8 {
        self as u8
    }
}

/// Where a message is in its delivery lifecycle.
///
/// ```text
/// PENDING -> QUEUED -> SENDING -> SENT
///    |                   |
///    +-----> SENDING     +-----> FAILED -> PENDING (while can_retry)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Pending,
    Queued,
    Sending,
    Sent,
    Failed,
}

impl MessageStatus {
    fn can_become(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Sending)
                | (Queued, Sending)
                | (Sending, Sent)
                | (Sending, Failed)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// An outbound email message.
///
/// Use the builder pattern to construct messages:
///
/// ```
/// use courier::{Message, Priority};
///
/// let message = Message::new()
///     .from("sender@example.com")
///     .to("recipient@example.com")
///     .subject("Hello!")
///     .text_body("Plain text content")
///     .priority(Priority::High);
///
/// assert!(message.can_retry());
/// ```
///
/// Delivery state (`status`, `sent_at`, `error_message`, ...) can only be
/// changed through the `mark_*` transitions, which keep it consistent:
/// `sent_at` is set only while SENT and `error_message` only while FAILED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier, generated at construction.
    pub id: String,
    /// Sender address
    pub from: Option<Address>,
    /// Reply-to address
    pub reply_to: Option<Address>,
    /// Primary recipients
    pub to: Vec<Address>,
    /// Carbon copy recipients
    pub cc: Vec<Address>,
    /// Blind carbon copy recipients
    pub bcc: Vec<Address>,
    /// Subject line
    pub subject: String,
    /// Plain text body
    pub text_body: Option<String>,
    /// HTML body
    pub html_body: Option<String>,
    /// File attachments
    pub attachments: Vec<Attachment>,
    /// Custom email headers
    pub headers: HashMap<String, String>,
    /// Free-form tags, kept unique
    pub tags: Vec<String>,
    /// Caller metadata, passed through untouched
    pub metadata: HashMap<String, serde_json::Value>,
    /// Delivery priority
    pub priority: Priority,
    /// Earliest time the message may be sent
    pub send_at: Option<DateTime<Utc>>,
    /// After this instant the message is never attempted
    pub expires_at: DateTime<Utc>,
    /// Template to render subject and body from
    pub template_name: Option<String>,
    /// Variables available to the template
    pub template_context: HashMap<String, serde_json::Value>,
    /// How many times a failed message may go back to PENDING
    pub max_retries: u32,

    status: MessageStatus,
    created_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    retry_count: u32,
    error_message: Option<String>,
    provider: Option<String>,
    provider_message_id: Option<String>,
}

impl Default for Message {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            from: None,
            reply_to: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: String::new(),
            text_body: None,
            html_body: None,
            attachments: Vec::new(),
            headers: HashMap::new(),
            tags: Vec::new(),
            metadata: HashMap::new(),
            priority: Priority::Normal,
            send_at: None,
            expires_at: now + Duration::days(DEFAULT_TTL_DAYS),
            template_name: None,
            template_context: HashMap::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            status: MessageStatus::Pending,
            created_at: now,
            sent_at: None,
            retry_count: 0,
            error_message: None,
            provider: None,
            provider_message_id: None,
        }
    }
}

impl Message {
    /// Create a new empty message with a fresh id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sender address.
    pub fn from(mut self, addr: impl ToAddress) -> Self {
        self.from = Some(addr.to_address());
        self
    }

    /// Set the reply-to address.
    pub fn reply_to(mut self, addr: impl ToAddress) -> Self {
        self.reply_to = Some(addr.to_address());
        self
    }

    /// Add a recipient.
    pub fn to(mut self, addr: impl ToAddress) -> Self {
        self.to.push(addr.to_address());
        self
    }

    /// Add a CC recipient.
    pub fn cc(mut self, addr: impl ToAddress) -> Self {
        self.cc.push(addr.to_address());
        self
    }

    /// Add a BCC recipient.
    pub fn bcc(mut self, addr: impl ToAddress) -> Self {
        self.bcc.push(addr.to_address());
        self
    }

    /// Set the subject line.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Set the plain text body.
    pub fn text_body(mut self, body: impl Into<String>) -> Self {
        self.text_body = Some(body.into());
        self
    }

    /// Set the HTML body.
    pub fn html_body(mut self, body: impl Into<String>) -> Self {
        self.html_body = Some(body.into());
        self
    }

    /// Add an attachment.
    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Add a custom header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a tag (ignored if already present).
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.add_tag(tag);
        self
    }

    /// Attach caller metadata.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the delivery priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Schedule the message for a later time.
    pub fn send_at(mut self, at: DateTime<Utc>) -> Self {
        self.send_at = Some(at);
        self
    }

    /// Override the expiry time (default: 30 days after creation).
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = at;
        self
    }

    /// Render subject and body from a named template at send time.
    ///
    /// ```
    /// use courier::Message;
    ///
    /// let message = Message::new()
    ///     .to("user@example.com")
    ///     .template("welcome")
    ///     .template_var("name", "Alice");
    /// assert_eq!(message.template_name.as_deref(), Some("welcome"));
    /// ```
    pub fn template(mut self, name: impl Into<String>) -> Self {
        self.template_name = Some(name.into());
        self
    }

    /// Set a template variable.
    pub fn template_var(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.template_context.insert(key.into(), value.into());
        self
    }

    /// Set how many resubmissions a failed message gets.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Add a tag in place.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Get all recipients (to + cc + bcc).
    pub fn all_recipients(&self) -> Vec<&Address> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .collect()
    }

    /// Whether the message references a template.
    pub fn is_templated(&self) -> bool {
        self.template_name.is_some()
    }

    /// Whether `expires_at` has passed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether `expires_at` is before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whether `send_at` lies after `now`.
    pub fn is_scheduled_after(&self, now: DateTime<Utc>) -> bool {
        self.send_at.is_some_and(|at| at > now)
    }

    /// Whether a failed (or fresh) message may be attempted again.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
            && !self.is_expired()
            && matches!(self.status, MessageStatus::Failed | MessageStatus::Pending)
    }

    /// Check the message can be handed to a provider.
    ///
    /// Requires at least one `to` recipient, syntactically valid addresses,
    /// some content (unless a template will supply it) and no expiry.
    pub fn validate(&self) -> Result<(), MailError> {
        if self.to.is_empty() {
            return Err(MailError::Validation(
                "message must have at least one recipient".into(),
            ));
        }

        for addr in self.all_recipients() {
            addr.validate()?;
        }
        if let Some(ref from) = self.from {
            from.validate()?;
        }
        if let Some(ref reply_to) = self.reply_to {
            reply_to.validate()?;
        }

        if !self.is_templated()
            && self.subject.is_empty()
            && self.text_body.is_none()
            && self.html_body.is_none()
        {
            return Err(MailError::Validation(
                "message must have a subject or body".into(),
            ));
        }

        if self.is_expired() {
            return Err(MailError::Expired(format!(
                "message {} expired at {}",
                self.id,
                self.expires_at.to_rfc3339()
            )));
        }

        Ok(())
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.sent_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Provider that last attempted (or delivered) the message.
    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    pub fn provider_message_id(&self) -> Option<&str> {
        self.provider_message_id.as_deref()
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    fn transition(&mut self, next: MessageStatus) -> Result<(), MailError> {
        if !self.status.can_become(next) {
            return Err(MailError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// PENDING -> QUEUED.
    pub fn mark_queued(&mut self) -> Result<(), MailError> {
        self.transition(MessageStatus::Queued)
    }

    /// PENDING | QUEUED -> SENDING.
    pub fn mark_sending(&mut self) -> Result<(), MailError> {
        self.transition(MessageStatus::Sending)?;
        self.sent_at = None;
        self.provider_message_id = None;
        Ok(())
    }

    /// Record which provider is currently being tried.
    pub fn set_attempt_provider(&mut self, provider: impl Into<String>) {
        self.provider = Some(provider.into());
    }

    /// SENDING -> SENT.
    pub fn mark_sent(
        &mut self,
        provider: impl Into<String>,
        provider_message_id: impl Into<String>,
    ) -> Result<(), MailError> {
        self.transition(MessageStatus::Sent)?;
        self.sent_at = Some(Utc::now());
        self.provider = Some(provider.into());
        self.provider_message_id = Some(provider_message_id.into());
        Ok(())
    }

    /// SENDING -> FAILED.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), MailError> {
        self.transition(MessageStatus::Failed)?;
        self.error_message = Some(error.into());
        Ok(())
    }

    /// FAILED -> PENDING, consuming one retry.
    pub fn mark_retry(&mut self) -> Result<(), MailError> {
        if self.status != MessageStatus::Failed || !self.can_retry() {
            return Err(MailError::InvalidTransition {
                from: self.status,
                to: MessageStatus::Pending,
            });
        }
        self.transition(MessageStatus::Pending)?;
        self.retry_count += 1;
        self.error_message = None;
        Ok(())
    }
}
