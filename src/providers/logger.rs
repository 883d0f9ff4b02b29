//! Mailer that only logs.
//!
//! Useful in staging, or as a last-resort fallback that never fails.

use async_trait::async_trait;

use crate::error::MailError;
use crate::mailer::{DeliveryResult, Mailer};
use crate::message::Message;

/// Emits a tracing event per message instead of sending it.
#[derive(Debug, Clone, Default)]
pub struct LoggerMailer {
    /// Log every header field and the bodies, not just recipients.
    log_full: bool,
}

impl LoggerMailer {
    pub fn new() -> Self {
        Self { log_full: false }
    }

    pub fn full() -> Self {
        Self { log_full: true }
    }

    pub fn log_full(mut self, full: bool) -> Self {
        self.log_full = full;
        self
    }
}

#[async_trait]
impl Mailer for LoggerMailer {
    async fn deliver(&self, message: &Message) -> Result<DeliveryResult, MailError> {
        let provider_message_id = format!("logger-{}", uuid::Uuid::new_v4());

        if self.log_full {
            tracing::info!(
                provider_message_id = %provider_message_id,
                message_id = %message.id,
                from = ?message.from.as_ref().map(|a| a.formatted()),
                to = ?message.to.iter().map(|a| a.formatted()).collect::<Vec<_>>(),
                cc = ?message.cc.iter().map(|a| a.formatted()).collect::<Vec<_>>(),
                bcc = message.bcc.len(),
                subject = %message.subject,
                priority = ?message.priority,
                tags = ?message.tags,
                attachments = message.attachments.len(),
                "Message logged (full)"
            );
            if let Some(ref text) = message.text_body {
                tracing::debug!(body = %text, "Text body");
            }
            if let Some(ref html) = message.html_body {
                tracing::debug!(body = %html, "HTML body");
            }
        } else {
            tracing::info!(
                provider_message_id = %provider_message_id,
                to = ?message.to.iter().map(|a| &a.email).collect::<Vec<_>>(),
                subject = %message.subject,
                "Message logged"
            );
        }

        Ok(DeliveryResult::new(provider_message_id))
    }

    fn provider_name(&self) -> &str {
        "logger"
    }
}
