//! Assertion helpers for tests.
//!
//! Work over a [`LocalMailer`]'s captured messages and over the
//! [`SendResult`]s a [`Courier`](crate::Courier) returns. Failures print a
//! summary of what was actually delivered.
//!
//! ```
//! use courier::providers::LocalMailer;
//! use courier::testing::*;
//! use courier::{Courier, Message};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let mailer = LocalMailer::new();
//! let courier = Courier::builder().provider("local", mailer.clone()).build().unwrap();
//!
//! let mut message = Message::new()
//!     .from("app@example.com")
//!     .to("user@example.com")
//!     .subject("Welcome aboard!");
//! let result = courier.send(&mut message).await;
//!
//! assert_sent(&result);
//! assert_delivered_to(&mailer, "user@example.com");
//! assert_subject_matches(&mailer, r"Welcome.*!");
//! refute_delivered_to(&mailer, "admin@example.com");
//! # });
//! ```

use regex::Regex;

use crate::courier::{SendResult, SendStatus};
use crate::message::Message;
use crate::providers::LocalMailer;
use crate::storage::StoredMessage;

// ============================================================================
// Helpers
// ============================================================================

fn summary(captured: &[StoredMessage]) -> String {
    if captured.is_empty() {
        return "  (nothing delivered)".to_string();
    }

    captured
        .iter()
        .enumerate()
        .map(|(i, stored)| {
            let m = &stored.message;
            let to = m
                .to
                .iter()
                .map(|a| a.email.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let from = m.from.as_ref().map(|a| a.email.as_str()).unwrap_or("<none>");
            format!("  {}. To: [{}], From: {}, Subject: \"{}\"", i + 1, to, from, m.subject)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("Invalid regex pattern '{}': {}", pattern, e))
}

fn assert_any<F>(mailer: &LocalMailer, predicate: F, expectation: &str)
where
    F: Fn(&Message) -> bool,
{
    let captured = mailer.messages();
    assert!(
        captured.iter().any(|s| predicate(&s.message)),
        "Expected {}.\n\nDelivered:\n{}",
        expectation,
        summary(&captured)
    );
}

// ============================================================================
// Send results
// ============================================================================

/// Assert the result is SENT.
pub fn assert_sent(result: &SendResult) {
    assert_status(result, SendStatus::Sent);
}

/// Assert the result is QUEUED.
pub fn assert_queued(result: &SendResult) {
    assert_status(result, SendStatus::Queued);
}

/// Assert the result has `expected` status.
pub fn assert_status(result: &SendResult, expected: SendStatus) {
    assert!(
        result.status == expected,
        "Expected message {} to be {}, but it was {} (error: {})",
        result.message_id,
        expected,
        result.status,
        result.error_message().unwrap_or_else(|| "none".into())
    );
}

/// Assert the result was rejected with an error mentioning `text`.
pub fn assert_rejected_with(result: &SendResult, text: &str) {
    assert_status(result, SendStatus::Rejected);
    let message = result.error_message().unwrap_or_default();
    assert!(
        message.contains(text),
        "Expected rejection mentioning '{}', got '{}'",
        text,
        message
    );
}

// ============================================================================
// Captured messages
// ============================================================================

/// Assert exactly `expected` messages were delivered.
pub fn assert_delivered_count(mailer: &LocalMailer, expected: usize) {
    let captured = mailer.messages();
    assert!(
        captured.len() == expected,
        "Expected {} message(s) to be delivered, but {} were.\n\nDelivered:\n{}",
        expected,
        captured.len(),
        summary(&captured)
    );
}

/// Assert nothing was delivered.
pub fn refute_delivered(mailer: &LocalMailer) {
    assert_delivered_count(mailer, 0);
}

/// Assert a message was delivered to `email` (to, cc or bcc).
pub fn assert_delivered_to(mailer: &LocalMailer, email: &str) {
    assert_any(
        mailer,
        |m| m.all_recipients().iter().any(|a| a.email.eq_ignore_ascii_case(email)),
        &format!("a message delivered to '{}'", email),
    );
}

/// Assert no message was delivered to `email`.
pub fn refute_delivered_to(mailer: &LocalMailer, email: &str) {
    let matching = mailer.find_messages(|m| {
        m.all_recipients()
            .iter()
            .any(|a| a.email.eq_ignore_ascii_case(email))
    });
    assert!(
        matching.is_empty(),
        "Expected no message delivered to '{}', but found {}.\n\nMatching:\n{}",
        email,
        matching.len(),
        summary(&matching)
    );
}

pub fn assert_subject(mailer: &LocalMailer, subject: &str) {
    assert_any(
        mailer,
        |m| m.subject == subject,
        &format!("a message with subject '{}'", subject),
    );
}

/// Assert some delivered subject matches `pattern`.
///
/// # Panics
///
/// Panics if the pattern is not a valid regex.
pub fn assert_subject_matches(mailer: &LocalMailer, pattern: &str) {
    let re = compile(pattern);
    assert_any(
        mailer,
        |m| re.is_match(&m.subject),
        &format!("a subject matching /{}/", pattern),
    );
}

/// Assert some delivered HTML body contains `text`.
pub fn assert_html_contains(mailer: &LocalMailer, text: &str) {
    assert_any(
        mailer,
        |m| m.html_body.as_deref().is_some_and(|b| b.contains(text)),
        &format!("an HTML body containing '{}'", text),
    );
}

/// Assert some delivered text body contains `text`.
pub fn assert_text_contains(mailer: &LocalMailer, text: &str) {
    assert_any(
        mailer,
        |m| m.text_body.as_deref().is_some_and(|b| b.contains(text)),
        &format!("a text body containing '{}'", text),
    );
}

/// Most recent delivery.
///
/// # Panics
///
/// Panics if nothing was delivered.
pub fn last_delivered(mailer: &LocalMailer) -> StoredMessage {
    mailer
        .last_message()
        .unwrap_or_else(|| panic!("Expected a delivered message, but none were delivered"))
}
