//! The delivery engine.
//!
//! A [`Courier`] owns a set of named providers and everything needed to
//! deliver through them reliably:
//!
//! - a global semaphore bounding in-flight deliveries,
//! - one [`CircuitBreaker`] per provider,
//! - a [`RateLimiter`] applied around every provider call,
//! - a [`RetryPolicy`] for transient provider errors,
//! - a [`Deduplicator`] rejecting repeats,
//! - optionally a [`QueueBridge`] and a [`TemplateEngine`].
//!
//! # Example
//!
//! ```
//! use courier::{Courier, CourierConfig, Message, SendStatus};
//! use courier::providers::LoggerMailer;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let courier = Courier::builder()
//!     .provider("logger", LoggerMailer::new())
//!     .config(CourierConfig {
//!         default_from_email: Some("noreply@example.com".into()),
//!         ..CourierConfig::default()
//!     })
//!     .build()
//!     .unwrap();
//!
//! let mut message = Message::new()
//!     .to("user@example.com")
//!     .subject("Welcome")
//!     .text_body("Hello!");
//!
//! let result = courier.send(&mut message).await;
//! assert_eq!(result.status, SendStatus::Sent);
//! assert_eq!(result.provider.as_deref(), Some("logger"));
//! # });
//! ```

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::Instrument;

use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitBreakers, CircuitState};
use crate::config::CourierConfig;
use crate::dedup::Deduplicator;
use crate::error::MailError;
use crate::layer::LayerExt;
use crate::mailer::{DeliveryResult, Mailer};
use crate::message::{Message, MessageStatus, Priority};
use crate::queue::{QueueBridge, QueueMessage};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::template::{TemplateEngine, TemplateType};

// ============================================================================
// Results
// ============================================================================

/// Terminal outcome of a [`Courier::send`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    /// Delivered by a provider.
    Sent,
    /// Every provider was tried and failed.
    Failed,
    /// Handed to the queue; not attempted yet.
    Queued,
    /// Refused before any provider was contacted.
    Rejected,
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Queued => "queued",
            Self::Rejected => "rejected",
        })
    }
}

/// Result of sending one message.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub message_id: String,
    pub status: SendStatus,
    /// Provider that delivered the message, or the last one tried.
    pub provider: Option<String>,
    pub provider_message_id: Option<String>,
    /// Why the message was rejected or failed.
    pub error: Option<MailError>,
    pub sent_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// The last provider refused the message outright.
    pub permanent: bool,
}

impl SendResult {
    fn from_message(message: &Message, status: SendStatus, error: Option<MailError>) -> Self {
        Self {
            message_id: message.id.clone(),
            status,
            provider: message.provider().map(str::to_owned),
            provider_message_id: message.provider_message_id().map(str::to_owned),
            error,
            sent_at: message.sent_at(),
            retry_count: message.retry_count(),
            permanent: false,
        }
    }

    fn panicked(message_id: String) -> Self {
        Self {
            message_id,
            status: SendStatus::Failed,
            provider: None,
            provider_message_id: None,
            error: Some(MailError::Internal("delivery task panicked".into())),
            sent_at: None,
            retry_count: 0,
            permanent: false,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.status == SendStatus::Sent
    }

    pub fn is_queued(&self) -> bool {
        self.status == SendStatus::Queued
    }

    /// Human-readable error, if any.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}

/// Aggregated result of [`Courier::send_bulk`].
#[derive(Debug, Clone, Default)]
pub struct BulkResult {
    /// One result per input message, in input order.
    pub results: Vec<SendResult>,
}

impl BulkResult {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    fn count(&self, status: SendStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn success_count(&self) -> usize {
        self.count(SendStatus::Sent)
    }

    /// Failed and rejected messages.
    pub fn failure_count(&self) -> usize {
        self.count(SendStatus::Failed) + self.count(SendStatus::Rejected)
    }

    pub fn queued_count(&self) -> usize {
        self.count(SendStatus::Queued)
    }

    pub fn rejected_count(&self) -> usize {
        self.count(SendStatus::Rejected)
    }

    /// Ids of the messages handed to the queue.
    pub fn queued(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.is_queued())
            .map(|r| r.message_id.as_str())
            .collect()
    }

    /// Percentage of messages sent, 0 when empty.
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.success_count() as f64 / self.total() as f64 * 100.0
    }
}

/// Counters from one [`Courier::process_queue`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries pulled from the queue.
    pub processed: usize,
    pub sent: usize,
    /// Entries given up on.
    pub failed: usize,
    /// Entries put back: not due yet, or scheduled for another attempt.
    pub requeued: usize,
}

/// Per-call options for [`Courier::send_with`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Provider to try before the default and fallbacks.
    pub provider: Option<String>,
    /// Skip the queue even for scheduled or low-priority messages.
    pub immediate: bool,
}

impl SendOptions {
    pub fn provider(mut self, name: impl Into<String>) -> Self {
        self.provider = Some(name.into());
        self
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Courier`].
#[derive(Default)]
pub struct CourierBuilder {
    config: CourierConfig,
    providers: Vec<(String, Arc<dyn Mailer>)>,
    queue: Option<Arc<dyn QueueBridge>>,
    templates: Option<Arc<dyn TemplateEngine>>,
}

impl CourierBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration from `EMAIL_*` variables, with any built-in providers
    /// it names (`logger`, `logger_full`, `local`) already registered.
    ///
    /// Other provider names must be registered by the caller before
    /// [`build`](Self::build).
    pub fn from_env() -> Result<Self, MailError> {
        let config = CourierConfig::from_env()?;
        let names: Vec<String> = config
            .default_provider
            .iter()
            .chain(config.fallback_providers.iter())
            .cloned()
            .collect();

        let mut builder = Self::new().config(config);
        for name in names {
            if builder.providers.iter().any(|(n, _)| *n == name) {
                continue;
            }
            if let Some(mailer) = crate::providers::builtin(&name) {
                tracing::debug!(provider = %name, "Registered built-in provider");
                builder.providers.push((name, mailer));
            }
        }
        Ok(builder)
    }

    pub fn config(mut self, config: CourierConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an already shared provider.
    pub fn provider_arc(mut self, name: impl Into<String>, mailer: Arc<dyn Mailer>) -> Self {
        self.providers.push((name.into(), mailer));
        self
    }

    /// Register a provider under `name`. Registration order is the order
    /// used to pick a default when none is configured.
    pub fn provider(mut self, name: impl Into<String>, mailer: impl Mailer + 'static) -> Self {
        let mailer: Arc<dyn Mailer> = Arc::new(mailer);
        self.providers.push((name.into(), mailer));
        self
    }

    pub fn queue(mut self, queue: Arc<dyn QueueBridge>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn template_engine(mut self, engine: Arc<dyn TemplateEngine>) -> Self {
        self.templates = Some(engine);
        self
    }

    /// Validate the configuration and assemble the courier.
    pub fn build(self) -> Result<Courier, MailError> {
        let config = self.config;
        config.validate()?;

        if self.providers.is_empty() {
            return Err(MailError::Configuration(
                "at least one provider must be registered".into(),
            ));
        }

        let limiter = Arc::new(RateLimiter::new(config.rate_limit()));
        let mut providers: Vec<(String, Arc<dyn Mailer>)> = Vec::with_capacity(self.providers.len());
        for (name, mailer) in self.providers {
            if providers.iter().any(|(n, _)| *n == name) {
                return Err(MailError::Configuration(format!(
                    "provider '{}' registered twice",
                    name
                )));
            }
            mailer.validate_config()?;

            let layered: Arc<dyn Mailer> = Arc::new(
                mailer
                    .with_timeout(config.provider_timeout)
                    .with_rate_limit(name.clone(), Arc::clone(&limiter)),
            );
            providers.push((name, layered));
        }

        let default_provider = match config.default_provider {
            Some(ref name) if providers.iter().any(|(n, _)| n == name) => name.clone(),
            ref other => {
                let first = providers[0].0.clone();
                if let Some(name) = other {
                    tracing::warn!(
                        provider = %name,
                        fallback = %first,
                        "Default provider not registered, using first provider"
                    );
                }
                first
            }
        };

        let fallback_providers = config
            .fallback_providers
            .iter()
            .filter(|name| {
                let known = providers.iter().any(|(n, _)| n == *name);
                if !known {
                    tracing::warn!(provider = %name, "Ignoring unregistered fallback provider");
                }
                known
            })
            .cloned()
            .collect();

        tracing::debug!(
            default = %default_provider,
            providers = providers.len(),
            max_concurrent_sends = config.max_concurrent_sends,
            "Courier configured"
        );

        Ok(Courier {
            semaphore: Semaphore::new(config.max_concurrent_sends),
            breakers: CircuitBreakers::new(config.circuit_breaker.clone()),
            retry: RetryPolicy::new(config.retry.clone()),
            dedup: Deduplicator::new(config.deduplication_window()),
            limiter,
            providers,
            default_provider,
            fallback_providers,
            queue: self.queue,
            templates: self.templates,
            config,
        })
    }
}

// ============================================================================
// Courier
// ============================================================================

/// Multi-provider delivery engine. See the [module docs](self).
pub struct Courier {
    config: CourierConfig,
    providers: Vec<(String, Arc<dyn Mailer>)>,
    default_provider: String,
    fallback_providers: Vec<String>,
    semaphore: Semaphore,
    breakers: CircuitBreakers,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    dedup: Deduplicator,
    queue: Option<Arc<dyn QueueBridge>>,
    templates: Option<Arc<dyn TemplateEngine>>,
}

enum ItemOutcome {
    Sent,
    Failed,
    /// Rescheduled under a fresh queue id after a failed attempt.
    Retried,
    /// Put back unchanged; the message is not due yet.
    NotDue,
}

impl Courier {
    pub fn builder() -> CourierBuilder {
        CourierBuilder::new()
    }

    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    /// Registered provider names, in registration order.
    pub fn providers(&self) -> Vec<&str> {
        self.providers.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    /// Shared rate limiter used by every provider.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Order providers are tried in: `preferred`, the default, then the
    /// fallbacks, without repeats.
    pub fn provider_order(&self, preferred: Option<&str>) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        let candidates = preferred
            .into_iter()
            .chain(std::iter::once(self.default_provider.as_str()))
            .chain(self.fallback_providers.iter().map(String::as_str));
        for name in candidates {
            if !order.iter().any(|n| n == name) {
                order.push(name.to_string());
            }
        }
        order
    }

    fn mailer(&self, name: &str) -> Option<&Arc<dyn Mailer>> {
        self.providers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, m)| m)
    }

    /// Breaker for `provider`, if it has been used.
    pub fn circuit_breaker(&self, provider: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.peek(provider)
    }

    /// Breaker state for `provider`. Unused providers are closed.
    pub fn breaker_state(&self, provider: &str) -> CircuitState {
        self.breakers
            .peek(provider)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Health of every registered provider. Errors count as unhealthy.
    pub async fn provider_health(&self) -> HashMap<String, bool> {
        let checks = self.providers.iter().map(|(name, mailer)| async move {
            let healthy = match mailer.health_check().await {
                Ok(healthy) => healthy,
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "Health check failed");
                    false
                }
            };
            (name.clone(), healthy)
        });
        join_all(checks).await.into_iter().collect()
    }

    // ========================================================================
    // Send
    // ========================================================================

    /// Send one message with default options.
    ///
    /// The message is updated in place: on return its status is SENT,
    /// FAILED or QUEUED, or unchanged if it was rejected.
    pub async fn send(&self, message: &mut Message) -> SendResult {
        self.send_with(message, SendOptions::default()).await
    }

    /// Send one message.
    ///
    /// 1. Fill in the default sender.
    /// 2. Validate recipients, content and expiry.
    /// 3. Reject duplicates seen within the deduplication window.
    /// 4. Render the template, if the message names one.
    /// 5. Queue scheduled and low-priority messages.
    /// 6. Otherwise deliver now, trying providers in order.
    pub async fn send_with(&self, message: &mut Message, options: SendOptions) -> SendResult {
        let span = tracing::info_span!(
            "courier.send",
            message_id = %message.id,
            priority = ?message.priority,
        );
        self.send_inner(message, options).instrument(span).await
    }

    async fn send_inner(&self, message: &mut Message, options: SendOptions) -> SendResult {
        tracing::debug!("Sending message");

        match message.status() {
            MessageStatus::Pending => {}
            MessageStatus::Failed => {
                if let Err(e) = message.mark_retry() {
                    return self.reject(
                        message,
                        MailError::Validation(format!("message cannot be retried: {}", e)),
                    );
                }
            }
            other => {
                return self.reject(
                    message,
                    MailError::Validation(format!("message is already {}", other)),
                )
            }
        }

        if message.from.is_none() {
            message.from = self.config.default_from();
        }

        if let Err(e) = message.validate() {
            return self.reject(message, e);
        }

        // A resubmitted failure is the same message, not a repeat.
        let dedup_checked = self.config.enable_deduplication && message.retry_count() == 0;
        if dedup_checked && self.dedup.is_duplicate(message) {
            return self.reject(
                message,
                MailError::Duplicate(format!(
                    "identical message sent within the last {}h",
                    self.config.deduplication_window_hours
                )),
            );
        }

        if message.is_templated() {
            if let Err(e) = self.resolve_template(message).await {
                if dedup_checked {
                    self.dedup.forget(message);
                }
                return self.reject(message, e);
            }
        }

        if !options.immediate && self.should_queue(message) {
            return self.enqueue(message, options.provider.as_deref()).await;
        }

        self.deliver_now(message, options.provider.as_deref()).await
    }

    fn reject(&self, message: &Message, error: MailError) -> SendResult {
        tracing::warn!(error = %error, "Message rejected");

        #[cfg(feature = "metrics")]
        metrics::counter!("courier_emails_total", "provider" => "none", "status" => "rejected")
            .increment(1);

        SendResult::from_message(message, SendStatus::Rejected, Some(error))
    }

    fn should_queue(&self, message: &Message) -> bool {
        self.config.queue_enabled
            && self.queue.is_some()
            && (message.is_scheduled_after(Utc::now()) || message.priority == Priority::Low)
    }

    async fn resolve_template(&self, message: &mut Message) -> Result<(), MailError> {
        let engine = self
            .templates
            .as_ref()
            .ok_or_else(|| MailError::Template("no template engine configured".into()))?;
        let name = message.template_name.clone().unwrap_or_default();
        let as_template_error = |e: MailError| match e {
            MailError::Template(_) => e,
            other => MailError::Template(format!("{}: {}", name, other)),
        };

        let template = engine.load_template(&name).await.map_err(as_template_error)?;
        let missing = template.missing_variables(&message.template_context);
        if !missing.is_empty() {
            return Err(MailError::Template(format!(
                "template '{}' is missing variables: {}",
                name,
                missing.join(", ")
            )));
        }

        let context = &message.template_context;
        let subject = engine
            .render_string(&template.subject_template, context)
            .await
            .map_err(as_template_error)?;
        let body = engine
            .render_string(&template.body_template, context)
            .await
            .map_err(as_template_error)?;

        message.subject = subject;
        match template.template_type {
            TemplateType::Html => message.html_body = Some(body),
            TemplateType::Text => message.text_body = Some(body),
        }
        tracing::debug!(template = %name, "Template rendered");
        Ok(())
    }

    async fn enqueue(&self, message: &mut Message, preferred: Option<&str>) -> SendResult {
        let Some(queue) = self.queue.as_ref() else {
            return self.deliver_now(message, preferred).await;
        };

        let mut queued = message.clone();
        if let Some(provider) = preferred {
            queued.set_attempt_provider(provider);
        }
        let item = match queued.mark_queued().and_then(|_| QueueMessage::from_message(&queued)) {
            Ok(item) => item,
            Err(e) => return SendResult::from_message(message, SendStatus::Failed, Some(e)),
        };
        let queue_id = item.id.clone();

        if let Err(e) = queue.enqueue(item).await {
            tracing::error!(error = %e, "Failed to enqueue message");
            return SendResult::from_message(message, SendStatus::Failed, Some(e));
        }

        *message = queued;
        tracing::info!(queue_id = %queue_id, send_at = ?message.send_at, "Message queued");

        #[cfg(feature = "metrics")]
        metrics::counter!("courier_emails_total", "provider" => "queue", "status" => "queued")
            .increment(1);

        SendResult::from_message(message, SendStatus::Queued, None)
    }

    // ========================================================================
    // Immediate delivery
    // ========================================================================

    /// Deliver through the provider order, bounded by the global semaphore
    /// and the message's expiry.
    async fn deliver_now(&self, message: &mut Message, preferred: Option<&str>) -> SendResult {
        if let Err(e) = message.mark_sending() {
            return SendResult::from_message(message, SendStatus::Failed, Some(e));
        }

        let deadline = (message.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let snapshot: &Message = message;
        let outcome = match tokio::time::timeout(deadline, self.try_providers(snapshot, preferred)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Attempted {
                provider: None,
                error: MailError::Expired(format!(
                    "message {} expired during delivery",
                    snapshot.id
                )),
            }),
        };

        match outcome {
            Ok((provider, delivery)) => {
                // Sending -> Sent cannot fail
                let _ = message.mark_sent(provider, delivery.message_id);
                tracing::info!(
                    provider = message.provider().unwrap_or_default(),
                    provider_message_id = message.provider_message_id().unwrap_or_default(),
                    "Message delivered"
                );
                SendResult::from_message(message, SendStatus::Sent, None)
            }
            Err(Attempted { provider, error }) => {
                if let Some(provider) = provider {
                    message.set_attempt_provider(provider);
                }
                let permanent = error.is_permanent();
                let summary = MailError::Exhausted(error.to_string());
                let _ = message.mark_failed(summary.to_string());
                tracing::error!(error = %error, "All providers failed");

                let mut result = SendResult::from_message(message, SendStatus::Failed, Some(summary));
                result.permanent = permanent;
                result
            }
        }
    }

    async fn try_providers(
        &self,
        message: &Message,
        preferred: Option<&str>,
    ) -> Result<(String, DeliveryResult), Attempted> {
        let _permit = self.semaphore.acquire().await.map_err(|_| Attempted {
            provider: None,
            error: MailError::Internal("courier is shut down".into()),
        })?;

        let mut last = Attempted {
            provider: None,
            error: MailError::Exhausted("no provider available".into()),
        };

        for name in self.provider_order(preferred) {
            let Some(mailer) = self.mailer(&name) else {
                tracing::warn!(provider = %name, "Preferred provider not registered, skipping");
                continue;
            };

            let breaker = self
                .config
                .circuit_breaker_enabled
                .then(|| self.breakers.get(&name));
            let admission = match breaker {
                Some(ref breaker) => match breaker.admit() {
                    Some(admission) => Some(admission),
                    None => {
                        tracing::warn!(provider = %name, "Circuit breaker open, skipping provider");
                        last = Attempted {
                            provider: Some(name.clone()),
                            error: MailError::CircuitOpen(name),
                        };
                        continue;
                    }
                },
                None => None,
            };

            let outcome = self
                .call_provider(&name, mailer.as_ref(), breaker.as_deref(), admission, message)
                .await;
            match outcome {
                Ok(delivery) => return Ok((name, delivery)),
                Err(error) => {
                    tracing::warn!(provider = %name, error = %error, "Provider failed");
                    last = Attempted {
                        provider: Some(name),
                        error,
                    };
                }
            }
        }

        Err(last)
    }

    /// One provider, with retries. `admission` covers the first attempt;
    /// later attempts are admitted again.
    ///
    /// A breaker that opens between attempts ends the retries, but the
    /// provider's own last error is what gets reported.
    async fn call_provider<'b>(
        &self,
        name: &str,
        mailer: &dyn Mailer,
        breaker: Option<&'b CircuitBreaker>,
        admission: Option<Admission<'b>>,
        message: &Message,
    ) -> Result<DeliveryResult, MailError> {
        #[cfg(feature = "metrics")]
        let start = std::time::Instant::now();

        let last_failure: Mutex<Option<MailError>> = Mutex::new(None);
        let last_failure_ref = &last_failure;
        let mut first = admission;

        let result = self
            .retry
            .execute(move |attempt| {
                let admitted = first.take();
                async move {
                    // Dropped on cancellation, which frees a half-open probe.
                    let admission = match (admitted, breaker) {
                        (Some(admission), _) => Some(admission),
                        (None, Some(breaker)) => match breaker.admit() {
                            Some(admission) => Some(admission),
                            None => return Err(MailError::CircuitOpen(name.to_string())),
                        },
                        (None, None) => None,
                    };

                    tracing::debug!(provider = %name, attempt, "Delivering");
                    let result = mailer.deliver(message).await;

                    if let Some(admission) = admission {
                        match result {
                            Ok(_) => admission.record_success(),
                            Err(ref e) if e.is_permanent() => drop(admission),
                            Err(_) => admission.record_failure(),
                        }
                    }
                    if let Err(ref e) = result {
                        *last_failure_ref.lock() = Some(e.clone());
                    }
                    result
                }
            })
            .await
            .map_err(|error| match error {
                MailError::CircuitOpen(_) => last_failure.lock().take().unwrap_or(error),
                error => error,
            });

        #[cfg(feature = "metrics")]
        {
            let status = if result.is_ok() { "sent" } else { "failed" };
            metrics::counter!("courier_emails_total", "provider" => name.to_string(), "status" => status)
                .increment(1);
            metrics::histogram!("courier_delivery_duration_seconds", "provider" => name.to_string())
                .record(start.elapsed().as_secs_f64());
        }

        result
    }

    // ========================================================================
    // Bulk
    // ========================================================================

    /// Send many messages in batches of `batch_size`.
    ///
    /// Each batch is sent concurrently (still bounded by the global
    /// semaphore) with a short pause between batches. A panic while sending
    /// one message becomes a FAILED result for that message only. Results
    /// are in input order.
    pub async fn send_bulk(&self, messages: &mut [Message], batch_size: usize) -> BulkResult {
        let batch_size = batch_size.max(1);
        let total = messages.len();
        let mut results = Vec::with_capacity(total);

        tracing::info!(total, batch_size, "Sending bulk messages");

        for (i, batch) in messages.chunks_mut(batch_size).enumerate() {
            if i > 0 && !self.config.bulk_batch_pause.is_zero() {
                tokio::time::sleep(self.config.bulk_batch_pause).await;
            }

            let sends = batch.iter_mut().map(|message| {
                let id = message.id.clone();
                AssertUnwindSafe(self.send(message))
                    .catch_unwind()
                    .map(move |outcome| {
                        outcome.unwrap_or_else(|_| {
                            tracing::error!(message_id = %id, "Send panicked");
                            SendResult::panicked(id)
                        })
                    })
            });
            results.extend(join_all(sends).await);
        }

        let bulk = BulkResult { results };
        tracing::info!(
            total,
            sent = bulk.success_count(),
            failed = bulk.failure_count(),
            queued = bulk.queued_count(),
            "Bulk send finished"
        );
        bulk
    }

    // ========================================================================
    // Queue processing
    // ========================================================================

    /// Drain due messages from the queue, `batch_size` at a time.
    ///
    /// Stops when the queue returns an empty batch, or a batch whose
    /// entries were all put back because their messages are not due yet.
    pub async fn process_queue(&self, batch_size: usize) -> Result<QueueStats, MailError> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| MailError::Configuration("no queue configured".into()))?;
        let batch_size = batch_size.max(1);
        let mut stats = QueueStats::default();

        loop {
            let batch = queue.get_batch(batch_size).await?;
            if batch.is_empty() {
                break;
            }

            let outcomes = join_all(batch.into_iter().map(|item| {
                let id = item.id.clone();
                AssertUnwindSafe(self.process_item(queue.as_ref(), item))
                    .catch_unwind()
                    .then(move |outcome| async move {
                        match outcome {
                            Ok(outcome) => outcome,
                            Err(_) => {
                                tracing::error!(queue_id = %id, "Queue item panicked");
                                let _ = queue.mark_failed(&id, "delivery task panicked").await;
                                ItemOutcome::Failed
                            }
                        }
                    })
            }))
            .await;

            let mut progressed = false;
            for outcome in outcomes {
                stats.processed += 1;
                match outcome {
                    ItemOutcome::Sent => {
                        stats.sent += 1;
                        progressed = true;
                    }
                    ItemOutcome::Failed => {
                        stats.failed += 1;
                        progressed = true;
                    }
                    ItemOutcome::Retried => {
                        stats.requeued += 1;
                        progressed = true;
                    }
                    ItemOutcome::NotDue => stats.requeued += 1,
                }
            }
            if !progressed {
                break;
            }
        }

        tracing::info!(
            processed = stats.processed,
            sent = stats.sent,
            failed = stats.failed,
            requeued = stats.requeued,
            "Queue processed"
        );
        Ok(stats)
    }

    async fn process_item(&self, queue: &dyn QueueBridge, item: QueueMessage) -> ItemOutcome {
        let mut message = match item.message() {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(queue_id = %item.id, error = %e, "Dropping unreadable queue item");
                ack(queue.mark_failed(&item.id, &e.to_string()).await);
                return ItemOutcome::Failed;
            }
        };

        if message.is_scheduled_after(Utc::now()) {
            ack(queue.requeue(item).await);
            return ItemOutcome::NotDue;
        }

        if message.is_expired() {
            ack(queue.mark_failed(&item.id, "message expired").await);
            return ItemOutcome::Failed;
        }

        let span = tracing::info_span!("courier.queue", queue_id = %item.id, message_id = %message.id);
        let preferred = message.provider().map(str::to_owned);
        let result = self
            .deliver_now(&mut message, preferred.as_deref())
            .instrument(span)
            .await;

        if result.is_sent() {
            ack(queue.mark_completed(&item.id).await);
            return ItemOutcome::Sent;
        }

        let reason = result
            .error_message()
            .unwrap_or_else(|| "delivery failed".to_string());

        if !result.permanent && message.status() == MessageStatus::Failed && message.can_retry() {
            match self.schedule_retry(queue, &item, &mut message).await {
                Ok(retry_id) => {
                    tracing::warn!(
                        queue_id = %item.id,
                        retry_queue_id = %retry_id,
                        retry_count = message.retry_count(),
                        "Delivery failed, retry scheduled"
                    );
                    ack(queue
                        .mark_failed(&item.id, &format!("retrying as {}: {}", retry_id, reason))
                        .await);
                    return ItemOutcome::Retried;
                }
                Err(e) => tracing::error!(queue_id = %item.id, error = %e, "Failed to schedule retry"),
            }
        }

        ack(queue.mark_failed(&item.id, &reason).await);
        ItemOutcome::Failed
    }

    async fn schedule_retry(
        &self,
        queue: &dyn QueueBridge,
        item: &QueueMessage,
        message: &mut Message,
    ) -> Result<String, MailError> {
        message.mark_retry()?;
        message.mark_queued()?;

        let delay = chrono::Duration::from_std(self.config.queue_retry_delay)
            .map_err(|e| MailError::Configuration(e.to_string()))?;
        let retry = QueueMessage {
            scheduled_at: Utc::now() + delay,
            retry_count: item.retry_count + 1,
            ..QueueMessage::from_message(message)?
        };
        let retry_id = retry.id.clone();
        queue.enqueue(retry).await?;
        Ok(retry_id)
    }
}

/// Last failure seen while walking the provider order.
struct Attempted {
    provider: Option<String>,
    error: MailError,
}

fn ack(result: Result<(), MailError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "Queue acknowledgement failed");
    }
}

impl fmt::Debug for Courier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Courier")
            .field("providers", &self.providers())
            .field("default_provider", &self.default_provider)
            .field("fallback_providers", &self.fallback_providers)
            .field("available_permits", &self.semaphore.available_permits())
            .finish()
    }
}
