//! End-to-end tests for the delivery engine.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use courier::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use courier::providers::LocalMailer;
use courier::retry::RetryConfig;
use courier::template::MemoryTemplateEngine;
use courier::{
    Courier, CourierConfig, DeliveryResult, EmailTemplate, MailError, Mailer, MemoryQueue,
    Message, MessageStatus, Priority, SendOptions, SendStatus, TemplateType,
};

// ============================================================================
// Helpers
// ============================================================================

fn config() -> CourierConfig {
    CourierConfig {
        default_from_email: Some("app@example.com".into()),
        retry: RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        },
        ..CourierConfig::default()
    }
}

fn with_fallback(config: CourierConfig) -> CourierConfig {
    CourierConfig {
        fallback_providers: vec!["b".into()],
        ..config
    }
}

fn two_providers(config: CourierConfig) -> (Courier, LocalMailer, LocalMailer) {
    let a = LocalMailer::named("a");
    let b = LocalMailer::named("b");
    let courier = Courier::builder()
        .provider("a", a.clone())
        .provider("b", b.clone())
        .config(with_fallback(config))
        .build()
        .unwrap();
    (courier, a, b)
}

fn message(subject: &str) -> Message {
    Message::new()
        .to("user@example.com")
        .subject(subject)
        .text_body("Hello")
}

// ============================================================================
// Immediate delivery
// ============================================================================

#[tokio::test]
async fn delivers_through_default_provider() {
    let (courier, a, b) = two_providers(config());
    let mut m = message("Welcome");

    let result = courier.send(&mut m).await;

    assert_eq!(result.status, SendStatus::Sent);
    assert_eq!(result.provider.as_deref(), Some("a"));
    assert!(result.provider_message_id.is_some());
    assert!(result.sent_at.is_some());
    assert_eq!(m.status(), MessageStatus::Sent);
    assert_eq!(m.provider(), Some("a"));
    assert_eq!(a.message_count(), 1);
    assert_eq!(b.message_count(), 0);
}

#[tokio::test]
async fn preferred_provider_goes_first() {
    let (courier, a, b) = two_providers(config());
    let mut m = message("Welcome");

    let result = courier
        .send_with(&mut m, SendOptions::default().provider("b"))
        .await;

    assert_eq!(result.provider.as_deref(), Some("b"));
    assert_eq!(a.call_count(), 0);
    assert_eq!(b.message_count(), 1);
}

#[tokio::test]
async fn unknown_preferred_provider_is_skipped() {
    let (courier, a, _b) = two_providers(config());
    let mut m = message("Welcome");

    let result = courier
        .send_with(&mut m, SendOptions::default().provider("ghost"))
        .await;

    assert_eq!(result.status, SendStatus::Sent);
    assert_eq!(a.message_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn fails_over_after_retries() {
    let (courier, a, b) = two_providers(config());
    a.set_failure("connection reset");
    let mut m = message("Failover");

    let started = Instant::now();
    let result = courier.send(&mut m).await;

    assert_eq!(result.status, SendStatus::Sent);
    assert_eq!(result.provider.as_deref(), Some("b"));
    assert_eq!(a.call_count(), 3);
    assert_eq!(b.call_count(), 1);
    // one breaker failure per attempt
    assert_eq!(courier.circuit_breaker("a").unwrap().failure_count(), 3);
    assert_eq!(courier.breaker_state("a"), CircuitState::Closed);
    // 1s + 2s backoff on provider a
    assert_eq!(started.elapsed(), Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn transient_failures_recover_within_retries() {
    let (courier, a, b) = two_providers(config());
    a.fail_times(2);
    let mut m = message("Eventually");

    let result = courier.send(&mut m).await;

    assert_eq!(result.provider.as_deref(), Some("a"));
    assert_eq!(a.call_count(), 3);
    assert_eq!(b.call_count(), 0);
    assert_eq!(courier.circuit_breaker("a").unwrap().failure_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn all_providers_down_fails() {
    let (courier, a, b) = two_providers(config());
    a.set_failure("down");
    b.set_failure("also down");
    let mut m = message("Nobody home");

    let result = courier.send(&mut m).await;

    assert_eq!(result.status, SendStatus::Failed);
    assert!(matches!(result.error, Some(MailError::Exhausted(_))));
    assert!(result.error_message().unwrap().contains("also down"));
    assert!(!result.permanent);
    assert_eq!(result.provider.as_deref(), Some("b"));
    assert_eq!(m.status(), MessageStatus::Failed);
    assert!(m.error_message().is_some());
    assert!(m.can_retry());
}

#[tokio::test(start_paused = true)]
async fn failed_message_can_be_resubmitted() {
    let (courier, a, b) = two_providers(config());
    a.set_failure("down");
    b.set_failure("down");
    let mut m = message("Second chance");
    assert_eq!(courier.send(&mut m).await.status, SendStatus::Failed);

    a.clear_failure();
    let result = courier.send(&mut m).await;

    // resubmission is not a duplicate
    assert_eq!(result.status, SendStatus::Sent);
    assert_eq!(result.retry_count, 1);
    assert_eq!(m.retry_count(), 1);
}

#[tokio::test]
async fn sent_message_cannot_be_resent() {
    let (courier, a, _b) = two_providers(config());
    let mut m = message("Once");
    courier.send(&mut m).await;

    let result = courier.send(&mut m).await;

    assert_eq!(result.status, SendStatus::Rejected);
    assert!(matches!(result.error, Some(MailError::Validation(_))));
    assert_eq!(a.call_count(), 1);
}

#[tokio::test]
async fn permanent_rejection_skips_retries_but_not_fallbacks() {
    let (courier, a, b) = two_providers(config());
    a.set_permanent_failure("mailbox unavailable");
    let mut m = message("Picky");

    let result = courier.send(&mut m).await;

    assert_eq!(result.provider.as_deref(), Some("b"));
    assert_eq!(a.call_count(), 1);
    assert_eq!(courier.circuit_breaker("a").unwrap().failure_count(), 0);
    assert!(b.sent_to("user@example.com"));
}

#[tokio::test]
async fn permanent_rejection_everywhere_is_flagged() {
    let mailer = LocalMailer::named("only");
    mailer.set_permanent_failure("domain does not accept mail");
    let courier = Courier::builder()
        .provider("only", mailer.clone())
        .config(config())
        .build()
        .unwrap();
    let mut m = message("Nope");

    let result = courier.send(&mut m).await;

    assert_eq!(result.status, SendStatus::Failed);
    assert!(result.permanent);
    assert_eq!(mailer.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_provider_times_out_and_fails_over() {
    let (courier, a, b) = two_providers(CourierConfig {
        provider_timeout: Duration::from_secs(1),
        retry: RetryConfig::none(),
        ..config()
    });
    a.set_delay(Duration::from_secs(5));
    let mut m = message("Slow");

    let result = courier.send(&mut m).await;

    assert_eq!(result.provider.as_deref(), Some("b"));
    assert_eq!(a.message_count(), 0);
    assert_eq!(courier.circuit_breaker("a").unwrap().failure_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn delivery_is_bounded_by_expiry() {
    let mailer = LocalMailer::named("slow");
    mailer.set_delay(Duration::from_secs(10));
    let courier = Courier::builder()
        .provider("slow", mailer)
        .config(config())
        .build()
        .unwrap();
    let mut m = message("Hurry").expires_at(Utc::now() + chrono::Duration::seconds(2));

    let result = courier.send(&mut m).await;

    assert_eq!(result.status, SendStatus::Failed);
    assert!(result.error_message().unwrap().contains("expired"));
    assert_eq!(m.status(), MessageStatus::Failed);
}

// ============================================================================
// Circuit breaking
// ============================================================================

fn breaker_config() -> CourierConfig {
    CourierConfig {
        retry: RetryConfig::none(),
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        },
        ..config()
    }
}

#[tokio::test(start_paused = true)]
async fn open_breaker_skips_provider() {
    let (courier, a, b) = two_providers(breaker_config());
    a.set_failure("down");

    courier.send(&mut message("one")).await;
    courier.send(&mut message("two")).await;
    assert_eq!(courier.breaker_state("a"), CircuitState::Open);
    assert_eq!(a.call_count(), 2);

    let result = courier.send(&mut message("three")).await;

    assert_eq!(result.provider.as_deref(), Some("b"));
    assert_eq!(a.call_count(), 2);
    assert_eq!(b.message_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn breaker_recovers_after_timeout() {
    let (courier, a, _b) = two_providers(breaker_config());
    a.set_failure("down");
    courier.send(&mut message("one")).await;
    courier.send(&mut message("two")).await;
    assert_eq!(courier.breaker_state("a"), CircuitState::Open);

    a.clear_failure();
    tokio::time::advance(Duration::from_secs(61)).await;
    let result = courier.send(&mut message("three")).await;

    assert_eq!(result.provider.as_deref(), Some("a"));
    assert_eq!(courier.breaker_state("a"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_reopens_and_restarts_recovery() {
    let (courier, a, b) = two_providers(breaker_config());
    a.set_failure("down");
    courier.send(&mut message("one")).await;
    courier.send(&mut message("two")).await;

    tokio::time::advance(Duration::from_secs(61)).await;
    let result = courier.send(&mut message("three")).await;

    assert_eq!(result.provider.as_deref(), Some("b"));
    assert_eq!(a.call_count(), 3);
    assert_eq!(courier.breaker_state("a"), CircuitState::Open);

    courier.send(&mut message("four")).await;
    tokio::time::advance(Duration::from_secs(59)).await;
    courier.send(&mut message("five")).await;
    assert_eq!(a.call_count(), 3);

    a.clear_failure();
    tokio::time::advance(Duration::from_secs(2)).await;
    let result = courier.send(&mut message("six")).await;

    assert_eq!(result.provider.as_deref(), Some("a"));
    assert_eq!(courier.breaker_state("a"), CircuitState::Closed);
    assert_eq!(b.message_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn expired_probe_frees_the_half_open_slot() {
    let a = LocalMailer::named("a");
    let courier = Courier::builder()
        .provider("a", a.clone())
        .config(CourierConfig {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(60),
            },
            ..breaker_config()
        })
        .build()
        .unwrap();
    a.set_failure("down");
    courier.send(&mut message("one")).await;
    assert_eq!(courier.breaker_state("a"), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(61)).await;
    a.clear_failure();
    a.set_delay(Duration::from_secs(10));
    let mut hurried = message("two").expires_at(Utc::now() + chrono::Duration::seconds(2));
    let result = courier.send(&mut hurried).await;

    assert_eq!(result.status, SendStatus::Failed);
    assert!(result.error_message().unwrap().contains("expired"));
    assert_eq!(courier.breaker_state("a"), CircuitState::HalfOpen);

    a.set_delay(Duration::ZERO);
    let result = courier.send(&mut message("three")).await;

    assert_eq!(result.status, SendStatus::Sent);
    assert_eq!(result.provider.as_deref(), Some("a"));
    assert_eq!(courier.breaker_state("a"), CircuitState::Closed);
    assert_eq!(a.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn only_one_send_takes_the_half_open_probe() {
    let (courier, a, b) = two_providers(breaker_config());
    a.set_failure("down");
    courier.send(&mut message("one")).await;
    courier.send(&mut message("two")).await;

    tokio::time::advance(Duration::from_secs(61)).await;
    a.clear_failure();
    a.set_delay(Duration::from_secs(1));
    let mut first = message("three");
    let mut second = message("four");
    let (r1, r2) = tokio::join!(courier.send(&mut first), courier.send(&mut second));

    let mut providers = vec![r1.provider.unwrap(), r2.provider.unwrap()];
    providers.sort();
    assert_eq!(providers, vec!["a", "b"]);
    assert_eq!(a.call_count(), 3);
    assert_eq!(b.message_count(), 3);
    assert_eq!(courier.breaker_state("a"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn breaker_tripping_mid_retry_keeps_provider_error() {
    let a = LocalMailer::named("a");
    let courier = Courier::builder()
        .provider("a", a.clone())
        .config(CourierConfig {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
            },
            ..config()
        })
        .build()
        .unwrap();
    a.set_failure("connection reset");

    let result = courier.send(&mut message("Flaky")).await;

    assert_eq!(result.status, SendStatus::Failed);
    assert_eq!(a.call_count(), 2);
    assert_eq!(courier.breaker_state("a"), CircuitState::Open);
    let error = result.error_message().unwrap();
    assert!(error.contains("connection reset"), "{error}");
    assert!(!error.contains("Circuit breaker"), "{error}");
}

#[tokio::test(start_paused = true)]
async fn disabled_breaker_never_skips() {
    let (courier, a, _b) = two_providers(CourierConfig {
        circuit_breaker_enabled: false,
        ..breaker_config()
    });
    a.set_failure("down");

    for subject in ["one", "two", "three", "four"] {
        courier.send(&mut message(subject)).await;
    }

    assert_eq!(a.call_count(), 4);
    assert!(courier.circuit_breaker("a").is_none());
}

// ============================================================================
// Admission: validation, deduplication, expiry
// ============================================================================

#[tokio::test]
async fn invalid_message_is_rejected() {
    let (courier, a, _b) = two_providers(config());

    let no_recipient = courier.send(&mut Message::new().subject("Hi")).await;
    let bad_address = courier.send(&mut message("Hi").cc("not-an-address")).await;
    let empty = courier.send(&mut Message::new().to("user@example.com")).await;

    for result in [&no_recipient, &bad_address, &empty] {
        assert_eq!(result.status, SendStatus::Rejected);
        assert!(result.error.as_ref().unwrap().is_rejection());
    }
    assert_eq!(a.call_count(), 0);
}

#[tokio::test]
async fn expired_message_is_rejected() {
    let (courier, a, _b) = two_providers(config());
    let mut m = message("Too late").expires_at(Utc::now() - chrono::Duration::minutes(1));

    let result = courier.send(&mut m).await;

    assert_eq!(result.status, SendStatus::Rejected);
    assert!(matches!(result.error, Some(MailError::Expired(_))));
    assert_eq!(m.status(), MessageStatus::Pending);
    assert_eq!(a.call_count(), 0);
}

#[tokio::test]
async fn duplicate_is_rejected_without_calling_provider() {
    let (courier, a, _b) = two_providers(config());

    let first = courier.send(&mut message("Receipt")).await;
    let second = courier.send(&mut message("Receipt")).await;

    assert_eq!(first.status, SendStatus::Sent);
    assert_eq!(second.status, SendStatus::Rejected);
    assert!(matches!(second.error, Some(MailError::Duplicate(_))));
    assert_eq!(a.call_count(), 1);
}

#[tokio::test]
async fn deduplication_can_be_disabled() {
    let (courier, a, _b) = two_providers(CourierConfig {
        enable_deduplication: false,
        ..config()
    });

    courier.send(&mut message("Receipt")).await;
    courier.send(&mut message("Receipt")).await;

    assert_eq!(a.message_count(), 2);
}

#[tokio::test]
async fn default_sender_is_applied() {
    let (courier, a, _b) = two_providers(CourierConfig {
        default_from_name: Some("My App".into()),
        ..config()
    });

    courier.send(&mut message("Hi")).await;
    courier
        .send(&mut message("Hi again").from("owner@example.com"))
        .await;

    let captured = a.messages();
    let senders: Vec<_> = captured
        .iter()
        .map(|s| s.message.from.clone().unwrap().email)
        .collect();
    assert!(senders.contains(&"app@example.com".to_string()));
    assert!(senders.contains(&"owner@example.com".to_string()));
    let defaulted = a.find_messages(|m| m.subject == "Hi");
    assert_eq!(
        defaulted[0].message.from.as_ref().unwrap().name.as_deref(),
        Some("My App")
    );
}

// ============================================================================
// Concurrency and rate limiting
// ============================================================================

#[tokio::test(start_paused = true)]
async fn concurrency_is_bounded() {
    let mailer = LocalMailer::named("local");
    mailer.set_delay(Duration::from_millis(100));
    let courier = Courier::builder()
        .provider("local", mailer.clone())
        .config(CourierConfig {
            max_concurrent_sends: 3,
            ..config()
        })
        .build()
        .unwrap();
    let mut messages: Vec<_> = (0..10).map(|i| message(&format!("Message {}", i))).collect();

    let bulk = courier.send_bulk(&mut messages, 10).await;

    assert_eq!(bulk.success_count(), 10);
    assert_eq!(mailer.peak_in_flight(), 3);
    assert_eq!(mailer.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_delays_excess_calls() {
    let (courier, a, _b) = two_providers(CourierConfig {
        rate_limit_per_minute: 2,
        ..config()
    });

    let started = Instant::now();
    for i in 0..3 {
        let result = courier.send(&mut message(&format!("Tick {}", i))).await;
        assert_eq!(result.provider.as_deref(), Some("a"));
    }

    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(a.message_count(), 3);
}

// ============================================================================
// Templates
// ============================================================================

fn templated(engine: MemoryTemplateEngine) -> (Courier, LocalMailer) {
    let mailer = LocalMailer::named("local");
    let courier = Courier::builder()
        .provider("local", mailer.clone())
        .template_engine(Arc::new(engine))
        .config(config())
        .build()
        .unwrap();
    (courier, mailer)
}

fn welcome_template() -> EmailTemplate {
    EmailTemplate::new(
        "welcome",
        "Welcome, {{ name }}",
        "<p>Hi {{ name }}, your code is {code}</p>",
        TemplateType::Html,
    )
}

#[tokio::test]
async fn renders_template_before_delivery() {
    let (courier, mailer) = templated(MemoryTemplateEngine::new().with_template(welcome_template()));
    let mut m = Message::new()
        .to("alice@example.com")
        .template("welcome")
        .template_var("name", "Alice")
        .template_var("code", 1234);

    let result = courier.send(&mut m).await;

    assert_eq!(result.status, SendStatus::Sent);
    let stored = mailer.last_message().unwrap().message;
    assert_eq!(stored.subject, "Welcome, Alice");
    assert_eq!(
        stored.html_body.as_deref(),
        Some("<p>Hi Alice, your code is 1234</p>")
    );
}

#[tokio::test]
async fn text_template_fills_text_body() {
    let template = EmailTemplate::new("plain", "Code", "Your code is {code}", TemplateType::Text);
    let (courier, mailer) = templated(MemoryTemplateEngine::new().with_template(template));
    let mut m = Message::new()
        .to("bob@example.com")
        .template("plain")
        .template_var("code", "X9");

    courier.send(&mut m).await;

    let stored = mailer.last_message().unwrap().message;
    assert_eq!(stored.text_body.as_deref(), Some("Your code is X9"));
    assert!(stored.html_body.is_none());
}

#[tokio::test]
async fn missing_template_variables_reject() {
    let (courier, mailer) = templated(MemoryTemplateEngine::new().with_template(welcome_template()));
    let mut m = Message::new()
        .to("alice@example.com")
        .template("welcome")
        .template_var("name", "Alice");

    let result = courier.send(&mut m).await;

    assert_eq!(result.status, SendStatus::Rejected);
    assert!(matches!(result.error, Some(MailError::Template(ref msg)) if msg.contains("code")));
    assert_eq!(mailer.call_count(), 0);

    // fixing the context is not a duplicate
    let mut fixed = m.clone().template_var("code", 1);
    assert_eq!(courier.send(&mut fixed).await.status, SendStatus::Sent);
}

#[tokio::test]
async fn unknown_template_rejects() {
    let (courier, _mailer) = templated(MemoryTemplateEngine::new());
    let mut m = Message::new().to("alice@example.com").template("nope");

    let result = courier.send(&mut m).await;

    assert_eq!(result.status, SendStatus::Rejected);
    assert!(matches!(result.error, Some(MailError::Template(_))));
}

#[tokio::test]
async fn template_without_engine_rejects() {
    let (courier, _a, _b) = two_providers(config());
    let mut m = Message::new().to("alice@example.com").template("welcome");

    let result = courier.send(&mut m).await;

    assert!(matches!(result.error, Some(MailError::Template(ref msg)) if msg.contains("no template engine")));
}

// ============================================================================
// Queueing decisions
// ============================================================================

fn queued_courier(config: CourierConfig) -> (Courier, LocalMailer, Arc<MemoryQueue>) {
    let mailer = LocalMailer::named("local");
    let queue = Arc::new(MemoryQueue::new());
    let courier = Courier::builder()
        .provider("local", mailer.clone())
        .queue(queue.clone())
        .config(config)
        .build()
        .unwrap();
    (courier, mailer, queue)
}

#[tokio::test]
async fn low_priority_is_queued() {
    let (courier, mailer, queue) = queued_courier(config());
    let mut m = message("Newsletter").priority(Priority::Low);

    let result = courier.send(&mut m).await;

    assert_eq!(result.status, SendStatus::Queued);
    assert_eq!(m.status(), MessageStatus::Queued);
    assert_eq!(queue.len(), 1);
    assert_eq!(mailer.call_count(), 0);
}

#[tokio::test]
async fn scheduled_message_is_queued_for_later() {
    let (courier, _mailer, queue) = queued_courier(config());
    let at = Utc::now() + chrono::Duration::hours(2);
    let mut m = message("Reminder").send_at(at);

    let result = courier.send(&mut m).await;

    assert_eq!(result.status, SendStatus::Queued);
    assert_eq!(queue.pending()[0].scheduled_at, at);
}

#[tokio::test]
async fn urgent_message_is_sent_now() {
    let (courier, mailer, queue) = queued_courier(config());

    let result = courier
        .send(&mut message("Alert").priority(Priority::Urgent))
        .await;

    assert_eq!(result.status, SendStatus::Sent);
    assert!(queue.is_empty());
    assert_eq!(mailer.message_count(), 1);
}

#[tokio::test]
async fn immediate_option_bypasses_queue() {
    let (courier, mailer, queue) = queued_courier(config());
    let mut m = message("Newsletter").priority(Priority::Low);

    let result = courier.send_with(&mut m, SendOptions::default().immediate()).await;

    assert_eq!(result.status, SendStatus::Sent);
    assert!(queue.is_empty());
    assert_eq!(mailer.message_count(), 1);
}

#[tokio::test]
async fn disabled_queue_sends_now() {
    let (courier, mailer, queue) = queued_courier(CourierConfig {
        queue_enabled: false,
        ..config()
    });

    courier
        .send(&mut message("Newsletter").priority(Priority::Low))
        .await;

    assert!(queue.is_empty());
    assert_eq!(mailer.message_count(), 1);
}

// ============================================================================
// Bulk
// ============================================================================

struct Explosive;

#[async_trait]
impl Mailer for Explosive {
    async fn deliver(&self, message: &Message) -> Result<DeliveryResult, MailError> {
        if message.subject == "boom" {
            panic!("provider bug");
        }
        Ok(DeliveryResult::new(format!("ok-{}", message.id)))
    }
}

#[tokio::test]
async fn bulk_reports_every_outcome_in_order() {
    let (courier, _mailer, _queue) = queued_courier(config());
    let mut messages = vec![
        message("one"),
        message("two").priority(Priority::Low),
        Message::new().subject("no recipients"),
        message("four"),
    ];

    let bulk = courier.send_bulk(&mut messages, 2).await;

    let statuses: Vec<_> = bulk.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            SendStatus::Sent,
            SendStatus::Queued,
            SendStatus::Rejected,
            SendStatus::Sent
        ]
    );
    assert_eq!(bulk.total(), 4);
    assert_eq!(bulk.success_count(), 2);
    assert_eq!(bulk.failure_count(), 1);
    assert_eq!(bulk.queued(), vec![messages[1].id.as_str()]);
    assert!((bulk.success_rate() - 50.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn panicking_send_fails_only_that_message() {
    let courier = Courier::builder()
        .provider("explosive", Explosive)
        .config(CourierConfig {
            retry: RetryConfig::none(),
            ..config()
        })
        .build()
        .unwrap();
    let mut messages = vec![message("fine"), message("boom"), message("also fine")];

    let bulk = courier.send_bulk(&mut messages, 3).await;

    assert_eq!(bulk.success_count(), 2);
    assert_eq!(bulk.results[1].status, SendStatus::Failed);
    assert!(matches!(bulk.results[1].error, Some(MailError::Internal(_))));
    assert_eq!(bulk.results[1].message_id, messages[1].id);
}

#[tokio::test]
async fn empty_bulk() {
    let (courier, _a, _b) = two_providers(config());
    let bulk = courier.send_bulk(&mut [], 10).await;
    assert_eq!(bulk.total(), 0);
    assert_eq!(bulk.success_rate(), 0.0);
}

// ============================================================================
// Health and process-wide courier
// ============================================================================

#[tokio::test]
async fn provider_health_reports_each_provider() {
    let (courier, _a, b) = two_providers(config());
    b.set_unhealthy(true);

    let health = courier.provider_health().await;

    assert_eq!(health.len(), 2);
    assert_eq!(health["a"], true);
    assert_eq!(health["b"], false);
}

#[tokio::test]
async fn process_wide_courier() {
    let mailer = LocalMailer::named("global");
    courier::configure(
        Courier::builder()
            .provider("global", mailer.clone())
            .config(config())
            .build()
            .unwrap(),
    );

    let result = courier::send(&mut message("Global")).await.unwrap();
    assert_eq!(result.status, SendStatus::Sent);
    assert_eq!(mailer.message_count(), 1);

    courier::reset();
    let err = courier::send(&mut message("Nobody")).await.unwrap_err();
    assert!(matches!(err, MailError::Configuration(_)));
}
