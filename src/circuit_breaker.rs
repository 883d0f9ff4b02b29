//! Per-provider circuit breaker.
//!
//! A breaker starts CLOSED and admits every call. After
//! `failure_threshold` failures without an intervening success it OPENs and
//! rejects calls until `recovery_timeout` has passed since the last failure.
//! The first admission check after that moves it to HALF_OPEN and lets
//! exactly one probe through; the probe's outcome closes or re-opens it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit waits before letting a probe through.
    #[serde(with = "crate::config::duration_secs")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(300),
        }
    }
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without contacting the provider.
    Open,
    /// One probe call is allowed to test recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker for one provider.
///
/// All transitions happen under a single lock, so concurrent failures never
/// under-count and only one caller can win the half-open probe.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call may go through now.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to
    /// HALF_OPEN here, and this call becomes the probe. Further checks
    /// return `false` until the probe's outcome is recorded or the probe
    /// is released. Prefer [`admit`](Self::admit), which releases the
    /// probe on drop.
    pub fn can_execute(&self) -> bool {
        self.try_admit().is_some()
    }

    /// Admit one call, or `None` while the circuit rejects calls.
    ///
    /// Dropping the returned [`Admission`] without recording an outcome
    /// (a cancelled or panicking call, a permanent rejection) releases
    /// the half-open probe so the next check can take it.
    pub fn admit(&self) -> Option<Admission<'_>> {
        self.try_admit().map(|probe| Admission {
            breaker: self,
            probe,
        })
    }

    /// `Some(true)` when the admitted call is the half-open probe.
    fn try_admit(&self) -> Option<bool> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout);
                if !recovered {
                    return None;
                }
                tracing::info!(provider = %self.name, "Circuit breaker half-open, sending probe");
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                Some(true)
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    None
                } else {
                    inner.probe_in_flight = true;
                    Some(true)
                }
            }
        }
    }

    /// Record a successful call. Closes the circuit and clears the count.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!(provider = %self.name, "Circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.probe_in_flight = false;
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        let trips = match inner.state {
            CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            // A straggler from before the circuit opened restarts the timer.
            CircuitState::Open => false,
        };

        if trips {
            // Keep the invariant OPEN => failure_count >= threshold.
            inner.failure_count = inner.failure_count.max(self.config.failure_threshold);
            inner.state = CircuitState::Open;
            inner.probe_in_flight = false;
            tracing::warn!(
                provider = %self.name,
                failures = inner.failure_count,
                "Circuit breaker opened"
            );

            #[cfg(feature = "metrics")]
            metrics::counter!("courier_breaker_open_total", "provider" => self.name.clone())
                .increment(1);
        }
    }

    /// Release a half-open probe whose call never reached the provider.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Current state without triggering any transition.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }
}

/// Permission for one call, handed out by [`CircuitBreaker::admit`].
#[must_use = "dropping an admission releases it without an outcome"]
#[derive(Debug)]
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
}

impl Admission<'_> {
    /// Whether this call is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.probe = false;
        self.breaker.record_success();
    }

    pub fn record_failure(mut self) {
        self.probe = false;
        self.breaker.record_failure();
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.probe {
            tracing::debug!(provider = %self.breaker.name, "Half-open probe released without outcome");
            self.breaker.release_probe();
        }
    }
}

/// Lazily-created breakers, one per provider.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for `provider`, created on first use.
    pub fn get(&self, provider: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        Arc::clone(
            breakers
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(provider, self.config.clone()))),
        )
    }

    /// Breaker for `provider` if one was created.
    pub fn peek(&self, provider: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(provider).cloned()
    }
}
