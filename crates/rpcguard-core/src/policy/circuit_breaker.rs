//! Three-state circuit breaker: Closed → Open → Half-Open.
//!
//! State transitions:
//! - `Closed` → `Open`:      consecutive failures reach `threshold`
//! - `Open` → `Half-Open`:   the first call after `half_open_after` becomes the trial
//! - `Half-Open` → `Closed`: trial call succeeds
//! - `Half-Open` → `Open`:   trial call fails
//!
//! While the trial is in flight every other call is rejected.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::chain::Interceptor;
use crate::envelope::{CallEnvelope, Payload};
use crate::error::{CallError, ConfigError};
use crate::handler::{CallHandler, Handler};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// All requests rejected until `half_open_after` has elapsed.
    Open,
    /// One trial call in flight to test the dependency.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening.
    pub threshold: u32,
    /// How long to stay open before letting a trial call through.
    pub half_open_after: Duration,
    /// Let streaming calls through without accounting.
    pub bypass_streaming: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            half_open_after: Duration::from_secs(30),
            bypass_streaming: true,
        }
    }
}

struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Thread-safe circuit breaker interceptor.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitInner>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in `Closed` state.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        if config.threshold == 0 {
            return Err(ConfigError::invalid("threshold", "must be greater than zero"));
        }
        Ok(Self {
            config,
            inner: Arc::new(Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state. An `Open` breaker whose wait has elapsed still reports
    /// `Open` until a call arrives to become the trial.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn acquire(&self) -> Result<Admission, CallError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.half_open_after)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!("circuit breaker → half-open");
                    Ok(Admission::Trial)
                } else {
                    Err(self.rejection())
                }
            }
            CircuitState::HalfOpen => Err(self.rejection()),
        }
    }

    fn rejection(&self) -> CallError {
        CallError::CircuitOpen {
            threshold: self.config.threshold,
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut inner = self.lock();
        match (admission, inner.state) {
            (Admission::Trial, CircuitState::HalfOpen) => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                tracing::info!("circuit breaker → closed");
            }
            (Admission::Normal, CircuitState::Closed) => {
                inner.consecutive_failures = 0;
            }
            // Stragglers admitted before the circuit opened.
            _ => {}
        }
    }

    fn record_failure(&self, admission: Admission) {
        let mut inner = self.lock();
        match (admission, inner.state) {
            (Admission::Normal, CircuitState::Closed) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker → open"
                    );
                }
            }
            (Admission::Trial, CircuitState::HalfOpen) => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                tracing::warn!("circuit breaker trial failed → open");
            }
            _ => {}
        }
    }

    /// The trial call was dropped before it produced an outcome. Reopen
    /// without restarting the wait so the next caller becomes the trial.
    fn abandon_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            tracing::debug!("circuit breaker trial abandoned → open");
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("threshold", &self.config.threshold)
            .finish()
    }
}

impl Interceptor for CircuitBreaker {
    fn name(&self) -> &str {
        "circuit_breaker"
    }

    fn intercept(&self, next: Handler) -> Handler {
        Arc::new(BreakerHandler {
            breaker: self.clone(),
            next,
        })
    }
}

struct BreakerHandler {
    breaker: CircuitBreaker,
    next: Handler,
}

/// Resets a dropped trial back to `Open`.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_trial();
        }
    }
}

#[async_trait]
impl CallHandler for BreakerHandler {
    async fn call(&self, call: CallEnvelope) -> Result<Payload, CallError> {
        if call.streaming && self.breaker.config.bypass_streaming {
            return self.next.call(call).await;
        }

        let admission = self.breaker.acquire()?;
        let mut guard = TrialGuard {
            breaker: &self.breaker,
            armed: admission == Admission::Trial,
        };
        let result = self.next.call(call).await;
        guard.armed = false;

        match &result {
            Ok(_) => self.breaker.record_success(admission),
            Err(_) => self.breaker.record_failure(admission),
        }
        result
    }
}
