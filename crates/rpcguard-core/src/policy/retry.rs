//! Exponential backoff retry policy.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::chain::Interceptor;
use crate::envelope::{CallEnvelope, Payload};
use crate::error::{CallError, Code, ConfigError};
use crate::handler::{CallHandler, Handler};

/// Codes a caller can reasonably expect to clear on their own.
pub fn default_retryable_codes() -> HashSet<Code> {
    HashSet::from([Code::Unavailable, Code::ResourceExhausted])
}

/// Configuration for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum backoff delay (caps exponential growth).
    pub max_delay: Duration,
    /// Failure codes that trigger a retry.
    pub retryable_codes: HashSet<Code>,
    /// Let streaming calls through without retrying.
    pub bypass_streaming: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            retryable_codes: default_retryable_codes(),
            bypass_streaming: true,
        }
    }
}

/// Stateless retry policy: computes delays and classifies failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before retry number `attempt + 1`, i.e.
    /// `min(initial_delay × 2^attempt, max_delay)` with `attempt` starting at 0.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let max = self.config.max_delay;
        let nanos = 1u128
            .checked_shl(attempt)
            .and_then(|factor| self.config.initial_delay.as_nanos().checked_mul(factor));
        match nanos {
            Some(n) if n < max.as_nanos() => {
                // `n` is below `max`, so the whole seconds fit in a u64.
                Duration::new((n / 1_000_000_000) as u64, (n % 1_000_000_000) as u32)
            }
            _ => max,
        }
    }

    /// Returns `true` if `attempt` retries have been made and another is allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.config.max_retries
    }

    pub fn is_retryable(&self, err: &CallError) -> bool {
        self.config.retryable_codes.contains(&err.code())
    }
}

/// Interceptor re-invoking the wrapped handler on retryable failures.
pub struct Retry {
    policy: Arc<RetryPolicy>,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Result<Self, ConfigError> {
        // `Duration` and `u32` already exclude negative and non-finite values;
        // those are rejected when parsing configuration documents.
        Ok(Self {
            policy: Arc::new(RetryPolicy::new(config)),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Interceptor for Retry {
    fn name(&self) -> &str {
        "retry"
    }

    fn intercept(&self, next: Handler) -> Handler {
        Arc::new(RetryHandler {
            policy: self.policy.clone(),
            next,
        })
    }
}

struct RetryHandler {
    policy: Arc<RetryPolicy>,
    next: Handler,
}

#[async_trait]
impl CallHandler for RetryHandler {
    async fn call(&self, call: CallEnvelope) -> Result<Payload, CallError> {
        if call.streaming && self.policy.config.bypass_streaming {
            return self.next.call(call).await;
        }

        let mut attempt = 0u32;
        loop {
            let err = match self.next.call(call.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(e) => e,
            };
            if !self.policy.is_retryable(&err) {
                return Err(err);
            }
            if !self.policy.should_retry(attempt) {
                tracing::warn!(
                    attempt,
                    error = %err,
                    method = %call.full_method(),
                    "max retries exceeded"
                );
                return Err(err);
            }

            let delay = self.policy.next_delay(attempt);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                method = %call.full_method(),
                "retrying call"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = call.cancel.cancelled() => {
                    tracing::debug!(attempt, "call cancelled during backoff");
                    return Err(err);
                }
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32, initial_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            ..Default::default()
        })
    }

    fn failing(code: Code, hits: Arc<AtomicU32>) -> Handler {
        handler_fn(move |_call: CallEnvelope| {
            let hits = hits.clone();
            async move {
                let n = hits.fetch_add(1, Ordering::SeqCst);
                Err(CallError::status(code, format!("attempt {n}")))
            }
        })
    }

    #[test]
    fn delays_double_from_initial() {
        let p = policy(3, 100, 30_000);
        assert_eq!(p.next_delay(0), Duration::from_millis(100));
        assert_eq!(p.next_delay(1), Duration::from_millis(200));
        assert_eq!(p.next_delay(2), Duration::from_millis(400));
    }

    #[test]
    fn delay_capped_at_max() {
        let p = policy(64, 100, 500);
        assert_eq!(p.next_delay(3), Duration::from_millis(500));
        // 2^attempt saturates instead of overflowing.
        assert_eq!(p.next_delay(63), Duration::from_millis(500));
        assert_eq!(p.next_delay(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn delay_keeps_doubling_past_32_attempts() {
        let p = RetryPolicy::new(RetryConfig {
            initial_delay: Duration::from_nanos(1),
            max_delay: Duration::from_secs(60),
            ..Default::default()
        });
        assert_eq!(p.next_delay(32), Duration::from_nanos(1 << 32));
        assert_eq!(p.next_delay(35), Duration::from_nanos(1 << 35));
        assert_eq!(p.next_delay(40), Duration::from_secs(60));
        assert_eq!(p.next_delay(127), Duration::from_secs(60));
    }

    #[test]
    fn should_retry_boundary() {
        let p = policy(2, 1, 1);
        assert!(p.should_retry(0));
        assert!(p.should_retry(1));
        assert!(!p.should_retry(2));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_makes_r_plus_one_calls_and_keeps_last_error() {
        let hits = Arc::new(AtomicU32::new(0));
        let retry = Retry::new(RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            ..Default::default()
        })
        .unwrap();
        let handler = retry.intercept(failing(Code::Unavailable, hits.clone()));

        let started = tokio::time::Instant::now();
        let err = handler
            .call(CallEnvelope::new("svc", "m", Value::Null))
            .await
            .unwrap_err();

        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert_eq!(err, CallError::status(Code::Unavailable, "attempt 3"));
        // 10 + 20 + 40 ms of backoff.
        assert!(started.elapsed() >= Duration::from_millis(70));
    }

    #[tokio::test]
    async fn non_retryable_failure_propagates_immediately() {
        let hits = Arc::new(AtomicU32::new(0));
        let retry = Retry::new(RetryConfig::default()).unwrap();
        let handler = retry.intercept(failing(Code::InvalidArgument, hits.clone()));

        let err = handler
            .call(CallEnvelope::new("svc", "m", Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_when_handler_starts_succeeding() {
        let hits = Arc::new(AtomicU32::new(0));
        let retry = Retry::new(RetryConfig::default()).unwrap();
        let handler = {
            let hits = hits.clone();
            retry.intercept(handler_fn(move |_call: CallEnvelope| {
                let hits = hits.clone();
                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(CallError::status(Code::ResourceExhausted, "busy"))
                    } else {
                        Ok(Value::from("done"))
                    }
                }
            }))
        };

        let out = handler
            .call(CallEnvelope::new("svc", "m", Value::Null))
            .await
            .unwrap();
        assert_eq!(out, Value::from("done"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn streaming_calls_are_not_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let retry = Retry::new(RetryConfig::default()).unwrap();
        let handler = retry.intercept(failing(Code::Unavailable, hits.clone()));

        handler
            .call(CallEnvelope::new("svc", "watch", Value::Null).streaming())
            .await
            .unwrap_err();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_backoff_short() {
        let hits = Arc::new(AtomicU32::new(0));
        let retry = Retry::new(RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            ..Default::default()
        })
        .unwrap();
        let handler = retry.intercept(failing(Code::Unavailable, hits.clone()));

        let call = CallEnvelope::new("svc", "m", Value::Null);
        call.cancel.cancel();
        let err = handler.call(call).await.unwrap_err();
        assert_eq!(err, CallError::status(Code::Unavailable, "attempt 0"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
