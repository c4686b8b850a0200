//! Deadline enforcement.
//!
//! The wrapped handler runs on its own task with a child cancellation token.
//! When the deadline fires first, the token is cancelled and the caller gets
//! `DeadlineExceeded` right away. The handler is signalled, not aborted: it
//! keeps running until it observes the cancellation, so the stages beneath
//! the timeout (breaker, bulkhead) still see how the call ended.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::chain::Interceptor;
use crate::envelope::{CallEnvelope, Payload};
use crate::error::{CallError, ConfigError};
use crate::handler::{CallHandler, Handler};

/// Configuration for the timeout policy.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Time budget for one call.
    pub duration: Duration,
    /// Let streaming calls run without a deadline.
    pub bypass_streaming: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
            bypass_streaming: true,
        }
    }
}

/// Interceptor racing the wrapped handler against a deadline.
pub struct Timeout {
    config: TimeoutConfig,
}

impl Timeout {
    pub fn new(config: TimeoutConfig) -> Result<Self, ConfigError> {
        if config.duration.is_zero() {
            return Err(ConfigError::invalid("duration", "must be greater than zero"));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }
}

impl Interceptor for Timeout {
    fn name(&self) -> &str {
        "timeout"
    }

    fn intercept(&self, next: Handler) -> Handler {
        Arc::new(TimeoutHandler {
            config: self.config.clone(),
            next,
        })
    }
}

struct TimeoutHandler {
    config: TimeoutConfig,
    next: Handler,
}

/// `DeadlineExceeded` reports whole milliseconds, rounded up so that a
/// sub-millisecond deadline never reads as `0`.
fn deadline_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

#[async_trait]
impl CallHandler for TimeoutHandler {
    async fn call(&self, call: CallEnvelope) -> Result<Payload, CallError> {
        if call.streaming && self.config.bypass_streaming {
            return self.next.call(call).await;
        }

        let token = call.cancel.child_token();
        // Cancels the inner call if our caller goes away before it finishes.
        let _guard = token.clone().drop_guard();
        let inner = call.with_cancel(token.clone());
        let next = self.next.clone();
        let mut task = tokio::spawn(async move { next.call(inner).await });

        match tokio::time::timeout(self.config.duration, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
            Ok(Err(join)) => Err(CallError::internal(format!("call task failed: {join}"))),
            Err(_) => {
                token.cancel();
                let ms = deadline_ms(self.config.duration);
                tracing::debug!(ms, method = %call.full_method(), "deadline exceeded");
                Err(CallError::DeadlineExceeded { ms })
            }
        }
    }
}
