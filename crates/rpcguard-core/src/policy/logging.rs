//! Per-call structured logging.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::Instrument;

use crate::chain::Interceptor;
use crate::envelope::{CallEnvelope, Payload};
use crate::error::CallError;
use crate::handler::{CallHandler, Handler};

/// Interceptor that wraps each call in an `rpc_call` span and logs its outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallLogger;

impl CallLogger {
    pub fn new() -> Self {
        Self
    }
}

impl Interceptor for CallLogger {
    fn name(&self) -> &str {
        "logging"
    }

    fn intercept(&self, next: Handler) -> Handler {
        Arc::new(LoggingHandler { next })
    }
}

struct LoggingHandler {
    next: Handler,
}

#[async_trait]
impl CallHandler for LoggingHandler {
    async fn call(&self, call: CallEnvelope) -> Result<Payload, CallError> {
        let span = tracing::info_span!(
            "rpc_call",
            service = %call.service,
            method = %call.method,
            streaming = call.streaming,
        );
        let started = Instant::now();
        let result = self.next.call(call).instrument(span.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        span.in_scope(|| match &result {
            Ok(_) => tracing::info!(elapsed_ms, "call completed"),
            Err(e) if e.is_rejection() => {
                tracing::warn!(elapsed_ms, code = %e.code(), error = %e, "call rejected")
            }
            Err(e) => tracing::info!(elapsed_ms, code = %e.code(), error = %e, "call failed"),
        });
        result
    }
}
