//! Error normalization: a panicking handler becomes an `internal` failure.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::chain::Interceptor;
use crate::envelope::{CallEnvelope, Payload};
use crate::error::CallError;
use crate::handler::{CallHandler, Handler};

/// Interceptor that turns a panic beneath it into `CallError::Status { code: Internal, .. }`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NormalizeErrors;

impl NormalizeErrors {
    pub fn new() -> Self {
        Self
    }
}

impl Interceptor for NormalizeErrors {
    fn name(&self) -> &str {
        "normalize_errors"
    }

    fn intercept(&self, next: Handler) -> Handler {
        Arc::new(NormalizeHandler { next })
    }
}

struct NormalizeHandler {
    next: Handler,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[async_trait]
impl CallHandler for NormalizeHandler {
    async fn call(&self, call: CallEnvelope) -> Result<Payload, CallError> {
        let method = call.full_method();
        match AssertUnwindSafe(self.next.call(call)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(%method, panic = %message, "handler panicked");
                Err(CallError::internal(format!("handler panicked: {message}")))
            }
        }
    }
}
