//! Fallback: answer a failed call with an alternate response.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::chain::Interceptor;
use crate::envelope::{CallEnvelope, Payload};
use crate::error::{CallError, Code};
use crate::handler::{CallHandler, Handler};

/// Produces a response for a call that failed beneath the fallback stage.
#[async_trait]
pub trait FallbackHandler: Send + Sync + 'static {
    /// Return a replacement response, or an error to propagate instead.
    async fn recover(&self, call: &CallEnvelope, error: CallError) -> Result<Payload, CallError>;
}

struct FnFallback<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> FallbackHandler for FnFallback<F>
where
    F: Fn(CallEnvelope, CallError) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, CallError>> + Send + 'static,
{
    async fn recover(&self, call: &CallEnvelope, error: CallError) -> Result<Payload, CallError> {
        (self.f)(call.clone(), error).await
    }
}

struct StaticFallback {
    value: Payload,
}

#[async_trait]
impl FallbackHandler for StaticFallback {
    async fn recover(&self, _call: &CallEnvelope, _error: CallError) -> Result<Payload, CallError> {
        Ok(self.value.clone())
    }
}

/// Configuration for the fallback stage.
#[derive(Clone)]
pub struct FallbackConfig {
    pub handler: Arc<dyn FallbackHandler>,
    /// Only recover failures with these codes; `None` recovers everything.
    pub codes: Option<HashSet<Code>>,
    pub bypass_streaming: bool,
}

impl FallbackConfig {
    /// Recover every failure with `handler`.
    pub fn new(handler: Arc<dyn FallbackHandler>) -> Self {
        Self {
            handler,
            codes: None,
            bypass_streaming: false,
        }
    }

    /// Recover every failure by calling `f`.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(CallEnvelope, CallError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, CallError>> + Send + 'static,
    {
        Self::new(Arc::new(FnFallback { f }))
    }

    /// Recover every failure with a fixed payload.
    pub fn with_value(value: Payload) -> Self {
        Self::new(Arc::new(StaticFallback { value }))
    }

    pub fn only_codes(mut self, codes: impl IntoIterator<Item = Code>) -> Self {
        self.codes = Some(codes.into_iter().collect());
        self
    }
}

impl std::fmt::Debug for FallbackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackConfig")
            .field("codes", &self.codes)
            .field("bypass_streaming", &self.bypass_streaming)
            .finish()
    }
}

/// Interceptor recovering failures of everything beneath it.
pub struct Fallback {
    config: FallbackConfig,
}

impl Fallback {
    pub fn new(config: FallbackConfig) -> Self {
        Self { config }
    }
}

impl Interceptor for Fallback {
    fn name(&self) -> &str {
        "fallback"
    }

    fn intercept(&self, next: Handler) -> Handler {
        Arc::new(FallbackStage {
            config: self.config.clone(),
            next,
        })
    }
}

struct FallbackStage {
    config: FallbackConfig,
    next: Handler,
}

impl FallbackStage {
    fn covers(&self, err: &CallError) -> bool {
        self.config
            .codes
            .as_ref()
            .map_or(true, |codes| codes.contains(&err.code()))
    }
}

#[async_trait]
impl CallHandler for FallbackStage {
    async fn call(&self, call: CallEnvelope) -> Result<Payload, CallError> {
        if call.streaming && self.config.bypass_streaming {
            return self.next.call(call).await;
        }

        match self.next.call(call.clone()).await {
            Ok(resp) => Ok(resp),
            Err(err) if self.covers(&err) => {
                tracing::info!(
                    code = %err.code(),
                    error = %err,
                    method = %call.full_method(),
                    "serving fallback response"
                );
                self.config.handler.recover(&call, err).await
            }
            Err(err) => Err(err),
        }
    }
}
