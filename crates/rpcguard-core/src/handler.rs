//! The `CallHandler` trait — what every stage wraps and produces.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::{CallEnvelope, Payload};
use crate::error::CallError;

/// An async call handler: the terminal RPC implementation or a stage
/// wrapping another handler.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; one handler is shared by every
/// concurrent call routed through it.
///
/// # Object Safety
/// The trait is object-safe and is passed around as [`Handler`].
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    async fn call(&self, call: CallEnvelope) -> Result<Payload, CallError>;
}

/// Shared, type-erased handler.
pub type Handler = Arc<dyn CallHandler>;

/// Adapter turning an async closure into a [`CallHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> CallHandler for FnHandler<F>
where
    F: Fn(CallEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, CallError>> + Send + 'static,
{
    async fn call(&self, call: CallEnvelope) -> Result<Payload, CallError> {
        (self.f)(call).await
    }
}

/// Build a [`Handler`] from an async closure.
///
/// ```
/// use rpcguard_core::{handler_fn, CallEnvelope, CallError};
///
/// let echo = handler_fn(|call: CallEnvelope| async move { Ok::<_, CallError>(call.payload) });
/// # let _ = echo;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(CallEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, CallError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
