//! Interceptors and the chain composer.
//!
//! An interceptor turns a `next` handler into a wrapping handler. Composing
//! `[I1, I2, I3]` around `H` yields `I1(I2(I3(H)))`: `I1` sees the call first
//! and the response last.

use std::sync::Arc;

use crate::handler::Handler;

/// A unary transform over handlers.
///
/// Any per-instance state (gate slots, breaker counters) belongs to the
/// interceptor value and is shared by every handler it produces.
pub trait Interceptor: Send + Sync + 'static {
    /// Short stable name used in logs.
    fn name(&self) -> &str {
        "interceptor"
    }

    /// Wrap `next`, returning the handler that runs this stage.
    fn intercept(&self, next: Handler) -> Handler;
}

/// Shared, type-erased interceptor.
pub type SharedInterceptor = Arc<dyn Interceptor>;

/// Fold `interceptors` right-to-left around `terminal`.
///
/// An empty list returns `terminal` unchanged. Composition holds no state of
/// its own, so the result can be reused for any number of calls.
pub fn compose(interceptors: &[SharedInterceptor], terminal: Handler) -> Handler {
    interceptors
        .iter()
        .rev()
        .fold(terminal, |next, interceptor| interceptor.intercept(next))
}

/// Adapter turning a closure `Fn(Handler) -> Handler` into an [`Interceptor`].
pub struct FnInterceptor<F> {
    name: String,
    f: F,
}

impl<F> Interceptor for FnInterceptor<F>
where
    F: Fn(Handler) -> Handler + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn intercept(&self, next: Handler) -> Handler {
        (self.f)(next)
    }
}

/// Build a [`SharedInterceptor`] from a closure.
pub fn interceptor_fn<F>(name: impl Into<String>, f: F) -> SharedInterceptor
where
    F: Fn(Handler) -> Handler + Send + Sync + 'static,
{
    Arc::new(FnInterceptor {
        name: name.into(),
        f,
    })
}
