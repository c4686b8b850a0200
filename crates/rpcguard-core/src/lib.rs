//! rpcguard-core — interceptor chain and resilience policies for RPC boundaries.
//!
//! # Overview
//!
//! Every call passes through an ordered chain of interceptors before it
//! reaches the handler. The core crate defines:
//!
//! - [`CallEnvelope`] — service, method, streaming flag, payload, cancellation token
//! - [`CallHandler`] / [`Handler`] — the async handler every stage wraps
//! - [`Interceptor`] and [`compose`] — the composition primitive
//! - [`CallError`] / [`ConfigError`] — structured error types
//! - [`policy`] module — bulkhead, circuit breaker, retry, timeout, fallback
//! - [`router`] module — pattern-based per-method interceptor fan-out
//! - [`pipeline`] module — the recommended default stage order
//! - [`config`] module — JSON route/stage configuration

pub mod chain;
pub mod config;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod pipeline;
pub mod policy;
pub mod router;

pub use chain::{compose, interceptor_fn, Interceptor, SharedInterceptor};
pub use config::{GuardConfig, StageConfig};
pub use envelope::{CallEnvelope, Payload};
pub use error::{CallError, Code, ConfigError};
pub use handler::{handler_fn, CallHandler, Handler};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use router::{MethodRouter, RoutePattern};
