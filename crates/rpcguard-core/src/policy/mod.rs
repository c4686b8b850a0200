//! Policy stages — composable interceptors for RPC resilience.
//!
//! The recommended stack (outermost first, see [`crate::pipeline`]):
//! ```text
//! Call → [NormalizeErrors] → [Fallback] → [Timeout] → [Bulkhead]
//!      → [CircuitBreaker] → [Retry] → Handler
//! ```

pub mod bulkhead;
pub mod circuit_breaker;
pub mod fallback;
pub mod logging;
pub mod normalize;
pub mod retry;
pub mod timeout;

pub use bulkhead::{Bulkhead, BulkheadConfig, Gate, Permit};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use fallback::{Fallback, FallbackConfig, FallbackHandler};
pub use logging::CallLogger;
pub use normalize::NormalizeErrors;
pub use retry::{default_retryable_codes, Retry, RetryConfig, RetryPolicy};
pub use timeout::{Timeout, TimeoutConfig};
