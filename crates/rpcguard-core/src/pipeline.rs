//! Recommended default composition of the policy stages.
//!
//! Outermost first:
//!
//! ```text
//! logging → normalize_errors → fallback → timeout → bulkhead
//!         → circuit_breaker → retry → handler
//! ```
//!
//! - the timeout bounds everything beneath it, retries and queueing included
//! - the bulkhead rejects before a broken or retried call takes a slot
//! - retry sits directly above the handler, so a call the breaker admits is
//!   retried as one unit
//! - fallback catches failures from every stage beneath it, including the
//!   stages' own `DeadlineExceeded`, `CircuitOpen` and `BulkheadFull`; give it
//!   a `codes` filter to let those reach the caller

use std::sync::Arc;

use crate::chain::{compose, SharedInterceptor};
use crate::error::ConfigError;
use crate::handler::Handler;
use crate::policy::{
    Bulkhead, BulkheadConfig, CallLogger, CircuitBreaker, CircuitBreakerConfig, Fallback,
    FallbackConfig, NormalizeErrors, Retry, RetryConfig, Timeout, TimeoutConfig,
};

/// Builder collecting the stages of one pipeline.
#[derive(Debug, Default, Clone)]
pub struct PipelineBuilder {
    logging: bool,
    normalize_errors: bool,
    fallback: Option<FallbackConfig>,
    timeout: Option<TimeoutConfig>,
    bulkhead: Option<BulkheadConfig>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    retry: Option<RetryConfig>,
}

/// Entry point for [`PipelineBuilder`].
pub struct Pipeline;

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }
}

impl PipelineBuilder {
    pub fn logging(mut self) -> Self {
        self.logging = true;
        self
    }

    pub fn normalize_errors(mut self) -> Self {
        self.normalize_errors = true;
        self
    }

    pub fn fallback(mut self, config: FallbackConfig) -> Self {
        self.fallback = Some(config);
        self
    }

    pub fn timeout(mut self, config: TimeoutConfig) -> Self {
        self.timeout = Some(config);
        self
    }

    pub fn bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = Some(config);
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Returns `true` if no stage has been configured.
    pub fn is_empty(&self) -> bool {
        !self.logging
            && !self.normalize_errors
            && self.fallback.is_none()
            && self.timeout.is_none()
            && self.bulkhead.is_none()
            && self.circuit_breaker.is_none()
            && self.retry.is_none()
    }

    /// Validate every stage and return the interceptors, outermost first.
    ///
    /// Each call builds fresh stage instances: two `build()` results never
    /// share gate slots or breaker state.
    pub fn build(&self) -> Result<Vec<SharedInterceptor>, ConfigError> {
        let mut stages: Vec<SharedInterceptor> = Vec::new();
        if self.logging {
            stages.push(Arc::new(CallLogger::new()));
        }
        if self.normalize_errors {
            stages.push(Arc::new(NormalizeErrors::new()));
        }
        if let Some(config) = &self.fallback {
            stages.push(Arc::new(Fallback::new(config.clone())));
        }
        if let Some(config) = &self.timeout {
            stages.push(Arc::new(Timeout::new(config.clone())?));
        }
        if let Some(config) = &self.bulkhead {
            stages.push(Arc::new(Bulkhead::new(config.clone())?));
        }
        if let Some(config) = &self.circuit_breaker {
            stages.push(Arc::new(CircuitBreaker::new(config.clone())?));
        }
        if let Some(config) = &self.retry {
            stages.push(Arc::new(Retry::new(config.clone())?));
        }
        Ok(stages)
    }

    /// Build the stages and compose them around `terminal`.
    pub fn into_handler(self, terminal: Handler) -> Result<Handler, ConfigError> {
        Ok(compose(&self.build()?, terminal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::CallEnvelope;
    use crate::error::{CallError, Code};
    use crate::handler::handler_fn;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn stages_come_out_in_recommended_order() {
        let names: Vec<String> = Pipeline::builder()
            .retry(RetryConfig::default())
            .circuit_breaker(CircuitBreakerConfig::default())
            .bulkhead(BulkheadConfig::default())
            .timeout(TimeoutConfig::default())
            .fallback(FallbackConfig::with_value(Value::Null))
            .normalize_errors()
            .logging()
            .build()
            .unwrap()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "logging",
                "normalize_errors",
                "fallback",
                "timeout",
                "bulkhead",
                "circuit_breaker",
                "retry"
            ]
        );
    }

    #[test]
    fn invalid_stage_fails_the_build() {
        let err = Pipeline::builder()
            .timeout(TimeoutConfig {
                duration: Duration::ZERO,
                bypass_streaming: true,
            })
            .build()
            .err().unwrap();
        assert!(matches!(err, ConfigError::InvalidOption { field: "duration", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_accounted_as_one_breaker_call() {
        let hits = Arc::new(AtomicU32::new(0));
        let terminal = {
            let hits = hits.clone();
            handler_fn(move |_call: CallEnvelope| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Err(CallError::unavailable("down"))
                }
            })
        };
        let handler = Pipeline::builder()
            .circuit_breaker(CircuitBreakerConfig {
                threshold: 2,
                half_open_after: Duration::from_secs(60),
                bypass_streaming: true,
            })
            .retry(RetryConfig {
                max_retries: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                ..Default::default()
            })
            .into_handler(terminal)
            .unwrap();

        for _ in 0..2 {
            let err = handler
                .call(CallEnvelope::new("svc", "m", Value::Null))
                .await
                .unwrap_err();
            assert_eq!(err, CallError::unavailable("down"));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 6);

        let err = handler
            .call(CallEnvelope::new("svc", "m", Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err, CallError::CircuitOpen { threshold: 2 });
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_catches_deadline_from_below() {
        let handler = Pipeline::builder()
            .fallback(
                FallbackConfig::with_value(json!("stale")).only_codes([Code::DeadlineExceeded]),
            )
            .timeout(TimeoutConfig {
                duration: Duration::from_millis(10),
                bypass_streaming: true,
            })
            .into_handler(handler_fn(|_call: CallEnvelope| async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(json!("fresh"))
            }))
            .unwrap();

        let out = handler
            .call(CallEnvelope::new("svc", "m", Value::Null))
            .await
            .unwrap();
        assert_eq!(out, json!("stale"));
    }

    #[tokio::test(start_paused = true)]
    async fn code_filter_decides_whether_rejections_are_recovered() {
        let slow = || {
            handler_fn(|_call: CallEnvelope| async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(json!("fresh"))
            })
        };
        let deadline = TimeoutConfig {
            duration: Duration::from_millis(10),
            bypass_streaming: true,
        };

        let catch_all = Pipeline::builder()
            .fallback(FallbackConfig::with_value(json!("fb")))
            .timeout(deadline.clone())
            .into_handler(slow())
            .unwrap();
        let out = catch_all
            .call(CallEnvelope::new("svc", "m", Value::Null))
            .await
            .unwrap();
        assert_eq!(out, json!("fb"));

        let upstream_only = Pipeline::builder()
            .fallback(FallbackConfig::with_value(json!("fb")).only_codes([Code::Unavailable]))
            .timeout(deadline)
            .into_handler(slow())
            .unwrap();
        let err = upstream_only
            .call(CallEnvelope::new("svc", "m", Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err, CallError::DeadlineExceeded { ms: 10 });
    }
}
