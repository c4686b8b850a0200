//! Declarative pipeline configuration.
//!
//! A JSON document maps route patterns to the stages that apply to them:
//!
//! ```json
//! {
//!   "routes": {
//!     "*": { "logging": true, "normalize_errors": true },
//!     "billing.Ledger/*": {
//!       "timeout": { "duration_ms": 500 },
//!       "bulkhead": { "capacity": 8, "queue_capacity": 16 },
//!       "retry": { "max_retries": 3, "initial_delay_ms": 50 }
//!     }
//!   }
//! }
//! ```
//!
//! Durations are milliseconds as `f64` and counts are `i64`, so negative or
//! non-finite inputs survive parsing and are rejected with a
//! [`ConfigError::InvalidOption`] naming the field.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Code, ConfigError};
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::policy::{
    BulkheadConfig, CircuitBreakerConfig, FallbackConfig, RetryConfig, TimeoutConfig,
};
use crate::router::{MethodRouter, RoutePattern};

fn bool_true() -> bool {
    true
}
fn default_max_retries() -> i64 {
    3
}
fn default_initial_delay_ms() -> f64 {
    100.0
}
fn default_max_delay_ms() -> f64 {
    10_000.0
}
fn default_retryable_codes() -> Vec<Code> {
    vec![Code::Unavailable, Code::ResourceExhausted]
}
fn default_threshold() -> i64 {
    5
}
fn default_half_open_after_ms() -> f64 {
    30_000.0
}

fn millis(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() {
        return Err(ConfigError::invalid(field, format!("must be finite, got {value}")));
    }
    if value < 0.0 {
        return Err(ConfigError::invalid(field, format!("must not be negative, got {value}")));
    }
    Duration::try_from_secs_f64(value / 1000.0)
        .map_err(|e| ConfigError::invalid(field, e.to_string()))
}

fn count(field: &'static str, value: i64) -> Result<u64, ConfigError> {
    u64::try_from(value)
        .map_err(|_| ConfigError::invalid(field, format!("must not be negative, got {value}")))
}

/// `timeout` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSection {
    pub duration_ms: f64,
    #[serde(default = "bool_true")]
    pub bypass_streaming: bool,
}

impl TryFrom<&TimeoutSection> for TimeoutConfig {
    type Error = ConfigError;

    fn try_from(s: &TimeoutSection) -> Result<Self, Self::Error> {
        let duration = millis("timeout.duration_ms", s.duration_ms)?;
        if duration.is_zero() {
            return Err(ConfigError::invalid("timeout.duration_ms", "must be greater than zero"));
        }
        Ok(Self {
            duration,
            bypass_streaming: s.bypass_streaming,
        })
    }
}

/// `bulkhead` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BulkheadSection {
    pub capacity: i64,
    #[serde(default)]
    pub queue_capacity: i64,
    #[serde(default = "bool_true")]
    pub bypass_streaming: bool,
}

impl TryFrom<&BulkheadSection> for BulkheadConfig {
    type Error = ConfigError;

    fn try_from(s: &BulkheadSection) -> Result<Self, Self::Error> {
        let capacity = count("bulkhead.capacity", s.capacity)?;
        if capacity == 0 {
            return Err(ConfigError::invalid("bulkhead.capacity", "must be greater than zero"));
        }
        let queue_capacity = count("bulkhead.queue_capacity", s.queue_capacity)?;
        Ok(Self {
            capacity: capacity as usize,
            queue_capacity: queue_capacity as usize,
            bypass_streaming: s.bypass_streaming,
        })
    }
}

/// `circuit_breaker` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerSection {
    #[serde(default = "default_threshold")]
    pub threshold: i64,
    #[serde(default = "default_half_open_after_ms")]
    pub half_open_after_ms: f64,
    #[serde(default = "bool_true")]
    pub bypass_streaming: bool,
}

impl TryFrom<&CircuitBreakerSection> for CircuitBreakerConfig {
    type Error = ConfigError;

    fn try_from(s: &CircuitBreakerSection) -> Result<Self, Self::Error> {
        let threshold = count("circuit_breaker.threshold", s.threshold)?;
        if threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.threshold",
                "must be greater than zero",
            ));
        }
        let threshold = u32::try_from(threshold)
            .map_err(|_| ConfigError::invalid("circuit_breaker.threshold", "too large"))?;
        Ok(Self {
            threshold,
            half_open_after: millis("circuit_breaker.half_open_after_ms", s.half_open_after_ms)?,
            bypass_streaming: s.bypass_streaming,
        })
    }
}

/// `retry` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: f64,
    #[serde(default = "default_retryable_codes")]
    pub retryable_codes: Vec<Code>,
    #[serde(default = "bool_true")]
    pub bypass_streaming: bool,
}

impl TryFrom<&RetrySection> for RetryConfig {
    type Error = ConfigError;

    fn try_from(s: &RetrySection) -> Result<Self, Self::Error> {
        let max_retries = u32::try_from(count("retry.max_retries", s.max_retries)?)
            .map_err(|_| ConfigError::invalid("retry.max_retries", "too large"))?;
        Ok(Self {
            max_retries,
            initial_delay: millis("retry.initial_delay_ms", s.initial_delay_ms)?,
            max_delay: millis("retry.max_delay_ms", s.max_delay_ms)?,
            retryable_codes: s.retryable_codes.iter().copied().collect::<HashSet<_>>(),
            bypass_streaming: s.bypass_streaming,
        })
    }
}

/// `fallback` section: serve a fixed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FallbackSection {
    #[serde(default)]
    pub value: Value,
    /// Codes to recover; absent means every failure.
    #[serde(default)]
    pub codes: Option<Vec<Code>>,
    #[serde(default)]
    pub bypass_streaming: bool,
}

impl From<&FallbackSection> for FallbackConfig {
    fn from(s: &FallbackSection) -> Self {
        let mut config = FallbackConfig::with_value(s.value.clone());
        if let Some(codes) = &s.codes {
            config = config.only_codes(codes.iter().copied());
        }
        config.bypass_streaming = s.bypass_streaming;
        config
    }
}

/// Stages attached to one route pattern. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    #[serde(default)]
    pub logging: bool,
    #[serde(default)]
    pub normalize_errors: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySection>,
}

impl StageConfig {
    /// Validate the sections into a [`PipelineBuilder`].
    pub fn to_builder(&self) -> Result<PipelineBuilder, ConfigError> {
        let mut builder = Pipeline::builder();
        if self.logging {
            builder = builder.logging();
        }
        if self.normalize_errors {
            builder = builder.normalize_errors();
        }
        if let Some(s) = &self.fallback {
            builder = builder.fallback(s.into());
        }
        if let Some(s) = &self.timeout {
            builder = builder.timeout(s.try_into()?);
        }
        if let Some(s) = &self.bulkhead {
            builder = builder.bulkhead(s.try_into()?);
        }
        if let Some(s) = &self.circuit_breaker {
            builder = builder.circuit_breaker(s.try_into()?);
        }
        if let Some(s) = &self.retry {
            builder = builder.retry(s.try_into()?);
        }
        Ok(builder)
    }
}

/// Top-level document: route pattern → stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub routes: BTreeMap<String, StageConfig>,
}

impl GuardConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Validate every route and build the router. Each route gets its own
    /// stage instances, shared by all calls that route through it.
    pub fn build_router(&self) -> Result<MethodRouter, ConfigError> {
        let mut routes = Vec::with_capacity(self.routes.len());
        for (pattern, stages) in &self.routes {
            let builder = stages.to_builder()?;
            if builder.is_empty() {
                // Still reject a malformed pattern, even with nothing attached.
                pattern.parse::<RoutePattern>()?;
                tracing::debug!(%pattern, "route configures no stages; skipped");
                continue;
            }
            routes.push((pattern.as_str(), builder.build()?));
        }
        MethodRouter::new(routes)
    }
}
