//! Call-level and configuration error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Semantic failure kind carried by every [`CallError`].
///
/// Mirrors the canonical RPC status codes so that transports can map a
/// failure onto their own wire status without inspecting stage internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl Code {
    /// Snake-case name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
            Self::InvalidArgument => "invalid_argument",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::PermissionDenied => "permission_denied",
            Self::ResourceExhausted => "resource_exhausted",
            Self::FailedPrecondition => "failed_precondition",
            Self::Aborted => "aborted",
            Self::OutOfRange => "out_of_range",
            Self::Unimplemented => "unimplemented",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
            Self::DataLoss => "data_loss",
            Self::Unauthenticated => "unauthenticated",
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure surfaced by a handler or by one of the policy stages.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// The admission gate is saturated and its wait queue is full.
    #[error("bulkhead full ({capacity} in flight, {queue_capacity} queued)")]
    BulkheadFull {
        capacity: usize,
        queue_capacity: usize,
    },

    /// The circuit breaker is rejecting calls.
    #[error("circuit open after {threshold} consecutive failures")]
    CircuitOpen { threshold: u32 },

    /// The call did not finish within its deadline.
    #[error("deadline exceeded after {ms}ms")]
    DeadlineExceeded { ms: u64 },

    /// A failure produced by the wrapped handler itself.
    #[error("{code}: {message}")]
    Status { code: Code, message: String },
}

impl CallError {
    /// Build a handler-level failure.
    pub fn status(code: Code, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::status(Code::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::status(Code::Internal, message)
    }

    /// The semantic kind of this failure.
    pub fn code(&self) -> Code {
        match self {
            Self::BulkheadFull { .. } => Code::ResourceExhausted,
            Self::CircuitOpen { .. } => Code::Unavailable,
            Self::DeadlineExceeded { .. } => Code::DeadlineExceeded,
            Self::Status { code, .. } => *code,
        }
    }

    /// Returns `true` for backpressure rejections produced by a policy stage
    /// (gate full, circuit open) as opposed to failures of the handler.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::BulkheadFull { .. } | Self::CircuitOpen { .. })
    }
}

/// Errors raised while building an interceptor or a router.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An option value is out of range.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidOption { field: &'static str, reason: String },

    /// A router pattern does not have one of the accepted shapes.
    #[error("invalid route pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            field,
            reason: reason.into(),
        }
    }
}
