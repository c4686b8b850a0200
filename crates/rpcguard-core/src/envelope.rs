//! The data carried through an interceptor chain.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Opaque request / response body.
pub type Payload = Value;

/// One RPC call as seen by the interceptor chain.
///
/// Stages never mutate the envelope they receive. A stage that needs to
/// change something (for example the cancellation token) builds a new
/// envelope, which keeps the original intact for re-entry on retry.
#[derive(Debug, Clone)]
pub struct CallEnvelope {
    /// Fully qualified service name, e.g. `billing.Ledger`.
    pub service: String,
    /// Method name within the service, e.g. `GetBalance`.
    pub method: String,
    /// `true` for client/server/bidi streaming calls.
    pub streaming: bool,
    pub payload: Payload,
    /// Cooperative cancellation signal observed by well-behaved handlers.
    pub cancel: CancellationToken,
}

impl CallEnvelope {
    /// Create a unary call envelope with a fresh cancellation token.
    pub fn new(service: impl Into<String>, method: impl Into<String>, payload: Payload) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            streaming: false,
            payload,
            cancel: CancellationToken::new(),
        }
    }

    /// Same call, flagged as streaming.
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// A copy of this envelope carrying a different cancellation token.
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    /// `service/method`, the key used by exact router patterns.
    pub fn full_method(&self) -> String {
        format!("{}/{}", self.service, self.method)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
