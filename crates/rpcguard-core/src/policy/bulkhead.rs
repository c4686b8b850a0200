//! Admission gate (bulkhead): bounds concurrent in-flight calls.
//!
//! ```text
//! admit():
//!   active < capacity              → take a slot immediately
//!   waiters.len() < queue_capacity → wait in FIFO order for a slot
//!   otherwise                      → reject (resource exhausted)
//! ```
//!
//! Releasing a slot hands it straight to the oldest live waiter while the
//! gate lock is held, so a fresh `admit()` can never overtake a caller that
//! has been queued longer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::chain::Interceptor;
use crate::envelope::{CallEnvelope, Payload};
use crate::error::{CallError, ConfigError};
use crate::handler::{CallHandler, Handler};

/// Configuration for the admission gate.
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Maximum number of concurrently executing calls.
    pub capacity: usize,
    /// Maximum number of calls waiting for a slot.
    pub queue_capacity: usize,
    /// Let streaming calls through without taking a slot.
    pub bypass_streaming: bool,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            queue_capacity: 0,
            bypass_streaming: true,
        }
    }
}

struct GateState {
    active: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Slot accounting shared by every call through one [`Bulkhead`].
pub struct Gate {
    capacity: usize,
    queue_capacity: usize,
    state: Mutex<GateState>,
}

impl Gate {
    fn new(capacity: usize, queue_capacity: usize) -> Self {
        Self {
            capacity,
            queue_capacity,
            state: Mutex::new(GateState {
                active: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of calls currently holding a slot.
    pub fn active(&self) -> usize {
        self.lock().active
    }

    /// Number of calls waiting for a slot.
    pub fn queued(&self) -> usize {
        let mut state = self.lock();
        state.waiters.retain(|tx| !tx.is_closed());
        state.waiters.len()
    }

    /// Acquire a slot, waiting in line if the queue has room.
    pub async fn admit(self: &Arc<Self>) -> Result<Permit, CallError> {
        let rx = {
            let mut state = self.lock();
            if state.active < self.capacity {
                state.active += 1;
                return Ok(Permit { gate: self.clone() });
            }
            // Waiters whose callers went away must not hold queue room.
            state.waiters.retain(|tx| !tx.is_closed());
            if state.waiters.len() >= self.queue_capacity {
                tracing::warn!(
                    capacity = self.capacity,
                    queue_capacity = self.queue_capacity,
                    "bulkhead full — rejecting call"
                );
                return Err(CallError::BulkheadFull {
                    capacity: self.capacity,
                    queue_capacity: self.queue_capacity,
                });
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            tracing::debug!(queued = state.waiters.len(), "bulkhead saturated — queueing call");
            rx
        };

        let mut waiting = Waiting {
            rx,
            gate: self.clone(),
            done: false,
        };
        let granted = (&mut waiting.rx).await;
        waiting.done = true;
        match granted {
            Ok(()) => Ok(Permit { gate: self.clone() }),
            // Senders are only dropped after a successful send or when the
            // receiver is already closed, so this is unreachable in practice.
            Err(_) => Err(CallError::internal("admission gate dropped a waiter")),
        }
    }

    fn release(&self) {
        let mut state = self.lock();
        while let Some(tx) = state.waiters.pop_front() {
            if tx.send(()).is_ok() {
                // Slot handed over; `active` is unchanged.
                return;
            }
        }
        state.active -= 1;
    }
}

/// A held admission slot. Dropping it releases the slot exactly once.
pub struct Permit {
    gate: Arc<Gate>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// A queued admission request. If the caller is dropped after a slot was
/// handed to it but before it observed the hand-off, the slot is passed on.
struct Waiting {
    rx: oneshot::Receiver<()>,
    gate: Arc<Gate>,
    done: bool,
}

impl Drop for Waiting {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.gate.release();
        }
    }
}

/// Interceptor bounding how many calls run through it at once.
pub struct Bulkhead {
    config: BulkheadConfig,
    gate: Arc<Gate>,
}

impl Bulkhead {
    pub fn new(config: BulkheadConfig) -> Result<Self, ConfigError> {
        if config.capacity == 0 {
            return Err(ConfigError::invalid("capacity", "must be greater than zero"));
        }
        Ok(Self {
            gate: Arc::new(Gate::new(config.capacity, config.queue_capacity)),
            config,
        })
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// The gate shared by every handler this bulkhead produces.
    pub fn gate(&self) -> &Arc<Gate> {
        &self.gate
    }
}

impl Interceptor for Bulkhead {
    fn name(&self) -> &str {
        "bulkhead"
    }

    fn intercept(&self, next: Handler) -> Handler {
        Arc::new(BulkheadHandler {
            gate: self.gate.clone(),
            bypass_streaming: self.config.bypass_streaming,
            next,
        })
    }
}

struct BulkheadHandler {
    gate: Arc<Gate>,
    bypass_streaming: bool,
    next: Handler,
}

#[async_trait]
impl CallHandler for BulkheadHandler {
    async fn call(&self, call: CallEnvelope) -> Result<Payload, CallError> {
        if call.streaming && self.bypass_streaming {
            return self.next.call(call).await;
        }
        let _permit = self.gate.admit().await?;
        self.next.call(call).await
    }
}
