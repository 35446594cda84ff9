use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use fleetlink_core::error::AgentError;
use fleetlink_core::stop::StopToken;

use crate::transport::Connection;

/// Keyed rendezvous between the transport's dispatch path (which deposits
/// replies) and blocked callers (which pop them by correlation id).
#[derive(Debug, Default)]
pub struct ResponseSlots {
    state: Mutex<SlotState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct SlotState {
    /// Replies deposited before (or without) a waiter.
    buffered: HashMap<String, Value>,
    /// Keys with a caller currently blocked on them.
    waiting: HashSet<String>,
    /// Keys whose waiter gave up; a late reply for them is discarded.
    expired: HashSet<String>,
    /// Bumped on every reset so blocked callers notice their entry is gone.
    generation: u64,
}

/// Why a keyed wait ended without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFailure {
    TimedOut,
    Cancelled,
    Reset,
    DuplicateWaiter,
}

impl ResponseSlots {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current session epoch. Advances on every [`reset`](Self::reset).
    pub fn epoch(&self) -> u64 {
        self.lock().generation
    }

    /// Store a reply for `key` in the current epoch, waking its waiter if
    /// there is one.
    pub fn deposit(&self, key: &str, value: Value) {
        let epoch = self.epoch();
        self.deposit_for(epoch, key, value);
    }

    /// Store a reply received by a session opened at `epoch`. Replies from an
    /// older session are dropped: correlation ids restart on every
    /// connection, so they would match the wrong request.
    pub fn deposit_for(&self, epoch: u64, key: &str, value: Value) {
        let mut state = self.lock();
        if state.generation != epoch {
            debug!(
                correlation_id = key,
                epoch,
                current = state.generation,
                "Discarding response from a previous session"
            );
            return;
        }
        if state.expired.remove(key) {
            debug!(correlation_id = key, "Discarding late response for expired request");
            return;
        }
        if state.buffered.insert(key.to_string(), value).is_some() {
            warn!(correlation_id = key, "Replacing unclaimed response with a newer one");
        }
        self.changed.notify_all();
    }

    /// Block until a reply for `key` is deposited, `timeout` elapses, the stop
    /// token fires, or the slots are reset.
    ///
    /// The stop token is checked every `poll` so cancellation latency is
    /// bounded by one grain.
    pub fn blocking_pop(
        &self,
        key: &str,
        timeout: Duration,
        poll: Duration,
        stop: &StopToken,
    ) -> Result<Value, WaitFailure> {
        // Too far in the future to represent: wait without a deadline
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        if !state.waiting.insert(key.to_string()) {
            return Err(WaitFailure::DuplicateWaiter);
        }
        let generation = state.generation;

        loop {
            if state.generation != generation {
                // reset() already cleared `waiting`
                return Err(WaitFailure::Reset);
            }
            if let Some(value) = state.buffered.remove(key) {
                state.waiting.remove(key);
                return Ok(value);
            }
            if stop.is_cancelled() {
                state.waiting.remove(key);
                return Err(WaitFailure::Cancelled);
            }
            let grain = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.waiting.remove(key);
                        state.expired.insert(key.to_string());
                        return Err(WaitFailure::TimedOut);
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };
            state = self
                .changed
                .wait_timeout(state, grain)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Discard every buffered, pending, and expired entry atomically.
    pub fn reset(&self) {
        let mut state = self.lock();
        let dropped = state.buffered.len();
        state.buffered.clear();
        state.waiting.clear();
        state.expired.clear();
        state.generation = state.generation.wrapping_add(1);
        self.changed.notify_all();
        if dropped > 0 {
            debug!(dropped, "Discarded unclaimed responses");
        }
    }

    /// Number of replies deposited but not yet claimed.
    pub fn buffered_len(&self) -> usize {
        self.lock().buffered.len()
    }

    /// Number of callers currently blocked.
    pub fn waiting_len(&self) -> usize {
        self.lock().waiting.len()
    }
}

/// Synchronous, timeout-bounded request/response over an asynchronous
/// transport. Replies are matched to requests by the correlation id the
/// transport assigns at send time.
pub struct CorrelationGateway {
    slots: Arc<ResponseSlots>,
    responses_topic: String,
    poll: Duration,
}

impl CorrelationGateway {
    pub fn new(
        slots: Arc<ResponseSlots>,
        responses_topic: &str,
        poll: Duration,
    ) -> Self {
        Self {
            slots,
            responses_topic: responses_topic.to_string(),
            poll,
        }
    }

    pub fn slots(&self) -> &ResponseSlots {
        &self.slots
    }

    /// Send `message` to `destination` and wait up to `timeout` for the reply
    /// carrying the same correlation id.
    pub fn blocking_request(
        &self,
        connection: &dyn Connection,
        message: &Value,
        destination: &str,
        timeout: Duration,
        stop: &StopToken,
    ) -> Result<Value, AgentError> {
        let correlation_id = match connection.send(message, destination) {
            Ok(id) => id,
            Err(e @ AgentError::TransportClosed { .. }) => {
                warn!(destination, "Connection failed while trying to send");
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        debug!(destination, correlation_id = %correlation_id, "Request sent, awaiting response");

        self.slots
            .blocking_pop(&correlation_id, timeout, self.poll, stop)
            .map_err(|failure| match failure {
                WaitFailure::TimedOut => AgentError::RequestTimeout {
                    destination: destination.to_string(),
                    responses_topic: self.responses_topic.clone(),
                    timeout,
                },
                WaitFailure::Cancelled => AgentError::Cancelled {
                    destination: destination.to_string(),
                },
                WaitFailure::Reset => AgentError::Reset {
                    destination: destination.to_string(),
                },
                WaitFailure::DuplicateWaiter => AgentError::DuplicateWaiter(correlation_id.clone()),
            })
    }

    /// Drop all pending correlation state (called on unregister).
    pub fn reset(&self) {
        self.slots.reset();
    }
}
