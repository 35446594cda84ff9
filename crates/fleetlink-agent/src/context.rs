use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use fleetlink_core::stop::StopToken;

use crate::transport::Connection;

/// Process-wide agent state shared between the heartbeat thread and other
/// consumers (command runners, status reporters).
///
/// The heartbeat side only ever mutates the registered flag and the published
/// connection; everyone else reads them.
pub struct AgentContext {
    registered: AtomicBool,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    stop: StopToken,
}

impl AgentContext {
    pub fn new(stop: StopToken) -> Self {
        Self {
            registered: AtomicBool::new(false),
            connection: RwLock::new(None),
            stop,
        }
    }

    pub fn stop_token(&self) -> &StopToken {
        &self.stop
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Shared session for other threads, available only once registration
    /// has fully completed.
    ///
    /// The session may be torn down at any moment by a concurrent
    /// unregister; callers must treat transport errors on it as failures of
    /// their own operation only.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        if !self.is_registered() {
            return None;
        }
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Expose a fully registered session.
    pub(crate) fn publish(&self, connection: Arc<dyn Connection>) {
        *self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(connection);
        self.registered.store(true, Ordering::SeqCst);
    }

    /// Stop handing out the session. Called before teardown starts.
    pub(crate) fn clear_registered(&self) {
        self.registered.store(false, Ordering::SeqCst);
    }

    /// Forget the published session.
    pub(crate) fn retract(&self) {
        self.connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Default for AgentContext {
    fn default() -> Self {
        Self::new(StopToken::new())
    }
}
