use std::sync::{Mutex, PoisonError};

use tracing::warn;

use fleetlink_core::stop::StopToken;

use crate::transport::RestartTrigger;

/// Exit status a process supervisor treats as "start me again".
pub const AGENT_AUTO_RESTART_EXIT_CODE: i32 = 77;

/// Restart by orderly shutdown: stop the loop, then let the binary exit
/// with [`AGENT_AUTO_RESTART_EXIT_CODE`] so the service manager restarts it.
pub struct ExitRestart {
    stop: StopToken,
    reason: Mutex<Option<String>>,
}

impl ExitRestart {
    pub fn new(stop: StopToken) -> Self {
        Self {
            stop,
            reason: Mutex::new(None),
        }
    }

    /// First restart reason, if a restart was requested.
    pub fn requested(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Process exit code for the current state.
    pub fn exit_code(&self) -> i32 {
        if self.requested().is_some() {
            AGENT_AUTO_RESTART_EXIT_CODE
        } else {
            0
        }
    }
}

impl RestartTrigger for ExitRestart {
    fn request_restart(&self, reason: &str) {
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            warn!(reason, "Agent restart requested");
            *slot = Some(reason.to_string());
        }
        drop(slot);
        self.stop.cancel();
    }
}
