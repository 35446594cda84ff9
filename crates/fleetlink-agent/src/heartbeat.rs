use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use fleetlink_core::error::AgentError;
use fleetlink_core::protocol::{self, HEARTBEAT_ENDPOINT, HeartbeatRequest, HeartbeatResponse};

use crate::lifecycle::ConnectionLifecycleManager;
use crate::transport::RestartTrigger;

/// Supervisor states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Unregistered,
    Registering,
    Heartbeating,
    Stopping,
}

/// What to do with a heartbeat response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Sequence is intact; adopt the server id.
    Advance(i64),
    /// Escalate to a full process restart. The counter is left untouched.
    Restart(RestartReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    /// The server id is not exactly one past ours: at least one
    /// heartbeat/response pair was lost. `expected` is `None` when our
    /// counter is already at `i64::MAX`.
    SequenceDesync {
        expected: Option<i64>,
        received: i64,
    },
    /// The coordinator set `restartAgent`.
    RequestedByServer,
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartReason::SequenceDesync {
                expected: Some(expected),
                received,
            } => write!(
                f,
                "responseId sequence broken (expected {}, received {})",
                expected, received
            ),
            RestartReason::SequenceDesync {
                expected: None,
                received,
            } => write!(
                f,
                "responseId sequence broken (counter exhausted, received {})",
                received
            ),
            RestartReason::RequestedByServer => f.write_str("restart requested by server"),
        }
    }
}

/// Validate a heartbeat response against the current counter.
///
/// A desynchronized response and an explicit restart request both yield a
/// single restart verdict; desync takes precedence in the reported reason.
pub fn evaluate_heartbeat(response_id: i64, response: &HeartbeatResponse) -> HeartbeatVerdict {
    let expected = response_id.checked_add(1);
    if expected != Some(response.id) {
        return HeartbeatVerdict::Restart(RestartReason::SequenceDesync {
            expected,
            received: response.id,
        });
    }
    if response.restart_requested() {
        return HeartbeatVerdict::Restart(RestartReason::RequestedByServer);
    }
    HeartbeatVerdict::Advance(response.id)
}

/// Registers with the coordinator and heartbeats until stopped, turning
/// every failure into unregister + wait + retry.
pub struct HeartbeatLoop {
    lifecycle: ConnectionLifecycleManager,
    restart: Arc<dyn RestartTrigger>,
    interval: Duration,
    response_id: i64,
    state: LoopState,
}

impl HeartbeatLoop {
    pub fn new(
        lifecycle: ConnectionLifecycleManager,
        restart: Arc<dyn RestartTrigger>,
        interval: Duration,
    ) -> Self {
        Self {
            lifecycle,
            restart,
            interval,
            response_id: 0,
            state: LoopState::Unregistered,
        }
    }

    /// Override the pause between heartbeats.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn response_id(&self) -> i64 {
        self.response_id
    }

    pub fn lifecycle(&self) -> &ConnectionLifecycleManager {
        &self.lifecycle
    }

    pub fn lifecycle_mut(&mut self) -> &mut ConnectionLifecycleManager {
        &mut self.lifecycle
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Heartbeat loop transition");
            self.state = next;
        }
    }

    /// Run until the stop token fires. Always ends with an unregister.
    pub fn run(&mut self) {
        let stop = self.lifecycle.context().stop_token().clone();

        while !stop.is_cancelled() {
            if let Err(e) = self.step() {
                if e.is_expected() {
                    warn!(error = %e, "Heartbeat interrupted, re-running the registration");
                } else {
                    error!("Exception in heartbeat loop, re-running the registration: {:#}", e);
                }
                self.lifecycle.unregister();
                self.transition(LoopState::Unregistered);
            }

            if stop.wait_timeout(self.interval) {
                break;
            }
        }

        self.transition(LoopState::Stopping);
        self.lifecycle.unregister();
        info!("Heartbeat loop has successfully finished");
    }

    /// One pass of the loop body: register if needed, then one heartbeat.
    pub fn step(&mut self) -> Result<(), AgentError> {
        if !self.lifecycle.context().is_registered() {
            self.transition(LoopState::Registering);
            self.response_id = self.lifecycle.register()?;
            self.transition(LoopState::Heartbeating);
        }
        self.heartbeat()
    }

    fn heartbeat(&mut self) -> Result<(), AgentError> {
        let body = serde_json::to_value(HeartbeatRequest {
            id: self.response_id,
        })
        .map_err(|e| AgentError::Transport(e.into()))?;
        debug!(body = %body, "Heartbeat body");

        let response = self.lifecycle.request_on_session(&body, HEARTBEAT_ENDPOINT)?;
        debug!(response = %response, "Heartbeat response");
        let response: HeartbeatResponse = protocol::decode(response, HEARTBEAT_ENDPOINT)?;

        match evaluate_heartbeat(self.response_id, &response) {
            HeartbeatVerdict::Advance(id) => self.response_id = id,
            HeartbeatVerdict::Restart(reason) => {
                match &reason {
                    RestartReason::SequenceDesync { .. } => {
                        error!(%reason, "Error in responseId sequence - restarting")
                    }
                    RestartReason::RequestedByServer => {
                        warn!("Restarting the agent by the request from server")
                    }
                }
                self.restart.request_restart(&reason.to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoFileCache;
    use crate::context::AgentContext;
    use crate::gateway::ResponseSlots;
    use crate::lifecycle::LifecycleParts;
    use crate::loopback::{LoopbackConnector, ScriptedCoordinator};
    use crate::registry::ResponseDispatchRegistry;
    use crate::transport::RegistrationBuilder;
    use fleetlink_core::stop::StopToken;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Instant;

    fn response(value: Value) -> HeartbeatResponse {
        protocol::decode(value, HEARTBEAT_ENDPOINT).unwrap()
    }

    #[test]
    fn test_next_id_advances() {
        assert_eq!(
            evaluate_heartbeat(10, &response(json!({"id": "11"}))),
            HeartbeatVerdict::Advance(11)
        );
    }

    #[test]
    fn test_gap_triggers_restart() {
        assert_eq!(
            evaluate_heartbeat(10, &response(json!({"id": "13"}))),
            HeartbeatVerdict::Restart(RestartReason::SequenceDesync {
                expected: Some(11),
                received: 13
            })
        );
    }

    #[test]
    fn test_repeated_or_lower_id_triggers_restart() {
        for id in [10, 9, 0, -1] {
            assert!(matches!(
                evaluate_heartbeat(10, &response(json!({ "id": id }))),
                HeartbeatVerdict::Restart(RestartReason::SequenceDesync { .. })
            ));
        }
    }

    #[test]
    fn test_restart_flag_wins_over_valid_sequence() {
        assert_eq!(
            evaluate_heartbeat(10, &response(json!({"id": "11", "restartAgent": "True"}))),
            HeartbeatVerdict::Restart(RestartReason::RequestedByServer)
        );
    }

    #[test]
    fn test_exhausted_counter_triggers_restart() {
        let verdict = evaluate_heartbeat(i64::MAX, &response(json!({"id": 1})));
        assert_eq!(
            verdict,
            HeartbeatVerdict::Restart(RestartReason::SequenceDesync {
                expected: None,
                received: 1
            })
        );
        if let HeartbeatVerdict::Restart(reason) = verdict {
            assert!(reason.to_string().starts_with("responseId sequence broken"));
        }
        assert!(matches!(
            evaluate_heartbeat(i64::MAX, &response(json!({ "id": i64::MIN }))),
            HeartbeatVerdict::Restart(_)
        ));
    }

    #[test]
    fn test_false_restart_flag_is_ignored() {
        assert_eq!(
            evaluate_heartbeat(10, &response(json!({"id": 11, "restartAgent": "false"}))),
            HeartbeatVerdict::Advance(11)
        );
    }

    // ------------------------------------------------------------------
    // Loop scenarios over the loopback transport
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct RecordingRestart {
        reasons: Mutex<Vec<String>>,
    }

    impl RestartTrigger for RecordingRestart {
        fn request_restart(&self, reason: &str) {
            self.reasons.lock().unwrap().push(reason.to_string());
        }
    }

    struct StaticRegistration;

    impl RegistrationBuilder for StaticRegistration {
        fn build(&self) -> anyhow::Result<Value> {
            Ok(json!({"hostname": "node-1"}))
        }
    }

    struct Harness {
        hb: HeartbeatLoop,
        coordinator: Arc<ScriptedCoordinator>,
        connector: Arc<LoopbackConnector>,
        restart: Arc<RecordingRestart>,
        stop: StopToken,
    }

    fn harness(initial_id: i64, interval: Duration) -> Harness {
        let stop = StopToken::new();
        let context = Arc::new(AgentContext::new(stop.clone()));
        let coordinator = Arc::new(ScriptedCoordinator::new(initial_id));
        let connector = Arc::new(LoopbackConnector::new(coordinator.clone()));
        let slots = Arc::new(ResponseSlots::new());
        let registry = ResponseDispatchRegistry::new(Arc::clone(&slots));
        let lifecycle = ConnectionLifecycleManager::new(
            context,
            slots,
            registry,
            LifecycleParts {
                connector: connector.clone(),
                registration: Arc::new(StaticRegistration),
                file_cache: Arc::new(NoFileCache),
                url: "wss://coordinator:8441/agent/stomp/v1".to_string(),
                request_timeout: Duration::from_millis(300),
                poll: Duration::from_millis(10),
            },
        );
        let restart = Arc::new(RecordingRestart::default());
        let hb = HeartbeatLoop::new(lifecycle, restart.clone(), interval);
        Harness {
            hb,
            coordinator,
            connector,
            restart,
            stop,
        }
    }

    #[test]
    fn test_step_registers_then_heartbeats() {
        let mut h = harness(10, Duration::from_millis(10));
        h.hb.step().unwrap();
        assert_eq!(h.hb.state(), LoopState::Heartbeating);
        assert_eq!(h.hb.response_id(), 11);

        h.hb.step().unwrap();
        assert_eq!(h.hb.response_id(), 12);
        assert_eq!(
            h.coordinator.requests_to(HEARTBEAT_ENDPOINT),
            vec![json!({"id": 10}), json!({"id": 11})]
        );
        assert_eq!(h.connector.connection_count(), 1);
        assert!(h.restart.reasons.lock().unwrap().is_empty());
    }

    #[test]
    fn test_desync_restarts_once_and_keeps_counter() {
        let mut h = harness(10, Duration::from_millis(10));
        h.coordinator.queue_reply(HEARTBEAT_ENDPOINT, json!({"id": "13"}));
        h.hb.step().unwrap();
        assert_eq!(h.hb.response_id(), 10);
        assert_eq!(h.restart.reasons.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_desync_with_restart_flag_restarts_once() {
        let mut h = harness(10, Duration::from_millis(10));
        h.coordinator
            .queue_reply(HEARTBEAT_ENDPOINT, json!({"id": 20, "restartAgent": "TRUE"}));
        h.hb.step().unwrap();
        assert_eq!(h.restart.reasons.lock().unwrap().len(), 1);
        assert_eq!(h.hb.response_id(), 10);
    }

    #[test]
    fn test_malformed_heartbeat_is_an_error() {
        let mut h = harness(1, Duration::from_millis(10));
        h.coordinator.queue_reply(HEARTBEAT_ENDPOINT, json!({"nope": true}));
        let err = h.hb.step().unwrap_err();
        assert!(matches!(err, AgentError::MalformedResponse { .. }));
    }

    #[test]
    fn test_failures_reregister_on_new_connection() {
        let mut h = harness(1, Duration::from_millis(10));
        h.coordinator.drop_replies_to(HEARTBEAT_ENDPOINT);
        let stop = h.stop.clone();
        let coordinator = h.coordinator.clone();
        let connector = h.connector.clone();

        let handle = thread::spawn(move || {
            h.hb.run();
            h
        });

        // Wait for at least one failed heartbeat to force a second registration
        let deadline = Instant::now() + Duration::from_secs(10);
        while connector.connection_count() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        coordinator.restore_replies_to(HEARTBEAT_ENDPOINT);
        while coordinator.heartbeat_count() < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        stop.cancel();
        let h = handle.join().unwrap();

        assert!(h.connector.connection_count() >= 2);
        assert!(h.coordinator.heartbeat_count() >= 1);
        assert_eq!(h.hb.state(), LoopState::Stopping);
        assert!(!h.hb.lifecycle().context().is_registered());
        assert!(h.connector.last_connection().unwrap().is_closed());
    }

    #[test]
    fn test_stop_during_interval_wait_exits_promptly() {
        let mut h = harness(1, Duration::from_secs(3600));
        let stop = h.stop.clone();
        let coordinator = h.coordinator.clone();

        let handle = thread::spawn(move || {
            h.hb.run();
            h
        });

        let deadline = Instant::now() + Duration::from_secs(10);
        while coordinator.heartbeat_count() < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        // Loop is now parked in its hour-long interval wait
        thread::sleep(Duration::from_millis(20));
        let stopped_at = Instant::now();
        stop.cancel();
        let h = handle.join().unwrap();

        assert!(stopped_at.elapsed() < Duration::from_secs(2));
        assert_eq!(h.hb.state(), LoopState::Stopping);
        assert!(h.hb.lifecycle().context().connection().is_none());
        assert!(h.connector.last_connection().unwrap().is_closed());
    }

    #[test]
    fn test_rejected_registration_retries_without_publishing() {
        let mut h = harness(5, Duration::from_millis(10));
        h.coordinator.reply_to_registration(
            json!({"id": "5", "exitstatus": "1", "log": "version mismatch"}),
        );
        let err = h.hb.step().unwrap_err();
        assert!(err.to_string().contains("version mismatch"));
        assert_eq!(h.hb.response_id(), 0);
        assert!(h.hb.lifecycle().context().connection().is_none());
    }
}
