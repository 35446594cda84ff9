use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::{error, warn};

use fleetlink_core::protocol::{AGENT_ACTIONS_TOPIC, CORRELATION_ID_HEADER, SERVER_RESPONSES_TOPIC};

use crate::gateway::ResponseSlots;
use crate::transport::{Headers, Listener, RestartTrigger};

/// Action name the coordinator uses to ask for an agent restart.
pub const RESTART_AGENT_ACTION: &str = "RESTART_AGENT";

/// Feeds correlated replies on the responses topic into the gateway.
///
/// Bound to the slots epoch current at construction; once the slots are reset
/// its deliveries are discarded, so attach a fresh one to every connection.
pub struct ServerResponsesListener {
    slots: Arc<ResponseSlots>,
    epoch: u64,
}

impl ServerResponsesListener {
    pub fn new(slots: Arc<ResponseSlots>) -> Self {
        let epoch = slots.epoch();
        Self { slots, epoch }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Listener for ServerResponsesListener {
    fn topic(&self) -> &str {
        SERVER_RESPONSES_TOPIC
    }

    fn on_event(&self, headers: &Headers, body: &Value) -> Result<()> {
        let Some(correlation_id) = headers.get(CORRELATION_ID_HEADER) else {
            warn!(
                header = CORRELATION_ID_HEADER,
                "Received a server response without a correlation id, ignoring"
            );
            return Ok(());
        };

        if body.get("status").and_then(Value::as_str) == Some("ERROR") {
            let detail = body.get("message").and_then(Value::as_str).unwrap_or("");
            error!(correlation_id = %correlation_id, detail, "Server reported an error");
        }

        self.slots.deposit_for(self.epoch, correlation_id, body.clone());
        Ok(())
    }
}

/// Handles coordinator-issued actions addressed to this agent.
pub struct AgentActionsListener {
    restart: Arc<dyn RestartTrigger>,
}

impl AgentActionsListener {
    pub fn new(restart: Arc<dyn RestartTrigger>) -> Self {
        Self { restart }
    }
}

impl Listener for AgentActionsListener {
    fn topic(&self) -> &str {
        AGENT_ACTIONS_TOPIC
    }

    fn on_event(&self, _headers: &Headers, body: &Value) -> Result<()> {
        match body.get("actionName").and_then(Value::as_str) {
            Some(RESTART_AGENT_ACTION) => {
                warn!("Restarting the agent by the request from server");
                self.restart.request_restart("restart requested via agent actions");
            }
            Some(other) => warn!(action = other, "Ignoring unknown agent action"),
            None => anyhow::bail!("Agent action without actionName: {}", body),
        }
        Ok(())
    }
}
