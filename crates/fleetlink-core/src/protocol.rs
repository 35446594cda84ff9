use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;

// ============================================================================
// Destinations
// ============================================================================

/// Registration handshake endpoint.
pub const REGISTRATION_ENDPOINT: &str = "/register";
/// Heartbeat endpoint.
pub const HEARTBEAT_ENDPOINT: &str = "/heartbeat";

/// Topic carrying every correlated reply, multiplexed by correlation id.
pub const SERVER_RESPONSES_TOPIC: &str = "/user/";
/// Topic for coordinator-issued agent actions (restart requests).
pub const AGENT_ACTIONS_TOPIC: &str = "/user/agent_actions";
pub const COMMANDS_TOPIC: &str = "/user/commands";
pub const CONFIGURATIONS_TOPIC: &str = "/user/configs";
pub const HOST_LEVEL_PARAMS_TOPIC: &str = "/user/host_level_params";
pub const ALERT_DEFINITIONS_TOPIC: &str = "/user/alert_definitions";
pub const METADATA_TOPIC: &str = "/events/metadata";
pub const TOPOLOGIES_TOPIC: &str = "/events/topologies";

pub const TOPOLOGY_REQUEST_ENDPOINT: &str = "/agents/topologies";
pub const METADATA_REQUEST_ENDPOINT: &str = "/agents/metadata";
pub const CONFIGURATIONS_REQUEST_ENDPOINT: &str = "/agents/configs";
pub const HOST_LEVEL_PARAMS_REQUEST_ENDPOINT: &str = "/agents/host_level_params";
pub const ALERT_DEFINITIONS_REQUEST_ENDPOINT: &str = "/agents/alert_definitions";

/// Header the transport uses to carry the correlation id of a reply.
pub const CORRELATION_ID_HEADER: &str = "correlationId";
/// Header naming the destination a frame was published to.
pub const DESTINATION_HEADER: &str = "destination";

/// Topics subscribed before the registration request is sent.
pub const PRE_REGISTRATION_TOPICS: &[&str] = &[SERVER_RESPONSES_TOPIC, AGENT_ACTIONS_TOPIC];

/// Topics subscribed once bootstrap has completed.
pub const POST_REGISTRATION_TOPICS: &[&str] = &[
    COMMANDS_TOPIC,
    CONFIGURATIONS_TOPIC,
    METADATA_TOPIC,
    TOPOLOGIES_TOPIC,
    HOST_LEVEL_PARAMS_TOPIC,
    ALERT_DEFINITIONS_TOPIC,
];

/// Subscription acknowledgement mode requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckMode {
    Auto,
    Client,
    /// Every message must be acknowledged individually by the consumer.
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

impl std::fmt::Display for AckMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Wire records
// ============================================================================

/// Coordinator's answer to the registration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    #[serde(deserialize_with = "lenient_i64")]
    pub id: i64,
    /// 0 (or absent) means success; 1 means agent/server version mismatch.
    #[serde(default, deserialize_with = "lenient_opt_i64", skip_serializing_if = "Option::is_none")]
    pub exitstatus: Option<i64>,
    /// Diagnostic text to surface in the agent log on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl RegistrationResponse {
    /// Initial sequence counter, or the rejection carrying the server's
    /// diagnostic text.
    pub fn accepted_id(&self) -> Result<i64, AgentError> {
        let status = self.exitstatus.unwrap_or(0);
        if status != 0 {
            let message = match &self.log {
                Some(log) => format!("Registration failed due to: {}", log),
                None => "Registration failed".to_string(),
            };
            return Err(AgentError::RegistrationRejected(message));
        }
        Ok(self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(deserialize_with = "lenient_i64")]
    pub id: i64,
    #[serde(
        rename = "restartAgent",
        default,
        deserialize_with = "lenient_opt_flag",
        skip_serializing_if = "Option::is_none"
    )]
    pub restart_agent: Option<String>,
}

impl HeartbeatResponse {
    /// True when the coordinator explicitly asks for a restart.
    pub fn restart_requested(&self) -> bool {
        self.restart_agent
            .as_deref()
            .is_some_and(|flag| flag.eq_ignore_ascii_case("true"))
    }
}

/// Request for a bootstrap resource, carrying the hash of what is cached locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapRequest {
    pub hash: String,
}

/// Decode a raw response into its record, naming the destination on failure.
pub fn decode<T: DeserializeOwned>(value: Value, destination: &str) -> Result<T, AgentError> {
    serde_json::from_value(value).map_err(|e| AgentError::MalformedResponse {
        destination: destination.to_string(),
        reason: e.to_string(),
    })
}

// ============================================================================
// Lenient scalars (coordinators send numbers either bare or quoted)
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl Scalar {
    fn into_i64<E: serde::de::Error>(self) -> Result<i64, E> {
        match self {
            Scalar::Int(n) => Ok(n),
            Scalar::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("expected an integer, got {:?}", s))),
            Scalar::Bool(b) => Err(E::custom(format!("expected an integer, got {}", b))),
        }
    }
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    Scalar::deserialize(deserializer)?.into_i64()
}

fn lenient_opt_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    match Option::<Scalar>::deserialize(deserializer)? {
        Some(s) => s.into_i64().map(Some),
        None => Ok(None),
    }
}

fn lenient_opt_flag<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Option::<Scalar>::deserialize(deserializer)?.map(|s| match s {
        Scalar::Str(s) => s,
        Scalar::Bool(b) => b.to_string(),
        Scalar::Int(n) => n.to_string(),
    }))
}

// ============================================================================
// Tests
// ============================================================================
