use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use fleetlink_core::config::AgentConfig;
use fleetlink_core::time::epoch_millis;

use crate::transport::RegistrationBuilder;

/// Agent build version reported at registration.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HostRegistrationRequest {
    hostname: String,
    timestamp: i64,
    agent_version: String,
    prefix: String,
}

/// Builds the registration payload describing this host.
///
/// Hostname is resolved once; the timestamp is taken fresh on every build so
/// each reconnect reports when it happened.
pub struct HostRegistration {
    hostname: String,
    prefix: String,
}

impl HostRegistration {
    pub fn new(hostname: &str, prefix: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            prefix: prefix.to_string(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        let prefix = config
            .agent
            .cache_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Self::new(&config.reported_hostname(), &prefix)
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}

impl RegistrationBuilder for HostRegistration {
    fn build(&self) -> Result<Value> {
        let request = HostRegistrationRequest {
            hostname: self.hostname.clone(),
            timestamp: epoch_millis(),
            agent_version: AGENT_VERSION.to_string(),
            prefix: self.prefix.clone(),
        };
        Ok(serde_json::to_value(request)?)
    }
}
