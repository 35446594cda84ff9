use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Environment override for `[server] hostname`.
pub const ENV_SERVER_HOSTNAME: &str = "FLEETLINK_SERVER_HOSTNAME";
/// Environment override for `[server] secured_url_port`.
pub const ENV_SERVER_PORT: &str = "FLEETLINK_SERVER_PORT";

/// Top-level agent configuration loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub server: ServerSection,
    #[serde(default)]
    pub agent: AgentSection,
}

/// Where the coordinator lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    pub hostname: String,
    /// Port of the secured (wss) agent endpoint.
    #[serde(default = "default_secured_port")]
    pub secured_url_port: u16,
}

/// Agent-side timing and local state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Pause between heartbeats, and between failed registration attempts.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// How long a correlated request waits for its response.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Granularity at which blocked requests notice a stop request.
    #[serde(default = "default_stop_poll")]
    pub stop_poll_millis: u64,
    /// Directory holding file-based bootstrap markers.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Hostname reported at registration (defaults to `$HOSTNAME`).
    #[serde(default)]
    pub hostname: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            request_timeout_secs: default_request_timeout(),
            stop_poll_millis: default_stop_poll(),
            cache_dir: None,
            hostname: None,
        }
    }
}

fn default_secured_port() -> u16 {
    8441
}
fn default_heartbeat_interval() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    10
}
fn default_stop_poll() -> u64 {
    100
}

impl AgentConfig {
    /// Config pointing at `hostname` with every other field defaulted.
    pub fn for_server(hostname: &str) -> Self {
        Self {
            server: ServerSection {
                hostname: hostname.to_string(),
                secured_url_port: default_secured_port(),
            },
            agent: AgentSection::default(),
        }
    }

    /// Load agent config from a TOML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read agent config: {}", path.display()))?;
        let mut config = Self::parse(&content)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse agent config from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).with_context(|| "Failed to parse agent config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FLEETLINK_SERVER_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var(ENV_SERVER_HOSTNAME) {
            debug!(hostname = %host, "Server hostname overridden from environment");
            self.server.hostname = host;
        }
        if let Ok(port) = std::env::var(ENV_SERVER_PORT) {
            debug!(port = %port, "Server port overridden from environment");
            self.server.secured_url_port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: {}", ENV_SERVER_PORT, port))?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.hostname.trim().is_empty() {
            anyhow::bail!("[server] hostname cannot be empty");
        }
        if self.server.secured_url_port == 0 {
            anyhow::bail!("[server] secured_url_port cannot be 0");
        }
        if self.agent.heartbeat_interval_secs == 0 {
            anyhow::bail!("[agent] heartbeat_interval_secs must be at least 1");
        }
        if self.agent.request_timeout_secs == 0 {
            anyhow::bail!("[agent] request_timeout_secs must be at least 1");
        }
        if self.agent.stop_poll_millis == 0 {
            anyhow::bail!("[agent] stop_poll_millis must be at least 1");
        }
        Ok(())
    }

    /// Secured publish/subscribe endpoint of the coordinator.
    pub fn connection_url(&self) -> String {
        format!(
            "wss://{}:{}/agent/stomp/v1",
            self.server.hostname, self.server.secured_url_port
        )
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.agent.heartbeat_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.request_timeout_secs)
    }

    pub fn stop_poll(&self) -> Duration {
        Duration::from_millis(self.agent.stop_poll_millis)
    }

    /// Hostname reported to the coordinator.
    pub fn reported_hostname(&self) -> String {
        self.agent
            .hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string())
    }
}
