//! Seams to the collaborators this crate drives but does not implement:
//! the publish/subscribe transport, topic listeners, local caches, the
//! registration payload, and the process restart mechanism.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use fleetlink_core::error::AgentError;
use fleetlink_core::protocol::{AckMode, DESTINATION_HEADER};

/// Frame headers as delivered by the transport.
pub type Headers = HashMap<String, String>;

/// Transport-assigned token linking a request to its reply.
pub type CorrelationId = String;

/// Opens sessions to the coordinator.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, AgentError>;
}

/// A live publish/subscribe session.
///
/// Implementations must be usable from several threads: the supervising
/// thread sends and subscribes while the transport's own dispatch path
/// delivers inbound frames to the attached listeners.
pub trait Connection: Send + Sync {
    /// Publish `body` to `destination`, returning the correlation id the
    /// coordinator will echo on the responses topic.
    ///
    /// Fails with [`AgentError::TransportClosed`] when the session is gone.
    fn send(&self, body: &Value, destination: &str) -> Result<CorrelationId, AgentError>;

    fn subscribe(&self, destination: &str, ack: AckMode) -> Result<(), AgentError>;

    fn add_listener(&self, listener: Arc<dyn Listener>);

    fn disconnect(&self) -> Result<(), AgentError>;
}

/// Consumer of inbound frames for one topic.
pub trait Listener: Send + Sync {
    /// Topic whose frames this listener handles.
    fn topic(&self) -> &str;

    /// Handle one payload. Errors during bootstrap abort registration.
    fn on_event(&self, headers: &Headers, body: &Value) -> Result<()>;

    /// Drop any buffered per-topic state so nothing stale survives into the
    /// next session.
    fn reset(&self) {}

    /// Entry point used by transports: routes a frame to [`Listener::on_event`]
    /// when its destination header names this listener's topic.
    fn on_message(&self, headers: &Headers, body: &Value) -> Result<()> {
        match headers.get(DESTINATION_HEADER) {
            Some(destination) if destination == self.topic() => self.on_event(headers, body),
            _ => Ok(()),
        }
    }
}

/// Local copy of a coordinator-held resource.
pub trait ResourceCache: Send + Sync {
    /// Content hash of the cached data; empty when nothing is cached yet.
    fn content_hash(&self) -> String;
}

/// Builds the opaque identity/capability payload sent at registration.
pub trait RegistrationBuilder: Send + Sync {
    fn build(&self) -> Result<Value>;
}

/// Clears file-based bootstrap markers after a successful registration.
pub trait LocalCacheReset: Send + Sync {
    fn reset(&self) -> Result<()>;
}

/// Process-wide restart mechanism.
pub trait RestartTrigger: Send + Sync {
    fn request_restart(&self, reason: &str);
}
