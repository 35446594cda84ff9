use std::sync::Arc;

use tracing::debug;

use fleetlink_core::error::AgentError;
use fleetlink_core::protocol::{AckMode, POST_REGISTRATION_TOPICS, PRE_REGISTRATION_TOPICS};

use crate::gateway::ResponseSlots;
use crate::listeners::ServerResponsesListener;
use crate::transport::{Connection, Listener, ResourceCache};

/// One resource fetched right after registration: where to ask for it, the
/// local copy whose hash goes in the request, and who handles the answer.
#[derive(Clone)]
pub struct BootstrapEntry {
    pub endpoint: String,
    pub cache: Arc<dyn ResourceCache>,
    pub listener: Arc<dyn Listener>,
}

impl BootstrapEntry {
    pub fn new(endpoint: &str, cache: Arc<dyn ResourceCache>, listener: Arc<dyn Listener>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            cache,
            listener,
        }
    }
}

/// Fixed listener set plus the two ordered topic groups.
///
/// Pure wiring: attaches listeners to each fresh connection, subscribes the
/// pre- and post-registration groups, and resets listener buffers on
/// unregister. The server-responses listener is created per connection, bound
/// to the current slots epoch.
pub struct ResponseDispatchRegistry {
    slots: Arc<ResponseSlots>,
    listeners: Vec<Arc<dyn Listener>>,
    pre_registration: Vec<String>,
    post_registration: Vec<String>,
    bootstrap: Vec<BootstrapEntry>,
}

impl ResponseDispatchRegistry {
    /// Registry with the server-responses listener wired to `slots` and the
    /// default topic groups.
    pub fn new(slots: Arc<ResponseSlots>) -> Self {
        Self {
            slots,
            listeners: Vec::new(),
            pre_registration: PRE_REGISTRATION_TOPICS.iter().map(|t| t.to_string()).collect(),
            post_registration: POST_REGISTRATION_TOPICS.iter().map(|t| t.to_string()).collect(),
            bootstrap: Vec::new(),
        }
    }

    /// Add a topic listener (attached after the ones already registered).
    pub fn with_listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Append a bootstrap resource. Entries are processed in insertion order.
    pub fn with_bootstrap(mut self, entry: BootstrapEntry) -> Self {
        self.bootstrap.push(entry);
        self
    }

    /// Replace the topic groups.
    pub fn with_topics(mut self, pre: &[&str], post: &[&str]) -> Self {
        self.pre_registration = pre.iter().map(|t| t.to_string()).collect();
        self.post_registration = post.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Topic listeners, excluding the per-connection server-responses one.
    pub fn listeners(&self) -> &[Arc<dyn Listener>] {
        &self.listeners
    }

    pub fn bootstrap_entries(&self) -> &[BootstrapEntry] {
        &self.bootstrap
    }

    pub fn pre_registration_topics(&self) -> &[String] {
        &self.pre_registration
    }

    pub fn post_registration_topics(&self) -> &[String] {
        &self.post_registration
    }

    /// Attach every listener to a freshly opened connection, server
    /// responses first.
    pub fn attach(&self, connection: &dyn Connection) {
        connection.add_listener(Arc::new(ServerResponsesListener::new(Arc::clone(
            &self.slots,
        ))));
        for listener in &self.listeners {
            connection.add_listener(Arc::clone(listener));
        }
    }

    pub fn subscribe_pre_registration(&self, connection: &dyn Connection) -> Result<(), AgentError> {
        subscribe_all(connection, &self.pre_registration)
    }

    pub fn subscribe_post_registration(
        &self,
        connection: &dyn Connection,
    ) -> Result<(), AgentError> {
        subscribe_all(connection, &self.post_registration)
    }

    /// Clear every topic listener's buffers. Correlation state belongs to the
    /// gateway and is reset there.
    pub fn reset(&self) {
        for listener in &self.listeners {
            listener.reset();
        }
    }
}

fn subscribe_all(connection: &dyn Connection, topics: &[String]) -> Result<(), AgentError> {
    for topic in topics {
        debug!(topic = %topic, "Subscribing");
        connection.subscribe(topic, AckMode::ClientIndividual)?;
    }
    Ok(())
}
