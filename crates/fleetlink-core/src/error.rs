use std::time::Duration;

use thiserror::Error;

/// Failures raised while talking to the coordinator.
///
/// Every variant is recoverable by the heartbeat loop: it unregisters, waits
/// one interval, and registers again. Sequence desynchronization is not an
/// error; it is escalated to the restart trigger instead.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Send attempted on a connection the transport already closed.
    #[error("connection is already closed (sending to {destination})")]
    TransportClosed { destination: String },

    /// Any other transport-level failure (connect, subscribe, send).
    #[error("transport failure: {0:#}")]
    Transport(#[from] anyhow::Error),

    /// No correlated response arrived within the configured window.
    #[error(
        "{}s timeout expired waiting for response from server at {responses_topic} to message from {destination}",
        .timeout.as_secs_f64()
    )]
    RequestTimeout {
        destination: String,
        responses_topic: String,
        timeout: Duration,
    },

    /// Coordinator answered the registration with a non-zero exit status.
    #[error("{0}")]
    RegistrationRejected(String),

    /// A bootstrap listener failed while handling its response.
    #[error("failed to handle bootstrap response from {endpoint}: {source:#}")]
    BootstrapHandling {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },

    /// A response could not be decoded into its expected record.
    #[error("malformed response from {destination}: {reason}")]
    MalformedResponse { destination: String, reason: String },

    /// Resetting local bootstrap markers failed.
    #[error("failed to reset local cache: {0:#}")]
    LocalCache(#[source] anyhow::Error),

    /// Another caller is already waiting on this correlation id.
    #[error("a waiter for correlation id {0} already exists")]
    DuplicateWaiter(String),

    /// Pending correlation state was discarded while a caller waited on it.
    #[error("correlation entries were reset while waiting for a response to {destination}")]
    Reset { destination: String },

    /// The stop token fired while waiting.
    #[error("cancelled while waiting for a response to {destination}")]
    Cancelled { destination: String },

    /// A request was attempted without an open connection.
    #[error("no open connection to the coordinator")]
    NotConnected,
}

impl AgentError {
    /// Conditions that happen routinely when the coordinator restarts or the
    /// session is torn down; these are logged without a backtrace of causes.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            AgentError::TransportClosed { .. }
                | AgentError::NotConnected
                | AgentError::Cancelled { .. }
                | AgentError::Reset { .. }
        )
    }
}
