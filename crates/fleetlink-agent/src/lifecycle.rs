use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use fleetlink_core::error::AgentError;
use fleetlink_core::protocol::{
    self, BootstrapRequest, REGISTRATION_ENDPOINT, RegistrationResponse, SERVER_RESPONSES_TOPIC,
};

use crate::context::AgentContext;
use crate::gateway::{CorrelationGateway, ResponseSlots};
use crate::registry::ResponseDispatchRegistry;
use crate::transport::{Connection, Connector, Headers, LocalCacheReset, RegistrationBuilder};

/// Drives one registration attempt to success or failure and tears the
/// session down again on any exit path.
pub struct ConnectionLifecycleManager {
    context: Arc<AgentContext>,
    connector: Arc<dyn Connector>,
    registry: ResponseDispatchRegistry,
    gateway: CorrelationGateway,
    registration: Arc<dyn RegistrationBuilder>,
    file_cache: Arc<dyn LocalCacheReset>,
    url: String,
    request_timeout: Duration,
    connection: Option<Arc<dyn Connection>>,
}

/// Everything a lifecycle manager needs besides the shared context.
pub struct LifecycleParts {
    pub connector: Arc<dyn Connector>,
    pub registration: Arc<dyn RegistrationBuilder>,
    pub file_cache: Arc<dyn LocalCacheReset>,
    pub url: String,
    pub request_timeout: Duration,
    /// Stop-token polling grain for correlated waits.
    pub poll: Duration,
}

impl ConnectionLifecycleManager {
    /// Build a manager whose registry and gateway share `slots`.
    ///
    /// `registry` must have been created from the same `slots`, so that the
    /// server-responses listener feeds the gateway this manager waits on.
    pub fn new(
        context: Arc<AgentContext>,
        slots: Arc<ResponseSlots>,
        registry: ResponseDispatchRegistry,
        parts: LifecycleParts,
    ) -> Self {
        Self {
            context,
            connector: parts.connector,
            registry,
            gateway: CorrelationGateway::new(slots, SERVER_RESPONSES_TOPIC, parts.poll),
            registration: parts.registration,
            file_cache: parts.file_cache,
            url: parts.url,
            request_timeout: parts.request_timeout,
            connection: None,
        }
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.context
    }

    pub fn gateway(&self) -> &CorrelationGateway {
        &self.gateway
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Connect, register, bootstrap, and publish the session.
    ///
    /// Returns the server-assigned initial sequence id. The session is only
    /// published to other consumers after every step has succeeded; on error
    /// the caller is expected to [`unregister`](Self::unregister).
    pub fn register(&mut self) -> Result<i64, AgentError> {
        info!(url = %self.url, "Connecting to coordinator");
        let connection = self.connector.connect(&self.url)?;
        self.connection = Some(Arc::clone(&connection));

        self.registry.attach(connection.as_ref());
        self.registry.subscribe_pre_registration(connection.as_ref())?;

        let payload = self.registration.build()?;
        info!("Sending registration request");
        debug!(request = %payload, "Registration request");
        let response = self.request(connection.as_ref(), &payload, REGISTRATION_ENDPOINT)?;
        info!("Registration response received");
        debug!(response = %response, "Registration response");

        let response: RegistrationResponse = protocol::decode(response, REGISTRATION_ENDPOINT)?;
        let response_id = response.accepted_id()?;

        for entry in self.registry.bootstrap_entries() {
            let request = serde_json::to_value(BootstrapRequest {
                hash: entry.cache.content_hash(),
            })
            .map_err(|e| AgentError::Transport(e.into()))?;
            let response = self.request(connection.as_ref(), &request, &entry.endpoint)?;
            if let Err(source) = entry.listener.on_event(&Headers::new(), &response) {
                warn!(
                    endpoint = %entry.endpoint,
                    response = %response,
                    error = %source,
                    "Exception while handling response to bootstrap request"
                );
                return Err(AgentError::BootstrapHandling {
                    endpoint: entry.endpoint.clone(),
                    source,
                });
            }
            debug!(endpoint = %entry.endpoint, "Bootstrap resource applied");
        }

        self.registry.subscribe_post_registration(connection.as_ref())?;
        self.file_cache.reset().map_err(AgentError::LocalCache)?;

        // Now that registration is done the session can be shared.
        self.context.publish(connection);
        info!(response_id, "Registered with coordinator");
        Ok(response_id)
    }

    /// Tear down the current session. Safe to call repeatedly and without a
    /// session.
    pub fn unregister(&mut self) {
        self.context.clear_registered();

        let Some(connection) = self.connection.take() else {
            return;
        };

        if let Err(e) = connection.disconnect() {
            warn!(error = %e, "Failed to disconnect cleanly");
        }
        self.context.retract();

        // Advances the slots epoch: replies still in flight from this
        // connection must not match the next session's reused ids.
        self.gateway.reset();
        // Topic listener buffers.
        self.registry.reset();
        debug!("Unregistered");
    }

    /// Correlated request on the current session.
    pub fn request_on_session(&self, message: &Value, destination: &str) -> Result<Value, AgentError> {
        let connection = self.connection.as_ref().ok_or(AgentError::NotConnected)?;
        self.request(connection.as_ref(), message, destination)
    }

    fn request(
        &self,
        connection: &dyn Connection,
        message: &Value,
        destination: &str,
    ) -> Result<Value, AgentError> {
        self.gateway.blocking_request(
            connection,
            message,
            destination,
            self.request_timeout,
            self.context.stop_token(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{NoFileCache, TopicCache};
    use crate::loopback::{LoopbackConnector, ScriptedCoordinator};
    use crate::registry::BootstrapEntry;
    use crate::transport::{Listener, ResourceCache};
    use fleetlink_core::protocol::{
        AGENT_ACTIONS_TOPIC, COMMANDS_TOPIC, CORRELATION_ID_HEADER, DESTINATION_HEADER,
        HEARTBEAT_ENDPOINT, METADATA_REQUEST_ENDPOINT, METADATA_TOPIC, TOPOLOGIES_TOPIC,
        TOPOLOGY_REQUEST_ENDPOINT,
    };
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticRegistration;

    impl RegistrationBuilder for StaticRegistration {
        fn build(&self) -> anyhow::Result<Value> {
            Ok(json!({"hostname": "node-1"}))
        }
    }

    /// Bootstrap listener that records whether the session was already
    /// visible to other consumers when it ran.
    struct SessionRecordingListener {
        context: Arc<AgentContext>,
        saw_session: Mutex<Vec<bool>>,
        fail: bool,
    }

    impl Listener for SessionRecordingListener {
        fn topic(&self) -> &str {
            TOPOLOGIES_TOPIC
        }
        fn on_event(&self, _headers: &Headers, _body: &Value) -> anyhow::Result<()> {
            self.saw_session
                .lock()
                .unwrap()
                .push(self.context.connection().is_some());
            if self.fail {
                anyhow::bail!("cannot apply topology");
            }
            Ok(())
        }
    }

    impl ResourceCache for SessionRecordingListener {
        fn content_hash(&self) -> String {
            "topology-hash".to_string()
        }
    }

    #[derive(Default)]
    struct CountingReset(AtomicUsize);

    impl LocalCacheReset for CountingReset {
        fn reset(&self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager_with(
        coordinator: Arc<ScriptedCoordinator>,
        context: Arc<AgentContext>,
        registry: impl FnOnce(ResponseDispatchRegistry) -> ResponseDispatchRegistry,
        file_cache: Arc<dyn LocalCacheReset>,
    ) -> (ConnectionLifecycleManager, Arc<LoopbackConnector>) {
        let slots = Arc::new(ResponseSlots::new());
        let connector = Arc::new(LoopbackConnector::new(coordinator));
        let registry = registry(ResponseDispatchRegistry::new(Arc::clone(&slots)));
        let manager = ConnectionLifecycleManager::new(
            context,
            slots,
            registry,
            LifecycleParts {
                connector: connector.clone(),
                registration: Arc::new(StaticRegistration),
                file_cache,
                url: "wss://coordinator:8441/agent/stomp/v1".to_string(),
                request_timeout: Duration::from_millis(300),
                poll: Duration::from_millis(10),
            },
        );
        (manager, connector)
    }

    fn manager(
        coordinator: Arc<ScriptedCoordinator>,
    ) -> (ConnectionLifecycleManager, Arc<LoopbackConnector>) {
        manager_with(coordinator, Arc::default(), |r| r, Arc::new(NoFileCache))
    }

    fn recording_topology(
        context: &Arc<AgentContext>,
        fail: bool,
    ) -> Arc<SessionRecordingListener> {
        Arc::new(SessionRecordingListener {
            context: Arc::clone(context),
            saw_session: Mutex::new(Vec::new()),
            fail,
        })
    }

    #[test]
    fn test_register_publishes_session_and_returns_id() {
        let coordinator = Arc::new(ScriptedCoordinator::new(5));
        let resets = Arc::new(CountingReset::default());
        let (mut mgr, connector) =
            manager_with(coordinator, Arc::default(), |r| r, resets.clone());

        assert!(mgr.context().connection().is_none());
        let id = mgr.register().unwrap();
        assert_eq!(id, 5);
        assert!(mgr.context().is_registered());
        assert!(mgr.context().connection().is_some());
        assert_eq!(resets.0.load(Ordering::SeqCst), 1);

        let conn = connector.last_connection().unwrap();
        let subscribed = conn.subscriptions();
        assert_eq!(subscribed[0], SERVER_RESPONSES_TOPIC);
        assert_eq!(subscribed[1], AGENT_ACTIONS_TOPIC);
        assert!(subscribed.iter().any(|t| t == COMMANDS_TOPIC));
    }

    #[test]
    fn test_registration_rejection_aborts_without_publishing() {
        let coordinator = Arc::new(ScriptedCoordinator::new(5));
        coordinator.reply_to_registration(
            json!({"id": "5", "exitstatus": "1", "log": "version mismatch"}),
        );
        let (mut mgr, connector) = manager(coordinator);

        let err = mgr.register().unwrap_err();
        assert!(matches!(err, AgentError::RegistrationRejected(_)));
        assert!(err.to_string().contains("version mismatch"));
        assert!(!mgr.context().is_registered());
        assert!(mgr.context().connection().is_none());

        // Post-registration topics were never subscribed
        let conn = connector.last_connection().unwrap();
        assert!(!conn.subscriptions().iter().any(|t| t == COMMANDS_TOPIC));

        mgr.unregister();
        assert!(!mgr.has_connection());
        assert!(conn.is_closed());
    }

    #[test]
    fn test_session_hidden_during_bootstrap() {
        let coordinator = Arc::new(ScriptedCoordinator::new(1));
        let context: Arc<AgentContext> = Arc::default();
        let topology = recording_topology(&context, false);
        let entry =
            BootstrapEntry::new(TOPOLOGY_REQUEST_ENDPOINT, topology.clone(), topology.clone());
        let (mut mgr, _connector) = manager_with(
            coordinator,
            context,
            move |r| r.with_bootstrap(entry),
            Arc::new(NoFileCache),
        );

        mgr.register().unwrap();
        assert_eq!(topology.saw_session.lock().unwrap().as_slice(), [false]);
        assert!(mgr.context().connection().is_some());
    }

    /// File-cache reset (the last step before publishing) that records what
    /// other consumers could see at that point.
    struct SessionCheckReset {
        context: Arc<AgentContext>,
        observed: Mutex<Vec<(bool, bool)>>,
    }

    impl LocalCacheReset for SessionCheckReset {
        fn reset(&self) -> anyhow::Result<()> {
            self.observed.lock().unwrap().push((
                self.context.is_registered(),
                self.context.connection().is_some(),
            ));
            Ok(())
        }
    }

    #[test]
    fn test_session_hidden_until_post_registration_steps_finish() {
        let coordinator = Arc::new(ScriptedCoordinator::new(1));
        let context: Arc<AgentContext> = Arc::default();
        let check = Arc::new(SessionCheckReset {
            context: Arc::clone(&context),
            observed: Mutex::new(Vec::new()),
        });
        let (mut mgr, connector) = manager_with(coordinator, context, |r| r, check.clone());

        mgr.register().unwrap();

        // Post-registration topics were subscribed before the cache reset ran,
        // and neither step could see the session.
        let subscribed = connector.last_connection().unwrap().subscriptions();
        assert!(subscribed.iter().any(|t| t == COMMANDS_TOPIC));
        assert_eq!(check.observed.lock().unwrap().as_slice(), [(false, false)]);
        assert!(mgr.context().is_registered());
        assert!(mgr.context().connection().is_some());
    }

    #[test]
    fn test_late_reply_from_previous_connection_is_discarded() {
        let coordinator = Arc::new(ScriptedCoordinator::new(1));
        let (mut mgr, connector) = manager(coordinator);

        mgr.register().unwrap();
        let previous = connector.last_connection().unwrap();
        mgr.unregister();
        mgr.register().unwrap();

        // The old dispatch path delivers a reply for id "1" after teardown;
        // the new connection's next request also gets id "1".
        let mut headers = Headers::new();
        headers.insert(DESTINATION_HEADER.to_string(), SERVER_RESPONSES_TOPIC.to_string());
        headers.insert(CORRELATION_ID_HEADER.to_string(), "1".to_string());
        for listener in previous.listeners() {
            listener.on_message(&headers, &json!({"id": 999})).unwrap();
        }
        assert_eq!(mgr.gateway().slots().buffered_len(), 0);

        let reply = mgr
            .request_on_session(&json!({"id": 1}), HEARTBEAT_ENDPOINT)
            .unwrap();
        assert_eq!(reply, json!({"id": 2}));
    }

    #[test]
    fn test_bootstrap_failure_aborts_registration() {
        let coordinator = Arc::new(ScriptedCoordinator::new(1));
        let context: Arc<AgentContext> = Arc::default();
        let topology = recording_topology(&context, true);
        let metadata = Arc::new(TopicCache::new(METADATA_TOPIC));
        let entries = [
            BootstrapEntry::new(TOPOLOGY_REQUEST_ENDPOINT, topology.clone(), topology.clone()),
            BootstrapEntry::new(METADATA_REQUEST_ENDPOINT, metadata.clone(), metadata.clone()),
        ];
        let resets = Arc::new(CountingReset::default());
        let (mut mgr, _connector) = manager_with(
            coordinator,
            context,
            move |r| entries.into_iter().fold(r, |r, e| r.with_bootstrap(e)),
            resets.clone(),
        );

        let err = mgr.register().unwrap_err();
        match &err {
            AgentError::BootstrapHandling { endpoint, .. } => {
                assert_eq!(endpoint, TOPOLOGY_REQUEST_ENDPOINT)
            }
            other => panic!("Wrong error: {other}"),
        }
        // Later entries and the marker reset never ran
        assert!(metadata.latest().is_none());
        assert_eq!(resets.0.load(Ordering::SeqCst), 0);
        assert!(!mgr.context().is_registered());
        assert!(mgr.context().connection().is_none());
    }

    #[test]
    fn test_bootstrap_sends_cached_hash() {
        let coordinator = Arc::new(ScriptedCoordinator::new(1));
        let metadata = Arc::new(TopicCache::new(METADATA_TOPIC));
        metadata
            .on_event(&Headers::new(), &json!({"clusters": {}}))
            .unwrap();
        let expected_hash = metadata.content_hash();
        let entry =
            BootstrapEntry::new(METADATA_REQUEST_ENDPOINT, metadata.clone(), metadata.clone());
        let (mut mgr, _connector) = manager_with(
            Arc::clone(&coordinator),
            Arc::default(),
            move |r| r.with_bootstrap(entry),
            Arc::new(NoFileCache),
        );

        mgr.register().unwrap();
        let sent = coordinator.requests_to(METADATA_REQUEST_ENDPOINT);
        assert_eq!(sent, vec![json!({"hash": expected_hash})]);
    }

    #[test]
    fn test_registration_timeout() {
        let coordinator = Arc::new(ScriptedCoordinator::new(1));
        coordinator.drop_replies_to(REGISTRATION_ENDPOINT);
        let (mut mgr, _connector) = manager(coordinator);
        let err = mgr.register().unwrap_err();
        assert!(matches!(err, AgentError::RequestTimeout { .. }));
        assert!(!mgr.context().is_registered());
    }

    #[test]
    fn test_unregister_without_connection_is_noop() {
        let coordinator = Arc::new(ScriptedCoordinator::new(1));
        let (mut mgr, _connector) = manager(coordinator);
        mgr.unregister();
        mgr.unregister();
        assert!(!mgr.context().is_registered());
        assert!(mgr.context().connection().is_none());
    }

    #[test]
    fn test_unregister_clears_session_and_pending_state() {
        let coordinator = Arc::new(ScriptedCoordinator::new(1));
        let (mut mgr, connector) = manager(coordinator);
        mgr.register().unwrap();

        mgr.gateway().slots().deposit("stale", json!({"id": 99}));
        mgr.unregister();

        assert!(!mgr.context().is_registered());
        assert!(mgr.context().connection().is_none());
        assert_eq!(mgr.gateway().slots().buffered_len(), 0);
        assert!(connector.last_connection().unwrap().is_closed());
        assert!(matches!(
            mgr.request_on_session(&json!({}), "/heartbeat"),
            Err(AgentError::NotConnected)
        ));
    }

    #[test]
    fn test_connect_failure_propagates() {
        let coordinator = Arc::new(ScriptedCoordinator::new(1));
        let (mut mgr, connector) = manager(coordinator);
        connector.refuse_connections(true);
        let err = mgr.register().unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
        assert!(!mgr.has_connection());
    }
}
