use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use fleetlink_core::config::AgentConfig;
use fleetlink_core::protocol::{
    ALERT_DEFINITIONS_REQUEST_ENDPOINT, ALERT_DEFINITIONS_TOPIC, COMMANDS_TOPIC,
    CONFIGURATIONS_REQUEST_ENDPOINT, CONFIGURATIONS_TOPIC, HOST_LEVEL_PARAMS_REQUEST_ENDPOINT,
    HOST_LEVEL_PARAMS_TOPIC, METADATA_REQUEST_ENDPOINT, METADATA_TOPIC, TOPOLOGIES_TOPIC,
    TOPOLOGY_REQUEST_ENDPOINT,
};
use fleetlink_core::stop::StopToken;

use crate::cache::{FileCache, NoFileCache, TopicCache};
use crate::context::AgentContext;
use crate::gateway::ResponseSlots;
use crate::heartbeat::HeartbeatLoop;
use crate::lifecycle::{ConnectionLifecycleManager, LifecycleParts};
use crate::listeners::AgentActionsListener;
use crate::registration::HostRegistration;
use crate::registry::{BootstrapEntry, ResponseDispatchRegistry};
use crate::restart::ExitRestart;
use crate::transport::{Connector, LocalCacheReset, RestartTrigger};

/// Per-topic state the agent keeps between sessions.
pub struct AgentResources {
    pub topology: Arc<TopicCache>,
    pub metadata: Arc<TopicCache>,
    pub configurations: Arc<TopicCache>,
    pub host_level_params: Arc<TopicCache>,
    pub alert_definitions: Arc<TopicCache>,
    pub commands: Arc<TopicCache>,
}

impl AgentResources {
    fn new() -> Self {
        Self {
            topology: Arc::new(TopicCache::new(TOPOLOGIES_TOPIC)),
            metadata: Arc::new(TopicCache::new(METADATA_TOPIC)),
            configurations: Arc::new(TopicCache::new(CONFIGURATIONS_TOPIC)),
            host_level_params: Arc::new(TopicCache::new(HOST_LEVEL_PARAMS_TOPIC)),
            alert_definitions: Arc::new(TopicCache::new(ALERT_DEFINITIONS_TOPIC)),
            commands: Arc::new(TopicCache::new(COMMANDS_TOPIC)),
        }
    }

    /// Bootstrap order: topology first, alert definitions last.
    fn bootstrap_entries(&self) -> Vec<BootstrapEntry> {
        [
            (TOPOLOGY_REQUEST_ENDPOINT, &self.topology),
            (METADATA_REQUEST_ENDPOINT, &self.metadata),
            (CONFIGURATIONS_REQUEST_ENDPOINT, &self.configurations),
            (HOST_LEVEL_PARAMS_REQUEST_ENDPOINT, &self.host_level_params),
            (ALERT_DEFINITIONS_REQUEST_ENDPOINT, &self.alert_definitions),
        ]
        .into_iter()
        .map(|(endpoint, cache)| BootstrapEntry::new(endpoint, cache.clone(), cache.clone()))
        .collect()
    }
}

/// A fully wired agent: listeners, bootstrap resources, lifecycle manager and
/// heartbeat loop sharing one context and stop token.
pub struct Agent {
    heartbeat: HeartbeatLoop,
    resources: AgentResources,
    restart: Arc<ExitRestart>,
    stop: StopToken,
}

impl Agent {
    pub fn new(config: &AgentConfig, connector: Arc<dyn Connector>, stop: StopToken) -> Self {
        let restart = Arc::new(ExitRestart::new(stop.clone()));
        let resources = AgentResources::new();
        let slots = Arc::new(ResponseSlots::new());
        let trigger: Arc<dyn RestartTrigger> = restart.clone();

        let mut registry = ResponseDispatchRegistry::new(Arc::clone(&slots))
            .with_listener(Arc::new(AgentActionsListener::new(Arc::clone(&trigger))));
        for cache in [
            &resources.commands,
            &resources.configurations,
            &resources.metadata,
            &resources.topology,
            &resources.host_level_params,
            &resources.alert_definitions,
        ] {
            registry = registry.with_listener(cache.clone());
        }
        for entry in resources.bootstrap_entries() {
            registry = registry.with_bootstrap(entry);
        }

        let file_cache: Arc<dyn LocalCacheReset> = match &config.agent.cache_dir {
            Some(dir) => Arc::new(FileCache::new(dir)),
            None => Arc::new(NoFileCache),
        };

        let context = Arc::new(AgentContext::new(stop.clone()));
        let lifecycle = ConnectionLifecycleManager::new(
            context,
            slots,
            registry,
            LifecycleParts {
                connector,
                registration: Arc::new(HostRegistration::from_config(config)),
                file_cache,
                url: config.connection_url(),
                request_timeout: config.request_timeout(),
                poll: config.stop_poll(),
            },
        );

        Self {
            heartbeat: HeartbeatLoop::new(lifecycle, trigger, config.heartbeat_interval()),
            resources,
            restart,
            stop,
        }
    }

    /// Heartbeat faster (or slower) than the configured whole-second interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat.set_interval(interval);
        self
    }

    pub fn stop_token(&self) -> &StopToken {
        &self.stop
    }

    pub fn resources(&self) -> &AgentResources {
        &self.resources
    }

    pub fn heartbeat(&self) -> &HeartbeatLoop {
        &self.heartbeat
    }

    pub fn restart(&self) -> &ExitRestart {
        &self.restart
    }

    /// Run the heartbeat loop to completion and return the process exit code.
    pub fn run(&mut self) -> i32 {
        info!("Starting fleetlink agent");
        self.heartbeat.run();
        let code = self.restart.exit_code();
        info!(exit_code = code, "Agent stopped");
        code
    }
}
