use crate::dispatcher::CommandDispatcher;
use crate::hub::ConnectionHub;
use crate::pipeline::EventPipeline;
use crate::policy::PolicyEngine;
use crate::reconciler::OauthOrchestrator;
use crate::registry::NodeRegistry;
use crate::tracker::SessionTracker;
use crate::idempotency_cache::CredentialPushCache;
use std::sync::Arc;
use supervisor_core::SupervisorConfig;
use supervisor_storage::DurableStore;
use tracing::info;

/// Everything the binary needs to run one supervisor process, built once at
/// startup and handed to the router as shared state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<NodeRegistry>,
    pub tracker: Arc<SessionTracker>,
    pub hub: Arc<ConnectionHub>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub pipeline: Arc<EventPipeline>,
    pub oauth: Arc<OauthOrchestrator>,
    pub credential_push_cache: Arc<CredentialPushCache>,
    pub store: Arc<dyn DurableStore>,
}

impl AppState {
    /// Wires every component together, resolving the Hub's two cyclic
    /// dependencies (Pipeline, Dispatcher) after both exist. Also runs
    /// startup recovery: nodes load forced-offline, sessions load
    /// forced-unreachable.
    pub async fn bootstrap(config: SupervisorConfig, store: Arc<dyn DurableStore>, strict_origin: bool) -> anyhow::Result<Self> {
        store.migrate().await?;

        let registry = Arc::new(NodeRegistry::new(store.clone()));
        let tracker = Arc::new(SessionTracker::new(store.clone()));

        let loaded_nodes = registry.load_from_db().await?;
        let loaded_sessions = tracker.load_from_db().await?;
        info!(loaded_nodes, loaded_sessions, "startup recovery complete, all forced offline/unreachable");

        let hub = ConnectionHub::new(config.clone(), registry.clone(), tracker.clone(), strict_origin);

        let pipeline = EventPipeline::new(
            store.clone(),
            config.event_channel_capacity,
            config.event_dedup_cache_capacity,
            hub.clone(),
        );
        hub.set_pipeline(pipeline.clone());

        let transport: Arc<dyn crate::transport::Transport> = hub.clone();
        let dispatcher = CommandDispatcher::new(registry.clone(), tracker.clone(), store.clone(), transport);
        hub.set_dispatcher(dispatcher.clone());

        let oauth = Arc::new(OauthOrchestrator::new(dispatcher.clone()));
        let credential_push_cache = Arc::new(CredentialPushCache::new(config.credential_push_cache_capacity));

        Ok(Self {
            registry,
            tracker,
            hub,
            dispatcher,
            pipeline,
            oauth,
            credential_push_cache,
            store,
        })
    }

    /// Spawns the Hub's heartbeat sweeper, the Policy Engine's ticker, and
    /// the periodic idempotency-record purge. Returns their join handles so
    /// the caller can hold or abort them.
    pub fn spawn_background_tasks(
        &self,
        config: &SupervisorConfig,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        handles.push(self.hub.spawn_heartbeat_sweeper());

        let policy_engine = PolicyEngine::new(
            self.tracker.clone(),
            self.dispatcher.clone(),
            self.pipeline.clone(),
            config.resume_on_idle.clone(),
            config.restart_on_compaction.clone(),
            config.kill_on_cost.clone(),
        );
        handles.push(policy_engine.spawn(config.policy_check_interval));

        let store = self.store.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                match store.idempotency_purge_expired(chrono::Utc::now()).await {
                    Ok(n) if n > 0 => info!(purged = n, "purged expired idempotency records"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("idempotency purge failed: {e}"),
                }
            }
        }));

        handles
    }
}
