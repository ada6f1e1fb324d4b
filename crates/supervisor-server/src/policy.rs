use crate::dispatcher::CommandDispatcher;
use crate::pipeline::EventPipeline;
use crate::tracker::SessionTracker;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use supervisor_core::config::{KillOnCostConfig, PolicyConfig, ResumeOnIdleConfig, RestartOnCompactionConfig};
use supervisor_core::model::{Command, CommandTarget, CommandType, Event};
use tracing::{info, warn};

const POLICY_AGENT_ID: &str = "policy-engine";

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum PolicyName {
    ResumeOnIdle,
    RestartOnCompaction,
    KillOnCost,
}

impl PolicyName {
    fn as_str(&self) -> &'static str {
        match self {
            Self::ResumeOnIdle => "resume_on_idle",
            Self::RestartOnCompaction => "restart_on_compaction",
            Self::KillOnCost => "kill_on_cost",
        }
    }
}

#[derive(Default)]
struct RetryState {
    count: u32,
    last_attempt: Option<chrono::DateTime<Utc>>,
}

/// Periodic evaluator that fires intervention commands and bounds retries
/// with a reset window. One ticker task per running engine; retry state is
/// keyed by `(session_id, policy)`.
pub struct PolicyEngine {
    tracker: Arc<SessionTracker>,
    dispatcher: Arc<CommandDispatcher>,
    pipeline: Arc<EventPipeline>,
    retry_state: Mutex<HashMap<(String, &'static str), RetryState>>,
    seq: AtomicU64,
    resume_on_idle: ResumeOnIdleConfig,
    restart_on_compaction: RestartOnCompactionConfig,
    kill_on_cost: KillOnCostConfig,
}

impl PolicyEngine {
    pub fn new(
        tracker: Arc<SessionTracker>,
        dispatcher: Arc<CommandDispatcher>,
        pipeline: Arc<EventPipeline>,
        resume_on_idle: ResumeOnIdleConfig,
        restart_on_compaction: RestartOnCompactionConfig,
        kill_on_cost: KillOnCostConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tracker,
            dispatcher,
            pipeline,
            retry_state: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
            resume_on_idle,
            restart_on_compaction,
            kill_on_cost,
        })
    }

    /// Spawns the ticker task; the returned handle's `abort()` is the
    /// engine's cancellation path, unwinding both the ticker and any
    /// outstanding dispatch.
    pub fn spawn(self: Arc<Self>, check_interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }

    async fn tick(&self) {
        let sessions = self.tracker.list();
        for session in sessions {
            if self.resume_on_idle.policy.enabled {
                if let Some(threshold_hit) = session.last_activity.map(|t| {
                    Utc::now().signed_duration_since(t)
                        >= chrono::Duration::from_std(self.resume_on_idle.idle_threshold).unwrap_or_default()
                }) {
                    if threshold_hit {
                        self.maybe_fire(
                            PolicyName::ResumeOnIdle,
                            &self.resume_on_idle.policy,
                            &session.session_id,
                            CommandType::PromptSession,
                            CommandTarget { project: None, node_id: Some(session.node_id.clone()) },
                        )
                        .await;
                    }
                }
            }
            if self.restart_on_compaction.policy.enabled
                && session.token_usage.total as u64 >= self.restart_on_compaction.token_threshold
            {
                self.maybe_fire(
                    PolicyName::RestartOnCompaction,
                    &self.restart_on_compaction.policy,
                    &session.session_id,
                    CommandType::RestartSession,
                    CommandTarget { project: None, node_id: Some(session.node_id.clone()) },
                )
                .await;
            }
            if self.kill_on_cost.policy.enabled
                && session.session_cost >= self.kill_on_cost.cost_threshold_usd
            {
                self.maybe_fire(
                    PolicyName::KillOnCost,
                    &self.kill_on_cost.policy,
                    &session.session_id,
                    CommandType::KillSession,
                    CommandTarget { project: None, node_id: Some(session.node_id.clone()) },
                )
                .await;
            }
        }
    }

    async fn maybe_fire(
        &self,
        name: PolicyName,
        config: &PolicyConfig,
        session_id: &str,
        command_type: CommandType,
        target: CommandTarget,
    ) {
        let now = Utc::now();
        let capped = {
            let mut states = self.retry_state.lock();
            let state = states
                .entry((session_id.to_string(), name.as_str()))
                .or_default();
            if state.count >= config.max_retries {
                let reset_due = state
                    .last_attempt
                    .map(|t| now.signed_duration_since(t) >= chrono::Duration::from_std(config.retry_reset).unwrap_or_default())
                    .unwrap_or(true);
                if reset_due {
                    state.count = 0;
                    false
                } else {
                    true
                }
            } else {
                false
            }
        };

        if capped {
            self.emit_policy_event(
                "policy.retry_cap",
                name.as_str(),
                session_id,
                "suppressed",
                None,
            );
            self.emit_policy_event("policy.alert", name.as_str(), session_id, "suppressed", None);
            return;
        }

        let command = Command {
            command_id: String::new(),
            kind: command_type,
            idempotency_key: None,
            target,
            args: Default::default(),
            timeout: None,
        };
        let dispatch_result = self.dispatcher.dispatch_command(command).await;

        let (action_result, last_error) = match &dispatch_result {
            Ok(r) => (format!("{:?}", r.status), r.error.clone()),
            Err(e) => ("error".to_string(), Some(e.to_string())),
        };

        {
            let mut states = self.retry_state.lock();
            let state = states
                .entry((session_id.to_string(), name.as_str()))
                .or_default();
            state.count += 1;
            state.last_attempt = Some(now);
        }

        self.emit_policy_event(
            "policy.action",
            name.as_str(),
            session_id,
            &action_result,
            last_error,
        );

        if let Err(e) = &dispatch_result {
            warn!(policy = name.as_str(), session_id, "dispatch failed: {e}");
        } else {
            info!(policy = name.as_str(), session_id, "policy dispatched {:?}", command_type);
        }
    }

    fn emit_policy_event(
        &self,
        kind: &str,
        policy: &str,
        session_id: &str,
        result: &str,
        last_error: Option<String>,
    ) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let retry_count = self
            .retry_state
            .lock()
            .get(&(session_id.to_string(), policy))
            .map(|s| s.count)
            .unwrap_or(0);
        let event = Event {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            kind: kind.to_string(),
            data: serde_json::json!({
                "policy": policy,
                "session_id": session_id,
                "result": result,
                "retry_count": retry_count,
                "last_error": last_error,
            }),
            timestamp: Utc::now(),
            seq,
        };
        if let Err(e) = self.pipeline.process_event(POLICY_AGENT_ID, event) {
            warn!("failed to emit policy event: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::CommandDispatcher;
    use crate::registry::NodeRegistry;
    use crate::transport::Transport;
    use once_cell::sync::OnceCell;
    use std::sync::atomic::AtomicUsize;
    use supervisor_core::config::PolicyConfig;
    use supervisor_core::model::{CommandStatus, NodeStatus, SessionStatus, TokenUsage, TrackedSession};
    use supervisor_storage::{DurableStore, SqliteStore};

    struct NoopReplay;
    impl crate::pipeline::ReplayRequester for NoopReplay {
        fn request_replay(&self, _agent_id: &str, _from: u64, _to: u64) {}
    }

    /// Immediately resolves every dispatched command as a success, mimicking
    /// an agent that replies right away, so the retry cap tests exercise
    /// real dispatch round-trips instead of a fake pass-through.
    struct AutoReplyTransport {
        dispatcher: OnceCell<Arc<CommandDispatcher>>,
        sends: AtomicUsize,
    }
    impl AutoReplyTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self { dispatcher: OnceCell::new(), sends: AtomicUsize::new(0) })
        }
        fn set_dispatcher(&self, d: Arc<CommandDispatcher>) {
            let _ = self.dispatcher.set(d);
        }
    }
    impl Transport for AutoReplyTransport {
        fn send(&self, _node_id: &str, command: &Command) -> supervisor_core::Result<()> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.dispatcher.get() {
                let d = d.clone();
                let command_id = command.command_id.clone();
                tokio::spawn(async move {
                    d.handle_command_result(supervisor_core::model::CommandResult {
                        command_id,
                        status: CommandStatus::Success,
                        output: Some("ok".into()),
                        error: None,
                        timestamp: Utc::now(),
                    });
                });
            }
            Ok(())
        }
    }

    fn disabled_policy() -> PolicyConfig {
        PolicyConfig { enabled: false, max_retries: 0, retry_reset: std::time::Duration::from_secs(3600) }
    }

    async fn build_engine(
        kill_max_retries: u32,
        kill_retry_reset: std::time::Duration,
    ) -> (Arc<PolicyEngine>, Arc<AutoReplyTransport>) {
        let s = SqliteStore::connect_in_memory().await;
        s.migrate().await.unwrap();
        let store: Arc<dyn DurableStore> = Arc::new(s);
        let registry = Arc::new(NodeRegistry::new(store.clone()));
        let tracker = Arc::new(SessionTracker::new(store.clone()));
        registry.register("n1", "host".into(), None, vec![], vec![]).await.unwrap();
        assert_eq!(registry.get("n1").unwrap().status, NodeStatus::Online);

        tracker.create(TrackedSession {
            session_id: "s1".into(),
            node_id: "n1".into(),
            project: "proj".into(),
            status: SessionStatus::Running,
            token_usage: TokenUsage::default(),
            compaction_count: 0,
            current_task: None,
            last_activity: None,
            session_cost: 15.0,
            model: None,
            started_at: None,
        });

        let transport = AutoReplyTransport::new();
        let dispatcher = CommandDispatcher::new(registry, tracker.clone(), store, transport.clone());
        transport.set_dispatcher(dispatcher.clone());

        let pipeline = EventPipeline::new(store_for_pipeline().await, 64, 100, Arc::new(NoopReplay));

        let engine = PolicyEngine::new(
            tracker,
            dispatcher,
            pipeline,
            ResumeOnIdleConfig { policy: disabled_policy(), idle_threshold: std::time::Duration::from_secs(3600) },
            RestartOnCompactionConfig { policy: disabled_policy(), token_threshold: u64::MAX },
            KillOnCostConfig {
                policy: PolicyConfig { enabled: true, max_retries: kill_max_retries, retry_reset: kill_retry_reset },
                cost_threshold_usd: 10.0,
            },
        );
        (engine, transport)
    }

    async fn store_for_pipeline() -> Arc<dyn DurableStore> {
        let s = SqliteStore::connect_in_memory().await;
        s.migrate().await.unwrap();
        Arc::new(s)
    }

    /// P6: dispatches by a policy for a session never exceed `max_retries`
    /// within a `retry_reset_seconds` window; after the window elapses the
    /// counter resets and dispatch resumes.
    #[tokio::test]
    async fn kill_on_cost_retry_cap_then_resets() {
        let (engine, transport) =
            build_engine(2, std::time::Duration::from_millis(60)).await;

        engine.tick().await;
        engine.tick().await;
        // Give the spawned auto-reply tasks a beat to land before the next
        // tick reads retry state.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(transport.sends.load(Ordering::SeqCst), 2);

        // Third tick: cap reached, reset window not yet elapsed -> suppressed.
        engine.tick().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(transport.sends.load(Ordering::SeqCst), 2);

        // After the reset window elapses, the counter resets and the policy
        // fires again.
        tokio::time::sleep(std::time::Duration::from_millis(70)).await;
        engine.tick().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(transport.sends.load(Ordering::SeqCst), 3);
    }
}
