use crate::registry::NodeRegistry;
use crate::tracker::SessionTracker;
use crate::transport::Transport;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use supervisor_core::model::{Command, CommandResult, CommandStatus, IDEMPOTENCY_TTL};
use supervisor_core::util::{canonical_command_payload, idempotency_key_hash};
use supervisor_core::{Result, StateError};
use supervisor_storage::DurableStore;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Routes operator/policy commands to the resolved agent and correlates the
/// asynchronous `command_result` reply back to the caller. The pending map
/// is a per-command single-slot channel; deregistration is always the
/// dispatching task's responsibility, on every exit path.
pub struct CommandDispatcher {
    pending: Mutex<HashMap<String, oneshot::Sender<CommandResult>>>,
    registry: Arc<NodeRegistry>,
    tracker: Arc<SessionTracker>,
    store: Arc<dyn DurableStore>,
    transport: Arc<dyn Transport>,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<NodeRegistry>,
        tracker: Arc<SessionTracker>,
        store: Arc<dyn DurableStore>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            registry,
            tracker,
            store,
            transport,
        })
    }

    /// Normalizes the command id, checks the idempotency table for a replay,
    /// resolves the target node, sends, then awaits the correlated reply
    /// (or synthesizes one on timeout).
    pub async fn dispatch_command(&self, mut command: Command) -> Result<CommandResult> {
        if command.command_id.is_empty() {
            command.command_id = uuid::Uuid::new_v4().to_string();
        } else if uuid::Uuid::parse_str(&command.command_id).is_err() {
            return Err(StateError::validation("command_id is not a valid UUID"));
        }

        let timeout = command.effective_timeout();
        let target_json = serde_json::to_value(&command.target).unwrap_or_default();
        let args_json = serde_json::to_value(&command.args).unwrap_or_default();
        let canonical = canonical_command_payload(
            command.kind.as_wire_str(),
            &target_json,
            &args_json,
            timeout.as_millis() as u64,
        );

        let key_hash = command
            .idempotency_key
            .as_ref()
            .map(|k| idempotency_key_hash(k, &canonical));

        if let Some(hash) = &key_hash {
            if let Some(record) = self.store.idempotency_lookup(hash).await? {
                if record.expires_at > Utc::now() {
                    info!(command_id = %command.command_id, "idempotent replay, no transport send");
                    return Ok(record.result);
                }
            }
        }

        let node_id = match self.resolve_target(&command) {
            Ok(id) => id,
            Err(TargetResolution::Unavailable(msg)) => {
                return Ok(CommandResult::failure(command.command_id, msg));
            }
            Err(TargetResolution::Invalid(msg)) => return Err(StateError::validation(msg)),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(command.command_id.clone(), tx);

        if let Err(e) = self.transport.send(&node_id, &command) {
            self.pending.lock().remove(&command.command_id);
            return Err(e);
        }

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Sender dropped without a reply — treat as timeout, since the
                // result the caller awaits will never arrive.
                self.pending.lock().remove(&command.command_id);
                CommandResult::timeout(
                    command.command_id.clone(),
                    format!("command timed out after {}ms", timeout.as_millis()),
                )
            }
            Err(_) => {
                self.pending.lock().remove(&command.command_id);
                CommandResult::timeout(
                    command.command_id.clone(),
                    format!("command timed out after {}ms", timeout.as_millis()),
                )
            }
        };

        if result.status == CommandStatus::Success {
            if let Some(hash) = &key_hash {
                self.store
                    .idempotency_commit(
                        hash,
                        &command.command_id,
                        &result,
                        Utc::now() + IDEMPOTENCY_TTL,
                    )
                    .await?;
            }
        }

        Ok(result)
    }

    /// Called by the Hub when a `command_result` envelope arrives. Returns
    /// `false` (logged, dropped) if there was no waiter.
    pub fn handle_command_result(&self, result: CommandResult) -> bool {
        let waiter = self.pending.lock().remove(&result.command_id);
        match waiter {
            Some(tx) => tx.send(result).is_ok(),
            None => {
                warn!(command_id = %result.command_id, "command result with no waiter, dropping");
                false
            }
        }
    }

    fn resolve_target(
        &self,
        command: &Command,
    ) -> std::result::Result<String, TargetResolution> {
        if let Some(node_id) = &command.target.node_id {
            return if self.registry.is_online(node_id) {
                Ok(node_id.clone())
            } else {
                Err(TargetResolution::Unavailable(format!(
                    "target node offline: {node_id}"
                )))
            };
        }

        let Some(project) = &command.target.project else {
            return Err(TargetResolution::Invalid(
                "command target must set node_id or project".into(),
            ));
        };

        // Session-owning node first, per the Open Question (a) resolution.
        for session in self.tracker.list() {
            if &session.project == project && self.registry.is_online(&session.node_id) {
                return Ok(session.node_id);
            }
        }

        for node in self.registry.list() {
            if node.status == supervisor_core::model::NodeStatus::Online
                && node.capabilities.iter().any(|c| c == project)
            {
                return Ok(node.id);
            }
        }

        Err(TargetResolution::Unavailable(format!(
            "no online node owns project: {project}"
        )))
    }
}

enum TargetResolution {
    Unavailable(String),
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeRegistry;
    use crate::tracker::SessionTracker;
    use parking_lot::Mutex as PMutex;
    use supervisor_core::model::{CommandTarget, CommandType};
    use supervisor_storage::SqliteStore;

    struct RecordingTransport {
        sent: Arc<PMutex<Vec<(String, String)>>>,
        fail: bool,
    }
    impl Transport for RecordingTransport {
        fn send(&self, node_id: &str, command: &Command) -> Result<()> {
            if self.fail {
                return Err(StateError::Transport("boom".into()));
            }
            self.sent
                .lock()
                .push((node_id.to_string(), command.command_id.clone()));
            Ok(())
        }
    }

    async fn setup() -> (Arc<NodeRegistry>, Arc<SessionTracker>, Arc<dyn DurableStore>) {
        let s = SqliteStore::connect_in_memory().await;
        s.migrate().await.unwrap();
        let store: Arc<dyn DurableStore> = Arc::new(s);
        (
            Arc::new(NodeRegistry::new(store.clone())),
            Arc::new(SessionTracker::new(store.clone())),
            store,
        )
    }

    #[tokio::test]
    async fn offline_target_synthesizes_failure_without_send() {
        let (registry, tracker, store) = setup().await;
        registry.register("n1", "h".into(), None, vec![], vec![]).await.unwrap();
        registry.mark_offline("n1").await.unwrap();
        let sent = Arc::new(PMutex::new(vec![]));
        let transport = Arc::new(RecordingTransport { sent: sent.clone(), fail: false });
        let dispatcher = CommandDispatcher::new(registry, tracker, store, transport);

        let command = Command {
            command_id: String::new(),
            kind: CommandType::KillSession,
            idempotency_key: None,
            target: CommandTarget { project: None, node_id: Some("n1".into()) },
            args: Default::default(),
            timeout: None,
        };
        let result = dispatcher.dispatch_command(command).await.unwrap();
        assert_eq!(result.status, CommandStatus::Failure);
        assert_eq!(result.error.as_deref(), Some("target node offline: n1"));
        assert!(sent.lock().is_empty());
    }

    #[tokio::test]
    async fn timeout_fires_when_no_reply_arrives() {
        let (registry, tracker, store) = setup().await;
        registry.register("n1", "h".into(), None, vec![], vec![]).await.unwrap();
        let sent = Arc::new(PMutex::new(vec![]));
        let transport = Arc::new(RecordingTransport { sent: sent.clone(), fail: false });
        let dispatcher = CommandDispatcher::new(registry, tracker, store, transport);

        let command = Command {
            command_id: String::new(),
            kind: CommandType::SessionStatus,
            idempotency_key: None,
            target: CommandTarget { project: None, node_id: Some("n1".into()) },
            args: Default::default(),
            timeout: Some(std::time::Duration::from_millis(30)),
        };
        let result = dispatcher.dispatch_command(command).await.unwrap();
        assert_eq!(result.status, CommandStatus::Timeout);
        assert_eq!(sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn idempotent_repeat_returns_cached_result_without_second_send() {
        let (registry, tracker, store) = setup().await;
        registry.register("n1", "h".into(), None, vec![], vec![]).await.unwrap();
        let sent = Arc::new(PMutex::new(vec![]));
        let transport = Arc::new(RecordingTransport { sent: sent.clone(), fail: false });
        let dispatcher = CommandDispatcher::new(registry, tracker, store, transport);

        let mut args = std::collections::BTreeMap::new();
        args.insert("message".to_string(), serde_json::json!("hi"));
        fn command_with(args: std::collections::BTreeMap<String, serde_json::Value>) -> Command {
            Command {
                command_id: String::new(),
                kind: CommandType::PromptSession,
                idempotency_key: Some("abc-123".into()),
                target: CommandTarget { project: None, node_id: Some("n1".into()) },
                args,
                timeout: None,
            }
        }

        // First dispatch: reply arrives once the send is observed.
        let dispatcher_clone = dispatcher.clone();
        let first_args = args.clone();
        let first = tokio::spawn(async move { dispatcher_clone.dispatch_command(command_with(first_args)).await });
        let command_id = loop {
            if let Some((_, id)) = sent.lock().first() {
                break id.clone();
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        dispatcher.handle_command_result(CommandResult {
            command_id,
            status: CommandStatus::Success,
            output: Some("cached".into()),
            error: None,
            timestamp: Utc::now(),
        });
        let first_result = first.await.unwrap().unwrap();
        assert_eq!(first_result.status, CommandStatus::Success);
        assert_eq!(first_result.output.as_deref(), Some("cached"));
        assert_eq!(sent.lock().len(), 1);

        // Re-dispatch with the same idempotency key and canonical payload:
        // no second transport send, same output, regardless of command_id.
        let second_result = dispatcher.dispatch_command(command_with(args)).await.unwrap();
        assert_eq!(second_result.status, CommandStatus::Success);
        assert_eq!(second_result.output.as_deref(), Some("cached"));
        assert_eq!(sent.lock().len(), 1);
    }
}
