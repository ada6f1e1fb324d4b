use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use supervisor_core::model::{SessionStatus, SessionUpdate, TrackedSession};
use supervisor_core::{Result, StateError};
use supervisor_storage::DurableStore;
use tracing::warn;

/// Authoritative in-memory map of session id → TrackedSession. Mirrors
/// `NodeRegistry`'s pattern: an RwLock-guarded map, the durable store
/// mutated after the in-memory update succeeds.
pub struct SessionTracker {
    sessions: RwLock<BTreeMap<String, TrackedSession>>,
    store: Arc<dyn DurableStore>,
}

impl SessionTracker {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            store,
        }
    }

    pub fn get(&self, id: &str) -> Option<TrackedSession> {
        self.sessions.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<TrackedSession> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn create(&self, session: TrackedSession) {
        self.sessions
            .write()
            .insert(session.session_id.clone(), session);
    }

    /// Applies a typed, partial update. A fully-`None` update is a no-op,
    /// not an error.
    pub async fn update_session(&self, id: &str, update: SessionUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let entry = {
            let mut sessions = self.sessions.write();
            let s = sessions
                .get_mut(id)
                .ok_or_else(|| StateError::not_found(format!("session {id}")))?;
            if let Some(v) = update.node_id {
                s.node_id = v;
            }
            if let Some(v) = update.project {
                s.project = v;
            }
            if let Some(v) = update.status {
                s.status = v;
            }
            if let Some(v) = update.token_usage {
                if v.total != v.prompt + v.completion {
                    warn!(
                        session_id = id,
                        prompt = v.prompt,
                        completion = v.completion,
                        total = v.total,
                        "reported token total does not equal prompt+completion; keeping reported total"
                    );
                }
                s.token_usage = v;
            }
            if let Some(v) = update.session_cost {
                s.session_cost = v;
            }
            if let Some(v) = update.last_activity {
                s.last_activity = Some(v);
            }
            if let Some(v) = update.current_task {
                s.current_task = Some(v);
            }
            if let Some(v) = update.model {
                s.model = Some(v);
            }
            if let Some(v) = update.compaction_count {
                s.compaction_count = v;
            }
            if let Some(v) = update.started_at {
                s.started_at = Some(v);
            }
            s.clone()
        };
        self.store.upsert_session(&entry).await
    }

    /// Translates `session.running`/`session.idle`/`session.error` events
    /// into a status update plus `last_activity = now`.
    pub async fn apply_event(&self, event_type: &str, session_id: &str) -> Result<()> {
        let status = match event_type {
            "session.running" => SessionStatus::Running,
            "session.idle" => SessionStatus::Idle,
            "session.error" => SessionStatus::Error,
            _ => return Ok(()),
        };
        self.update_session(
            session_id,
            SessionUpdate {
                status: Some(status),
                last_activity: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
    }

    /// Bulk-updates all sessions belonging to `node_id` to `unreachable`:
    /// a node going offline implies all its sessions are unreachable too.
    pub async fn mark_unreachable(&self, node_id: &str) -> Result<()> {
        let affected: Vec<TrackedSession> = {
            let mut sessions = self.sessions.write();
            let mut changed = Vec::new();
            for s in sessions.values_mut() {
                if s.node_id == node_id && s.status != SessionStatus::Unreachable {
                    s.status = SessionStatus::Unreachable;
                    changed.push(s.clone());
                }
            }
            changed
        };
        for s in &affected {
            self.store.upsert_session(s).await?;
        }
        Ok(())
    }

    /// Rehydrates sessions in bulk on reconnect, from a snapshot the agent
    /// includes in its registration payload.
    pub async fn restore_from_snapshot(
        &self,
        node_id: &str,
        sessions: Vec<TrackedSession>,
    ) -> Result<()> {
        for mut s in sessions {
            s.node_id = node_id.to_string();
            self.store.upsert_session(&s).await?;
            self.sessions.write().insert(s.session_id.clone(), s);
        }
        Ok(())
    }

    pub async fn load_from_db(&self) -> Result<usize> {
        let loaded = self.store.load_sessions().await?;
        for err in &loaded.errors {
            warn!(table = err.table, id = %err.id, cause = %err.cause, "skipping corrupted session row");
        }
        let mut sessions = self.sessions.write();
        sessions.clear();
        let count = loaded.rows.len();
        for mut s in loaded.rows {
            s.status = SessionStatus::Unreachable;
            sessions.insert(s.session_id.clone(), s);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use supervisor_core::model::TokenUsage;
    use supervisor_storage::SqliteStore;

    async fn test_store() -> Arc<dyn DurableStore> {
        let s = SqliteStore::connect_in_memory().await;
        s.migrate().await.unwrap();
        Arc::new(s)
    }

    fn session(id: &str, node_id: &str) -> TrackedSession {
        TrackedSession {
            session_id: id.into(),
            node_id: node_id.into(),
            project: "proj".into(),
            status: SessionStatus::Running,
            token_usage: TokenUsage::default(),
            compaction_count: 0,
            current_task: None,
            last_activity: None,
            session_cost: 0.0,
            model: None,
            started_at: None,
        }
    }

    #[tokio::test]
    async fn mark_unreachable_affects_only_owning_node() {
        let store = test_store().await;
        use supervisor_core::model::NodeEntry;
        let n1 = NodeEntry::new_registering("n1".into(), "h".into(), None, vec![], vec![]);
        let n2 = NodeEntry::new_registering("n2".into(), "h".into(), None, vec![], vec![]);
        store.upsert_node(&n1).await.unwrap();
        store.upsert_node(&n2).await.unwrap();

        let tracker = SessionTracker::new(store);
        tracker.create(session("s1", "n1"));
        tracker.create(session("s2", "n2"));
        tracker.update_session("s1", SessionUpdate::default()).await.unwrap();
        tracker.mark_unreachable("n1").await.unwrap();
        assert_eq!(tracker.get("s1").unwrap().status, SessionStatus::Unreachable);
        assert_eq!(tracker.get("s2").unwrap().status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn update_ignores_unknown_fields_by_construction() {
        let store = test_store().await;
        use supervisor_core::model::NodeEntry;
        let n1 = NodeEntry::new_registering("n1".into(), "h".into(), None, vec![], vec![]);
        store.upsert_node(&n1).await.unwrap();
        let tracker = SessionTracker::new(store);
        tracker.create(session("s1", "n1"));
        tracker
            .update_session(
                "s1",
                SessionUpdate {
                    current_task: Some("refactor".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(tracker.get("s1").unwrap().current_task.as_deref(), Some("refactor"));
        assert_eq!(tracker.get("s1").unwrap().status, SessionStatus::Running);
    }
}
