use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use supervisor_core::model::{AuthStates, CredentialSyncStatus, NodeEntry, NodeStatus, ToolAuthState};
use supervisor_core::{Result, StateError};
use supervisor_storage::DurableStore;
use tracing::{info, warn};

/// Authoritative in-memory map of node id → NodeEntry. The durable store is
/// the recovery baseline only; while the process is running this map is the
/// source of truth, and the two are never required to agree instant-by-instant.
pub struct NodeRegistry {
    nodes: RwLock<BTreeMap<String, NodeEntry>>,
    store: Arc<dyn DurableStore>,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            store,
        }
    }

    /// Creates the node if unseen, otherwise transitions it to online and
    /// refreshes declared projects/capabilities. Sets `last_heartbeat = now`.
    pub async fn register(
        &self,
        id: &str,
        hostname: String,
        address: Option<String>,
        projects: Vec<String>,
        capabilities: Vec<String>,
    ) -> Result<NodeEntry> {
        let now = Utc::now();
        let entry = {
            let mut nodes = self.nodes.write();
            let entry = nodes.entry(id.to_string()).or_insert_with(|| {
                NodeEntry::new_registering(
                    id.to_string(),
                    hostname.clone(),
                    address.clone(),
                    projects.clone(),
                    capabilities.clone(),
                )
            });
            entry.hostname = hostname;
            entry.address = address;
            entry.projects = projects;
            entry.capabilities = capabilities;
            entry.status = NodeStatus::Online;
            entry.last_heartbeat = Some(now);
            entry.connected_at = Some(now);
            entry.clone()
        };
        self.store.upsert_node(&entry).await?;
        info!(node_id = %id, "node registered online");
        Ok(entry)
    }

    /// Flips the node offline; all other fields are preserved.
    pub async fn mark_offline(&self, id: &str) -> Result<()> {
        let entry = {
            let mut nodes = self.nodes.write();
            match nodes.get_mut(id) {
                Some(n) => {
                    n.status = NodeStatus::Offline;
                    Some(n.clone())
                }
                None => None,
            }
        };
        if let Some(entry) = entry {
            self.store.upsert_node(&entry).await?;
            info!(node_id = %id, "node marked offline");
        }
        Ok(())
    }

    pub fn touch_heartbeat(&self, id: &str) {
        if let Some(n) = self.nodes.write().get_mut(id) {
            n.last_heartbeat = Some(Utc::now());
        }
    }

    pub fn get(&self, id: &str) -> Option<NodeEntry> {
        self.nodes.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<NodeEntry> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn is_online(&self, id: &str) -> bool {
        matches!(self.get(id), Some(n) if n.status == NodeStatus::Online)
    }

    /// Replaces per-tool auth states wholesale; rejects schema-violating
    /// field names at build time (enforced by `AuthStates::try_from_map`
    /// before this is ever called).
    pub async fn update_auth_state(
        &self,
        id: &str,
        states: Vec<ToolAuthState>,
    ) -> Result<()> {
        let mut map = std::collections::BTreeMap::new();
        for s in states {
            map.insert(s.tool.clone(), s);
        }
        let auth_states = AuthStates::try_from_map(map)?;
        let entry = {
            let mut nodes = self.nodes.write();
            let n = nodes
                .get_mut(id)
                .ok_or_else(|| StateError::not_found(format!("node {id}")))?;
            n.auth_states = auth_states;
            n.auth_updated_at = Some(Utc::now());
            n.clone()
        };
        self.store.upsert_node(&entry).await
    }

    /// Reconciliation rule: `in_sync` iff `reported == expected`;
    /// `drift_detected` otherwise.
    pub async fn reconcile_credential_version(
        &self,
        id: &str,
        reported: i64,
        expected: i64,
    ) -> Result<CredentialSyncStatus> {
        let status = if reported == expected {
            CredentialSyncStatus::InSync
        } else {
            CredentialSyncStatus::DriftDetected
        };
        let entry = {
            let mut nodes = self.nodes.write();
            let n = nodes
                .get_mut(id)
                .ok_or_else(|| StateError::not_found(format!("node {id}")))?;
            n.cred_version = reported;
            n.cred_sync_status = status;
            n.clone()
        };
        self.store.upsert_node(&entry).await?;
        if status == CredentialSyncStatus::DriftDetected {
            warn!(node_id = %id, reported, expected, "credential drift detected");
        }
        Ok(status)
    }

    /// Recovery: load every persisted node with status forced to offline
    /// regardless of stored status.
    pub async fn load_from_db(&self) -> Result<usize> {
        let loaded = self.store.load_nodes().await?;
        for err in &loaded.errors {
            warn!(table = err.table, id = %err.id, cause = %err.cause, "skipping corrupted node row");
        }
        let mut nodes = self.nodes.write();
        nodes.clear();
        let count = loaded.rows.len();
        for mut n in loaded.rows {
            n.status = NodeStatus::Offline;
            nodes.insert(n.id.clone(), n);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use supervisor_storage::SqliteStore;

    async fn test_store() -> Arc<dyn DurableStore> {
        let s = SqliteStore::connect_in_memory().await;
        s.migrate().await.unwrap();
        Arc::new(s)
    }

    #[tokio::test]
    async fn register_then_offline_then_register_preserves_identity() {
        let reg = NodeRegistry::new(test_store().await);
        reg.register("n1", "host-a".into(), None, vec!["p".into()], vec![])
            .await
            .unwrap();
        reg.mark_offline("n1").await.unwrap();
        assert_eq!(reg.get("n1").unwrap().status, NodeStatus::Offline);
        let again = reg
            .register("n1", "host-a".into(), None, vec!["p".into()], vec![])
            .await
            .unwrap();
        assert_eq!(again.id, "n1");
        assert_eq!(again.hostname, "host-a");
        assert_eq!(again.status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn reconcile_detects_drift() {
        let reg = NodeRegistry::new(test_store().await);
        reg.register("n1", "h".into(), None, vec![], vec![]).await.unwrap();
        let s1 = reg.reconcile_credential_version("n1", 1, 2).await.unwrap();
        assert_eq!(s1, CredentialSyncStatus::DriftDetected);
        let s2 = reg.reconcile_credential_version("n1", 2, 2).await.unwrap();
        assert_eq!(s2, CredentialSyncStatus::InSync);
    }

    #[tokio::test]
    async fn load_from_db_forces_offline() {
        let store = test_store().await;
        let reg = NodeRegistry::new(store.clone());
        reg.register("n1", "h".into(), None, vec![], vec![]).await.unwrap();
        assert_eq!(reg.get("n1").unwrap().status, NodeStatus::Online);

        let reg2 = NodeRegistry::new(store);
        let n = reg2.load_from_db().await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(reg2.get("n1").unwrap().status, NodeStatus::Offline);
    }
}
