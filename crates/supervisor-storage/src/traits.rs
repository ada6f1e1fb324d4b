use async_trait::async_trait;
use chrono::{DateTime, Utc};
use supervisor_core::{CommandResult, IdempotencyRecord, NodeEntry, Result, TrackedSession};

/// A row that failed to deserialize during a bulk recovery scan. The store
/// returns these alongside the rows that parsed fine rather than aborting
/// the whole scan on one bad row.
pub use supervisor_core::errors::RecoveryError;

#[derive(Debug, Default)]
pub struct LoadResult<T> {
    pub rows: Vec<T>,
    pub errors: Vec<RecoveryError>,
}

#[derive(Debug, Clone)]
pub struct CostBucket {
    pub id: String, // provider|model|date
    pub provider: String,
    pub model: String,
    pub date: String,
    pub amount_usd: f64,
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub actor: Option<String>,
    pub action: String,
    pub detail: serde_json::Value,
}

/// The durable persistence boundary. Exposes only schema migration,
/// per-entity upserts, and the filtered queries recovery and the (external)
/// admin surface need — no generic query language, no transactions exposed
/// to callers beyond what a single call needs.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Idempotent schema upgrade; safe to call on every startup.
    async fn migrate(&self) -> Result<()>;

    async fn upsert_node(&self, node: &NodeEntry) -> Result<()>;
    async fn load_nodes(&self) -> Result<LoadResult<NodeEntry>>;

    async fn upsert_session(&self, session: &TrackedSession) -> Result<()>;
    async fn load_sessions(&self) -> Result<LoadResult<TrackedSession>>;
    async fn load_sessions_for_node(&self, node_id: &str) -> Result<LoadResult<TrackedSession>>;

    async fn insert_event(
        &self,
        id: &str,
        session_id: &str,
        agent_id: &str,
        kind: &str,
        data: &[u8],
        timestamp: DateTime<Utc>,
        seq: u64,
    ) -> Result<()>;

    async fn upsert_cost_bucket(&self, bucket: &CostBucket) -> Result<()>;

    async fn idempotency_lookup(&self, key_hash: &str) -> Result<Option<IdempotencyRecord>>;
    async fn idempotency_commit(
        &self,
        key_hash: &str,
        command_id: &str,
        result: &CommandResult,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn idempotency_purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;
}
