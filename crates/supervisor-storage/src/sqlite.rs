use crate::traits::{AuditEntry, CostBucket, DurableStore, LoadResult, RecoveryError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use supervisor_core::model::{
    AuthStates, CommandResult, CredentialSyncStatus, IdempotencyRecord, NodeEntry, NodeStatus,
    SessionStatus, TokenUsage, TrackedSession,
};
use supervisor_core::time::{parse_legacy_timestamp, to_rfc3339_nanos};
use supervisor_core::util::redact_secrets;
use supervisor_core::{Result, StateError};

const MIGRATIONS: &[&str] = &[include_str!("../migrations/0001_init.sql")];

/// Relational durable store backed by embedded SQLite: an ordinary
/// relational schema with a foreign key from sessions to their owning node.
/// One connection pool, WAL mode for concurrent readers alongside the
/// writer.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(data_dir: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = format!("{data_dir}/supervisor.sqlite3");
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(std::io::Error::other)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await
            .map_err(std::io::Error::other)?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn connect_in_memory() -> Self {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .unwrap();
        Self { pool }
    }
}

fn internal(e: sqlx::Error) -> StateError {
    StateError::Internal(e.to_string())
}

fn node_status_str(s: NodeStatus) -> &'static str {
    match s {
        NodeStatus::Online => "online",
        NodeStatus::Offline => "offline",
        NodeStatus::Degraded => "degraded",
    }
}

fn node_status_parse(s: &str) -> NodeStatus {
    match s {
        "online" => NodeStatus::Online,
        "degraded" => NodeStatus::Degraded,
        _ => NodeStatus::Offline,
    }
}

fn cred_sync_str(s: CredentialSyncStatus) -> &'static str {
    match s {
        CredentialSyncStatus::Unknown => "unknown",
        CredentialSyncStatus::InSync => "in_sync",
        CredentialSyncStatus::DriftDetected => "drift_detected",
    }
}

fn cred_sync_parse(s: &str) -> CredentialSyncStatus {
    match s {
        "in_sync" => CredentialSyncStatus::InSync,
        "drift_detected" => CredentialSyncStatus::DriftDetected,
        _ => CredentialSyncStatus::Unknown,
    }
}

fn session_status_str(s: SessionStatus) -> &'static str {
    match s {
        SessionStatus::Running => "running",
        SessionStatus::Idle => "idle",
        SessionStatus::Error => "error",
        SessionStatus::Unreachable => "unreachable",
    }
}

fn session_status_parse(s: &str) -> SessionStatus {
    match s {
        "running" => SessionStatus::Running,
        "idle" => SessionStatus::Idle,
        "error" => SessionStatus::Error,
        _ => SessionStatus::Unreachable,
    }
}

fn ts_opt(v: Option<DateTime<Utc>>) -> Option<String> {
    v.map(to_rfc3339_nanos)
}

fn parse_ts(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    parse_legacy_timestamp(raw).ok_or_else(|| format!("unparseable timestamp: {raw}"))
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn migrate(&self) -> Result<()> {
        for stmt in MIGRATIONS {
            for part in stmt.split(';') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                sqlx::query(part).execute(&self.pool).await.map_err(internal)?;
            }
        }
        Ok(())
    }

    async fn upsert_node(&self, node: &NodeEntry) -> Result<()> {
        let projects = serde_json::to_string(&node.projects).map_err(|e| StateError::Internal(e.to_string()))?;
        let capabilities = serde_json::to_string(&node.capabilities).map_err(|e| StateError::Internal(e.to_string()))?;
        let auth_states = serde_json::to_string(node.auth_states.inner()).map_err(|e| StateError::Internal(e.to_string()))?;
        sqlx::query(
            r#"INSERT INTO nodes
                (id, hostname, address, projects, capabilities, status, last_heartbeat,
                 connected_at, cred_version, cred_sync_status, auth_states, auth_updated_at)
               VALUES (?,?,?,?,?,?,?,?,?,?,?,?)
               ON CONFLICT(id) DO UPDATE SET
                 hostname=excluded.hostname, address=excluded.address,
                 projects=excluded.projects, capabilities=excluded.capabilities,
                 status=excluded.status, last_heartbeat=excluded.last_heartbeat,
                 connected_at=excluded.connected_at, cred_version=excluded.cred_version,
                 cred_sync_status=excluded.cred_sync_status, auth_states=excluded.auth_states,
                 auth_updated_at=excluded.auth_updated_at"#,
        )
        .bind(&node.id)
        .bind(&node.hostname)
        .bind(&node.address)
        .bind(projects)
        .bind(capabilities)
        .bind(node_status_str(node.status))
        .bind(ts_opt(node.last_heartbeat))
        .bind(ts_opt(node.connected_at))
        .bind(node.cred_version)
        .bind(cred_sync_str(node.cred_sync_status))
        .bind(auth_states)
        .bind(ts_opt(node.auth_updated_at))
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn load_nodes(&self) -> Result<LoadResult<NodeEntry>> {
        let rows = sqlx::query("SELECT * FROM nodes").fetch_all(&self.pool).await.map_err(internal)?;
        let mut out = LoadResult::default();
        for row in rows {
            let id: String = row.get("id");
            match parse_node_row(&row) {
                Ok(node) => out.rows.push(node),
                Err(cause) => out.errors.push(RecoveryError { table: "nodes", id, cause }),
            }
        }
        Ok(out)
    }

    async fn upsert_session(&self, session: &TrackedSession) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO sessions
                (session_id, node_id, project, status, prompt_tokens, completion_tokens,
                 total_tokens, compaction_count, current_task, last_activity, session_cost,
                 model, started_at)
               VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?)
               ON CONFLICT(session_id) DO UPDATE SET
                 node_id=excluded.node_id, project=excluded.project, status=excluded.status,
                 prompt_tokens=excluded.prompt_tokens, completion_tokens=excluded.completion_tokens,
                 total_tokens=excluded.total_tokens, compaction_count=excluded.compaction_count,
                 current_task=excluded.current_task, last_activity=excluded.last_activity,
                 session_cost=excluded.session_cost, model=excluded.model,
                 started_at=excluded.started_at"#,
        )
        .bind(&session.session_id)
        .bind(&session.node_id)
        .bind(&session.project)
        .bind(session_status_str(session.status))
        .bind(session.token_usage.prompt)
        .bind(session.token_usage.completion)
        .bind(session.token_usage.total)
        .bind(session.compaction_count)
        .bind(&session.current_task)
        .bind(ts_opt(session.last_activity))
        .bind(session.session_cost)
        .bind(&session.model)
        .bind(ts_opt(session.started_at))
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn load_sessions(&self) -> Result<LoadResult<TrackedSession>> {
        let rows = sqlx::query("SELECT * FROM sessions").fetch_all(&self.pool).await.map_err(internal)?;
        Ok(collect_sessions(rows))
    }

    async fn load_sessions_for_node(&self, node_id: &str) -> Result<LoadResult<TrackedSession>> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE node_id = ?")
            .bind(node_id)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        Ok(collect_sessions(rows))
    }

    async fn insert_event(
        &self,
        id: &str,
        session_id: &str,
        agent_id: &str,
        kind: &str,
        data: &[u8],
        timestamp: DateTime<Utc>,
        seq: u64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO events (id, session_id, agent_id, type, data, timestamp, seq) VALUES (?,?,?,?,?,?,?)",
        )
        .bind(id)
        .bind(session_id)
        .bind(agent_id)
        .bind(kind)
        .bind(data)
        .bind(to_rfc3339_nanos(timestamp))
        .bind(seq as i64)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn upsert_cost_bucket(&self, bucket: &CostBucket) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO costs (id, provider, model, date, amount_usd) VALUES (?,?,?,?,?)
               ON CONFLICT(id) DO UPDATE SET amount_usd=excluded.amount_usd"#,
        )
        .bind(&bucket.id)
        .bind(&bucket.provider)
        .bind(&bucket.model)
        .bind(&bucket.date)
        .bind(bucket.amount_usd)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn idempotency_lookup(&self, key_hash: &str) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query("SELECT * FROM command_idempotency WHERE key_hash = ?")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        let Some(row) = row else { return Ok(None) };
        let result_json: String = row.get("result_json");
        let result: CommandResult =
            serde_json::from_str(&result_json).map_err(|e| StateError::Internal(e.to_string()))?;
        let expires_at_raw: String = row.get("expires_at");
        let expires_at = parse_ts(&expires_at_raw).map_err(StateError::Internal)?;
        Ok(Some(IdempotencyRecord {
            key_hash: key_hash.to_string(),
            command_id: row.get("command_id"),
            result,
            expires_at,
        }))
    }

    async fn idempotency_commit(
        &self,
        key_hash: &str,
        command_id: &str,
        result: &CommandResult,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let result_json = serde_json::to_string(result).map_err(|e| StateError::Internal(e.to_string()))?;
        sqlx::query(
            r#"INSERT INTO command_idempotency (key_hash, command_id, result_json, expires_at)
               VALUES (?,?,?,?)
               ON CONFLICT(key_hash) DO UPDATE SET
                 command_id=excluded.command_id, result_json=excluded.result_json,
                 expires_at=excluded.expires_at"#,
        )
        .bind(key_hash)
        .bind(command_id)
        .bind(result_json)
        .bind(to_rfc3339_nanos(expires_at))
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn idempotency_purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("DELETE FROM command_idempotency WHERE expires_at < ?")
            .bind(to_rfc3339_nanos(now))
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(res.rows_affected())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let redacted = redact_secrets(entry.detail.clone());
        let detail = serde_json::to_string(&redacted).map_err(|e| StateError::Internal(e.to_string()))?;
        sqlx::query("INSERT INTO audit_log (timestamp, actor, action, detail) VALUES (?,?,?,?)")
            .bind(to_rfc3339_nanos(entry.timestamp))
            .bind(&entry.actor)
            .bind(&entry.action)
            .bind(detail)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }
}

fn parse_node_row(row: &sqlx::sqlite::SqliteRow) -> std::result::Result<NodeEntry, String> {
    let projects_raw: String = row.get("projects");
    let capabilities_raw: String = row.get("capabilities");
    let auth_states_raw: String = row.get("auth_states");
    let status_raw: String = row.get("status");
    let cred_sync_raw: String = row.get("cred_sync_status");
    let last_heartbeat_raw: Option<String> = row.get("last_heartbeat");
    let connected_at_raw: Option<String> = row.get("connected_at");
    let auth_updated_at_raw: Option<String> = row.get("auth_updated_at");

    let projects: Vec<String> = serde_json::from_str(&projects_raw).map_err(|e| e.to_string())?;
    let capabilities: Vec<String> =
        serde_json::from_str(&capabilities_raw).map_err(|e| e.to_string())?;
    let auth_states_map = serde_json::from_str(&auth_states_raw).map_err(|e| e.to_string())?;
    let auth_states = AuthStates::try_from_map(auth_states_map).map_err(|e| e.to_string())?;

    Ok(NodeEntry {
        id: row.get("id"),
        hostname: row.get("hostname"),
        address: row.get("address"),
        projects,
        capabilities,
        status: node_status_parse(&status_raw),
        last_heartbeat: last_heartbeat_raw.map(|s| parse_ts(&s)).transpose()?,
        connected_at: connected_at_raw.map(|s| parse_ts(&s)).transpose()?,
        cred_version: row.get("cred_version"),
        cred_sync_status: cred_sync_parse(&cred_sync_raw),
        auth_states,
        auth_updated_at: auth_updated_at_raw.map(|s| parse_ts(&s)).transpose()?,
    })
}

fn collect_sessions(rows: Vec<sqlx::sqlite::SqliteRow>) -> LoadResult<TrackedSession> {
    let mut out = LoadResult::default();
    for row in rows {
        let id: String = row.get("session_id");
        match parse_session_row(&row) {
            Ok(s) => out.rows.push(s),
            Err(cause) => out.errors.push(RecoveryError { table: "sessions", id, cause }),
        }
    }
    out
}

fn parse_session_row(row: &sqlx::sqlite::SqliteRow) -> std::result::Result<TrackedSession, String> {
    let status_raw: String = row.get("status");
    let last_activity_raw: Option<String> = row.get("last_activity");
    let started_at_raw: Option<String> = row.get("started_at");
    Ok(TrackedSession {
        session_id: row.get("session_id"),
        node_id: row.get("node_id"),
        project: row.get("project"),
        status: session_status_parse(&status_raw),
        token_usage: TokenUsage {
            prompt: row.get("prompt_tokens"),
            completion: row.get("completion_tokens"),
            total: row.get("total_tokens"),
        },
        compaction_count: row.get("compaction_count"),
        current_task: row.get("current_task"),
        last_activity: last_activity_raw.map(|s| parse_ts(&s)).transpose()?,
        session_cost: row.get("session_cost"),
        model: row.get("model"),
        started_at: started_at_raw.map(|s| parse_ts(&s)).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use supervisor_core::model::{CommandStatus, NodeEntry};

    async fn store() -> SqliteStore {
        let s = SqliteStore::connect_in_memory().await;
        s.migrate().await.unwrap();
        s
    }

    #[tokio::test]
    async fn round_trips_a_node() {
        let s = store().await;
        let node = NodeEntry::new_registering(
            "n1".into(),
            "host-1".into(),
            None,
            vec!["proj-a".into()],
            vec!["tool-x".into()],
        );
        s.upsert_node(&node).await.unwrap();
        let loaded = s.load_nodes().await.unwrap();
        assert_eq!(loaded.rows.len(), 1);
        assert!(loaded.errors.is_empty());
        assert_eq!(loaded.rows[0].id, "n1");
        assert_eq!(loaded.rows[0].hostname, "host-1");
    }

    #[tokio::test]
    async fn idempotency_round_trip() {
        let s = store().await;
        let result = CommandResult {
            command_id: "c1".into(),
            status: CommandStatus::Success,
            output: Some("ok".into()),
            error: None,
            timestamp: Utc::now(),
        };
        s.idempotency_commit("hash1", "c1", &result, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        let fetched = s.idempotency_lookup("hash1").await.unwrap().unwrap();
        assert_eq!(fetched.command_id, "c1");
        assert_eq!(fetched.result.output.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn session_foreign_key_requires_node() {
        let s = store().await;
        let node = NodeEntry::new_registering("n1".into(), "h".into(), None, vec![], vec![]);
        s.upsert_node(&node).await.unwrap();
        let session = TrackedSession {
            session_id: "s1".into(),
            node_id: "n1".into(),
            project: "proj-a".into(),
            status: SessionStatus::Running,
            token_usage: TokenUsage::default(),
            compaction_count: 0,
            current_task: None,
            last_activity: None,
            session_cost: 0.0,
            model: None,
            started_at: None,
        };
        s.upsert_session(&session).await.unwrap();
        let loaded = s.load_sessions_for_node("n1").await.unwrap();
        assert_eq!(loaded.rows.len(), 1);
    }
}
