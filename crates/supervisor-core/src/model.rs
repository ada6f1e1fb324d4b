use crate::errors::{Result, StateError};
use crate::util::is_forbidden_field_name;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

pub type NodeId = String;
pub type SessionId = String;

/// The wire unit on the agent channel. `payload` is left as raw JSON here;
/// each envelope type's payload shape is validated when it is dispatched to
/// its owning component, not at decode time — a malformed `event` payload
/// should not prevent a `heartbeat` on the same connection from being read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub request_id: String,
    pub timestamp: i64,
    pub payload: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Register,
    Heartbeat,
    CredentialSync,
    AuthState,
    Event,
    Command,
    CommandResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Offline,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSyncStatus {
    Unknown,
    InSync,
    DriftDetected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolAuthState {
    pub tool: String,
    pub status: String,
    pub reason: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// A validated `auth_states` map. Construction is the enforcement point for
/// the "no secret-shaped field names" rule — callers cannot build one
/// holding a forbidden key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthStates(BTreeMap<String, ToolAuthState>);

impl AuthStates {
    pub fn try_from_map(map: BTreeMap<String, ToolAuthState>) -> Result<Self> {
        for key in map.keys() {
            if is_forbidden_field_name(key) {
                return Err(StateError::validation(format!(
                    "auth_states key '{key}' looks like a secret field name"
                )));
            }
        }
        Ok(Self(map))
    }

    pub fn into_inner(self) -> BTreeMap<String, ToolAuthState> {
        self.0
    }

    pub fn inner(&self) -> &BTreeMap<String, ToolAuthState> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The supervisor's record of an agent; one-to-one with agent identity.
/// Invariant: `status == Online` iff there is an active Hub connection
/// whose `agent_id == id` — the Hub is the only writer of that transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: NodeId,
    pub hostname: String,
    pub address: Option<String>,
    pub projects: Vec<String>,
    pub capabilities: Vec<String>,
    pub status: NodeStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub cred_version: i64,
    pub cred_sync_status: CredentialSyncStatus,
    pub auth_states: AuthStates,
    pub auth_updated_at: Option<DateTime<Utc>>,
}

impl NodeEntry {
    pub fn new_registering(
        id: NodeId,
        hostname: String,
        address: Option<String>,
        projects: Vec<String>,
        capabilities: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            hostname,
            address,
            projects,
            capabilities,
            status: NodeStatus::Online,
            last_heartbeat: Some(now),
            connected_at: Some(now),
            cred_version: 0,
            cred_sync_status: CredentialSyncStatus::Unknown,
            auth_states: AuthStates::default(),
            auth_updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Idle,
    Error,
    Unreachable,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: i64,
    pub completion: i64,
    pub total: i64,
}

/// A single long-lived tool instance on an agent; owns its own token
/// counters and cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedSession {
    pub session_id: SessionId,
    pub node_id: NodeId,
    pub project: String,
    pub status: SessionStatus,
    pub token_usage: TokenUsage,
    pub compaction_count: i64,
    pub current_task: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub session_cost: f64,
    pub model: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Typed update record for `SessionTracker::update_session` — a closed set
/// of named optional fields, favored over a dynamic map-of-any for the same
/// semantics without the portability hazard of an untyped map.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub node_id: Option<NodeId>,
    pub project: Option<String>,
    pub status: Option<SessionStatus>,
    pub token_usage: Option<TokenUsage>,
    pub session_cost: Option<f64>,
    pub last_activity: Option<DateTime<Utc>>,
    pub current_task: Option<String>,
    pub model: Option<String>,
    pub compaction_count: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
}

impl SessionUpdate {
    pub fn is_empty(&self) -> bool {
        self.node_id.is_none()
            && self.project.is_none()
            && self.status.is_none()
            && self.token_usage.is_none()
            && self.session_cost.is_none()
            && self.last_activity.is_none()
            && self.current_task.is_none()
            && self.model.is_none()
            && self.compaction_count.is_none()
            && self.started_at.is_none()
    }
}

/// `{id, session_id, type, data, timestamp, seq}` as declared on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub session_id: SessionId,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: JsonValue,
    pub timestamp: DateTime<Utc>,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    CreateSession,
    PromptSession,
    KillSession,
    RestartSession,
    SessionStatus,
    Handover,
    CredentialPush,
    OauthTrigger,
    EnvCheck,
    EnvProvision,
    AgentmdDiff,
    AgentmdSync,
}

impl CommandType {
    /// Accepts both canonical names and the short operator aliases
    /// (`start`, `/start` → `create_session`, etc.).
    pub fn normalize(raw: &str) -> Option<Self> {
        let canon = raw.trim().trim_start_matches('/').to_lowercase();
        let canon = canon.replace('-', "_");
        match canon.as_str() {
            "create_session" | "start" => Some(Self::CreateSession),
            "prompt_session" | "prompt" => Some(Self::PromptSession),
            "kill_session" | "kill" | "stop" => Some(Self::KillSession),
            "restart_session" | "restart" => Some(Self::RestartSession),
            "session_status" | "status" => Some(Self::SessionStatus),
            "handover" => Some(Self::Handover),
            "credential_push" | "push_credentials" => Some(Self::CredentialPush),
            "oauth_trigger" | "oauth" => Some(Self::OauthTrigger),
            "env_check" => Some(Self::EnvCheck),
            "env_provision" => Some(Self::EnvProvision),
            "agentmd_diff" => Some(Self::AgentmdDiff),
            "agentmd_sync" => Some(Self::AgentmdSync),
            _ => None,
        }
    }

    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::CreateSession => "create_session",
            Self::PromptSession => "prompt_session",
            Self::KillSession => "kill_session",
            Self::RestartSession => "restart_session",
            Self::SessionStatus => "session_status",
            Self::Handover => "handover",
            Self::CredentialPush => "credential_push",
            Self::OauthTrigger => "oauth_trigger",
            Self::EnvCheck => "env_check",
            Self::EnvProvision => "env_provision",
            Self::AgentmdDiff => "agentmd_diff",
            Self::AgentmdSync => "agentmd_sync",
        }
    }

    pub fn default_timeout(&self) -> std::time::Duration {
        match self {
            Self::Handover => std::time::Duration::from_secs(60),
            _ => std::time::Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandTarget {
    pub project: Option<String>,
    pub node_id: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct Command {
    pub command_id: String,
    pub kind: CommandType,
    pub idempotency_key: Option<String>,
    pub target: CommandTarget,
    pub args: BTreeMap<String, JsonValue>,
    pub timeout: Option<std::time::Duration>,
}

impl Command {
    pub fn effective_timeout(&self) -> std::time::Duration {
        self.timeout.unwrap_or_else(|| self.kind.default_timeout())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    Failure,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub status: CommandStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CommandResult {
    pub fn failure(command_id: String, error: impl Into<String>) -> Self {
        Self {
            command_id,
            status: CommandStatus::Failure,
            output: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn timeout(command_id: String, error: impl Into<String>) -> Self {
        Self {
            command_id,
            status: CommandStatus::Timeout,
            output: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Durable record backing idempotent command dispatch. `key_hash` is
/// SHA-256 over `idempotency_key || ':' || canonical payload`; see
/// `supervisor_core::util`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key_hash: String,
    pub command_id: String,
    pub result: CommandResult,
    pub expires_at: DateTime<Utc>,
}

pub const IDEMPOTENCY_TTL: chrono::Duration = chrono::Duration::hours(24);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_aliases() {
        assert_eq!(
            CommandType::normalize("/start"),
            Some(CommandType::CreateSession)
        );
        assert_eq!(
            CommandType::normalize("Kill"),
            Some(CommandType::KillSession)
        );
        assert_eq!(CommandType::normalize("not_a_command"), None);
    }

    #[test]
    fn auth_states_rejects_secret_field() {
        let mut map = BTreeMap::new();
        map.insert(
            "github_api_key".to_string(),
            ToolAuthState {
                tool: "github".into(),
                status: "ok".into(),
                reason: None,
                checked_at: Utc::now(),
            },
        );
        assert!(AuthStates::try_from_map(map).is_err());
    }

    #[test]
    fn auth_states_accepts_clean_field() {
        let mut map = BTreeMap::new();
        map.insert(
            "github".to_string(),
            ToolAuthState {
                tool: "github".into(),
                status: "ok".into(),
                reason: None,
                checked_at: Utc::now(),
            },
        );
        assert!(AuthStates::try_from_map(map).is_ok());
    }

    #[test]
    fn default_timeouts_match_spec() {
        assert_eq!(
            CommandType::Handover.default_timeout(),
            std::time::Duration::from_secs(60)
        );
        assert_eq!(
            CommandType::SessionStatus.default_timeout(),
            std::time::Duration::from_secs(30)
        );
    }
}
