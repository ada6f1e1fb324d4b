use crate::dispatcher::CommandDispatcher;
use crate::pipeline::{EventPipeline, ReplayRequester};
use crate::registry::NodeRegistry;
use crate::tracker::SessionTracker;
use crate::transport::Transport;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use supervisor_core::model::{Command, CommandResult, Envelope, EnvelopeType, Event, ToolAuthState, TrackedSession};
use supervisor_core::{StateError, SupervisorConfig};
use tokio::sync::mpsc;
use tracing::{info, warn};

struct AgentConn {
    send_tx: mpsc::Sender<Message>,
    last_heartbeat: Mutex<Instant>,
}

/// Single cooperative coordination point for all agent connections. The
/// client map is the only piece of shared mutable state; everything else
/// (registry, tracker, pipeline, dispatcher) is reached through references
/// the Hub holds, never the other way around except through the small
/// `Transport`/`ReplayRequester` traits, which break what would otherwise
/// be a construction-order cycle between the Hub and the Dispatcher/Pipeline.
pub struct ConnectionHub {
    clients: RwLock<HashMap<String, AgentConn>>,
    auth_token: RwLock<String>,
    origin_allow_list: Vec<String>,
    strict_origin: bool,
    config: SupervisorConfig,
    registry: Arc<NodeRegistry>,
    tracker: Arc<SessionTracker>,
    pipeline: OnceCell<Arc<EventPipeline>>,
    dispatcher: OnceCell<Arc<CommandDispatcher>>,
    hub_seq: Mutex<HashMap<String, u64>>,
}

impl ConnectionHub {
    pub fn new(
        config: SupervisorConfig,
        registry: Arc<NodeRegistry>,
        tracker: Arc<SessionTracker>,
        strict_origin: bool,
    ) -> Arc<Self> {
        let auth_token = config.auth_token.clone();
        let origin_allow_list = config.origin_allow_list.clone();
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            auth_token: RwLock::new(auth_token),
            origin_allow_list,
            strict_origin,
            config,
            registry,
            tracker,
            pipeline: OnceCell::new(),
            dispatcher: OnceCell::new(),
            hub_seq: Mutex::new(HashMap::new()),
        })
    }

    /// Completes the cyclic wiring: called once from the binary's startup
    /// code after both components exist.
    pub fn set_pipeline(&self, pipeline: Arc<EventPipeline>) {
        let _ = self.pipeline.set(pipeline);
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<CommandDispatcher>) {
        let _ = self.dispatcher.set(dispatcher);
    }

    fn check_token(&self, token: &str) -> bool {
        let current = self.auth_token.read();
        !current.is_empty() && *current == token
    }

    fn check_origin(&self, origin: Option<&str>) -> bool {
        match origin {
            None => !self.strict_origin,
            Some(o) => {
                if self.origin_allow_list.is_empty() && !self.strict_origin {
                    return true;
                }
                self.origin_allow_list.iter().any(|pattern| origin_matches(pattern, o))
            }
        }
    }

    /// Supplants any prior connection under the same id: the old send
    /// channel is simply overwritten and dropped, which unblocks its write
    /// task on its next send attempt.
    fn register_connection(&self, agent_id: String, send_tx: mpsc::Sender<Message>) {
        let mut clients = self.clients.write();
        clients.insert(
            agent_id,
            AgentConn { send_tx, last_heartbeat: Mutex::new(Instant::now()) },
        );
    }

    /// Removes the client entry, returning whether one was actually present.
    /// Callers use the return value to tell whether they are the path that
    /// owns this connection's offline transition (the heartbeat sweeper
    /// already unregisters before tearing the socket down, so the read
    /// task's own teardown must not re-emit `node.offline` for the same
    /// disconnect).
    fn unregister_connection(&self, agent_id: &str) -> bool {
        self.clients.write().remove(agent_id).is_some()
    }

    fn touch(&self, agent_id: &str) {
        if let Some(conn) = self.clients.read().get(agent_id) {
            *conn.last_heartbeat.lock() = Instant::now();
        }
    }

    /// Every `heartbeat_interval`, scan all clients and close any whose
    /// `now - last_heartbeat > heartbeat_interval * heartbeat_timeout_count`.
    pub fn spawn_heartbeat_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.config.heartbeat_interval);
            loop {
                ticker.tick().await;
                hub.sweep_once();
            }
        })
    }

    fn sweep_once(self: &Arc<Self>) {
        let bound = self.config.heartbeat_interval * self.config.heartbeat_timeout_count;
        let stale: Vec<String> = {
            let clients = self.clients.read();
            clients
                .iter()
                .filter(|(_, c)| c.last_heartbeat.lock().elapsed() > bound)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in stale {
            warn!(node_id = %id, "heartbeat timeout, closing connection");
            self.unregister_connection(&id);
            self.on_disconnect(&id);
        }
    }

    fn on_disconnect(self: &Arc<Self>, agent_id: &str) {
        let hub = self.clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = hub.registry.mark_offline(&agent_id).await {
                warn!("failed to mark node offline: {e}");
            }
            if let Err(e) = hub.tracker.mark_unreachable(&agent_id).await {
                warn!("failed to mark sessions unreachable: {e}");
            }
            hub.emit_hub_event(&agent_id, "node.offline");
        });
    }

    fn next_hub_seq(&self, stream_key: &str) -> u64 {
        let mut seqs = self.hub_seq.lock();
        let entry = seqs.entry(stream_key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Hub-originated lifecycle notices (`node.online`/`node.offline`) are
    /// fed into the same Event Pipeline as agent-reported events, under a
    /// synthetic per-agent stream key so ordering within that stream is
    /// still enforced even though the Hub itself never buffers or retries.
    fn emit_hub_event(self: &Arc<Self>, agent_id: &str, kind: &str) {
        let Some(pipeline) = self.pipeline.get() else { return };
        let stream_key = format!("hub:{agent_id}");
        let seq = self.next_hub_seq(&stream_key);
        let event = Event {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: String::new(),
            kind: kind.to_string(),
            data: serde_json::json!({"node_id": agent_id}),
            timestamp: Utc::now(),
            seq,
        };
        let _ = pipeline.process_event(&stream_key, event);
    }

    async fn handle_envelope(self: &Arc<Self>, agent_id: &str, envelope: Envelope) {
        self.touch(agent_id);
        match envelope.kind {
            EnvelopeType::Heartbeat => {}
            EnvelopeType::Register => self.handle_register(agent_id, envelope.payload).await,
            EnvelopeType::CredentialSync => self.handle_credential_sync(agent_id, envelope.payload).await,
            EnvelopeType::AuthState => self.handle_auth_state(agent_id, envelope.payload).await,
            EnvelopeType::Event => self.handle_event(agent_id, envelope.payload),
            EnvelopeType::CommandResult => self.handle_command_result(agent_id, envelope.request_id, envelope.payload),
            EnvelopeType::Command => {
                // The supervisor never receives operator-shaped `command`
                // envelopes over an agent connection; ignore defensively.
            }
        }
    }

    async fn handle_register(self: &Arc<Self>, agent_id: &str, payload: serde_json::Value) {
        let Some(reg) = parse_register_payload(agent_id, &payload) else {
            warn!(agent_id, "malformed register payload, connection stays unregistered with the node registry");
            return;
        };
        if reg.node_id != agent_id {
            warn!(agent_id, declared = %reg.node_id, "register payload node_id does not match connection identity, using connection identity");
        }
        if let Err(e) = self
            .registry
            .register(agent_id, reg.hostname, None, reg.projects, reg.capabilities)
            .await
        {
            warn!(agent_id, "registry rejected register envelope: {e}");
            return;
        }
        if !reg.sessions.is_empty() {
            if let Err(e) = self.tracker.restore_from_snapshot(agent_id, reg.sessions).await {
                warn!(agent_id, "failed to restore session snapshot: {e}");
            }
        }
    }

    async fn handle_credential_sync(self: &Arc<Self>, agent_id: &str, payload: serde_json::Value) {
        let Some(reported) = payload.get("credential_version").and_then(|v| v.as_i64()) else {
            warn!(agent_id, "malformed credential_sync payload");
            return;
        };
        // The expected version is owned by the external admin surface; with
        // no push record on hand we compare against the node's last known
        // value, which only ever flags real external changes.
        let expected = self.registry.get(agent_id).map(|n| n.cred_version).unwrap_or(reported);
        if let Err(e) = self.registry.reconcile_credential_version(agent_id, reported, expected).await {
            warn!(agent_id, "credential reconcile failed: {e}");
        }
    }

    async fn handle_auth_state(self: &Arc<Self>, agent_id: &str, payload: serde_json::Value) {
        let Some(arr) = payload.as_array() else {
            warn!(agent_id, "malformed auth_state payload");
            return;
        };
        let mut states = Vec::new();
        for item in arr {
            match serde_json::from_value::<ToolAuthState>(item.clone()) {
                Ok(s) => states.push(s),
                Err(e) => warn!(agent_id, "skipping malformed auth_state entry: {e}"),
            }
        }
        if let Err(e) = self.registry.update_auth_state(agent_id, states).await {
            warn!(agent_id, "auth_state update rejected: {e}");
        }
    }

    fn handle_event(self: &Arc<Self>, agent_id: &str, payload: serde_json::Value) {
        match serde_json::from_value::<Event>(payload) {
            Ok(event) => {
                if let Some(pipeline) = self.pipeline.get() {
                    if let Err(e) = pipeline.process_event(agent_id, event) {
                        warn!(agent_id, "event rejected: {e}");
                    }
                }
            }
            Err(e) => warn!(agent_id, "malformed event payload: {e}"),
        }
    }

    fn handle_command_result(self: &Arc<Self>, agent_id: &str, request_id: String, mut payload: serde_json::Value) {
        if payload.get("command_id").is_none() {
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("command_id".to_string(), serde_json::Value::String(request_id));
            }
        }
        match serde_json::from_value::<CommandResult>(payload) {
            Ok(result) => {
                if let Some(dispatcher) = self.dispatcher.get() {
                    dispatcher.handle_command_result(result);
                }
            }
            Err(e) => warn!(agent_id, "malformed command_result payload: {e}"),
        }
    }
}

impl Transport for ConnectionHub {
    fn send(&self, node_id: &str, command: &Command) -> Result<(), StateError> {
        let envelope = command_to_envelope(command);
        let bytes = serde_json::to_string(&envelope).map_err(|e| StateError::Internal(e.to_string()))?;
        let clients = self.clients.read();
        let conn = clients
            .get(node_id)
            .ok_or_else(|| StateError::Transport(format!("no connection for node {node_id}")))?;
        conn.send_tx
            .try_send(Message::Text(bytes))
            .map_err(|e| StateError::Transport(e.to_string()))
    }
}

impl ReplayRequester for ConnectionHub {
    fn request_replay(&self, agent_id: &str, from: u64, to: u64) {
        let clients = self.clients.read();
        let Some(conn) = clients.get(agent_id) else { return };
        let envelope = Envelope {
            version: 1,
            kind: EnvelopeType::Command,
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp(),
            payload: serde_json::json!({"replay_from": from, "replay_to": to}),
        };
        if let Ok(bytes) = serde_json::to_string(&envelope) {
            let _ = conn.send_tx.try_send(Message::Text(bytes));
        }
    }
}

fn command_to_envelope(command: &Command) -> Envelope {
    Envelope {
        version: 1,
        kind: EnvelopeType::Command,
        request_id: command.command_id.clone(),
        timestamp: Utc::now().timestamp(),
        payload: serde_json::json!({
            "command_id": command.command_id,
            "type": command.kind.as_wire_str(),
            "args": command.args,
        }),
    }
}

/// Supports `http[s]://*.suffix.example`, `scheme://host:*`, a bare `*`
/// wildcard, and exact match.
fn origin_matches(pattern: &str, origin: &str) -> bool {
    if pattern == "*" || pattern == origin {
        return true;
    }
    if let Some(idx) = pattern.find("://*.") {
        let scheme = &pattern[..idx + 3];
        let suffix = &pattern[idx + 4..];
        return origin.starts_with(scheme) && origin.ends_with(suffix);
    }
    if let Some(stripped) = pattern.strip_suffix(":*") {
        return origin.starts_with(stripped) && origin[stripped.len()..].starts_with(':');
    }
    false
}

#[derive(serde::Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// The agent-facing upgrade endpoint. Extracts the bearer token from the
/// `Authorization` header or the `token` query parameter, the agent id from
/// `X-Node-ID` (or mints a fresh one), checks Origin, then upgrades.
pub async fn ws_handler(
    State(state): State<crate::state::AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let hub = state.hub;
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(String::from)
        .or(query.token);

    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };
    if !hub.check_token(&token) {
        return (StatusCode::UNAUTHORIZED, "invalid bearer token").into_response();
    }

    let origin = headers.get("origin").and_then(|v| v.to_str().ok());
    if !hub.check_origin(origin) {
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let agent_id = headers
        .get("x-node-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    ws.on_upgrade(move |socket| handle_socket(hub, agent_id, socket))
}

async fn handle_socket(hub: Arc<ConnectionHub>, agent_id: String, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Message>(hub.config.send_queue_capacity);

    hub.register_connection(agent_id.clone(), send_tx);
    info!(agent_id, "agent connection registered online");
    hub.emit_hub_event(&agent_id, "node.online");

    let write_agent_id = agent_id.clone();
    let ping_interval = hub.config.ping_interval;
    let write_deadline = hub.config.write_deadline;
    let writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        loop {
            tokio::select! {
                maybe_msg = send_rx.recv() => {
                    match maybe_msg {
                        Some(msg) => {
                            match tokio::time::timeout(write_deadline, ws_tx.send(msg)).await {
                                Ok(Ok(())) => {}
                                Ok(Err(_)) => break,
                                Err(_) => {
                                    warn!(agent_id = write_agent_id, "write deadline exceeded, closing connection");
                                    break;
                                }
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    match tokio::time::timeout(write_deadline, ws_tx.send(Message::Ping(Vec::new()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => break,
                        Err(_) => {
                            warn!(agent_id = write_agent_id, "write deadline exceeded on ping, closing connection");
                            break;
                        }
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
        info!(agent_id = write_agent_id, "write task exiting");
    });

    let read_byte_limit = hub.config.read_byte_limit;
    let read_deadline = hub.config.read_deadline;
    loop {
        let msg = match tokio::time::timeout(read_deadline, ws_rx.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!(agent_id, "read deadline exceeded, closing connection");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                if text.len() > read_byte_limit {
                    warn!(agent_id, "frame exceeds read byte limit, dropping");
                    continue;
                }
                match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => hub.handle_envelope(&agent_id, envelope).await,
                    Err(e) => warn!(agent_id, "malformed envelope: {e}"),
                }
            }
            // Any frame, not just a pong, refreshes the read deadline simply
            // by virtue of the loop awaiting `ws_rx.next()` again.
            Message::Pong(_) => hub.touch(&agent_id),
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Only the path that actually removes the live entry owns this
    // disconnect's offline transition. If the heartbeat sweeper already
    // unregistered this id (and is driving `on_disconnect` itself), the
    // teardown here must not mark offline or emit `node.offline` again.
    if hub.unregister_connection(&agent_id) {
        if let Err(e) = hub.registry.mark_offline(&agent_id).await {
            warn!(agent_id, "failed to mark offline on disconnect: {e}");
        }
        if let Err(e) = hub.tracker.mark_unreachable(&agent_id).await {
            warn!(agent_id, "failed to mark sessions unreachable on disconnect: {e}");
        }
        hub.emit_hub_event(&agent_id, "node.offline");
    }
    writer.abort();
    info!(agent_id, "read task exiting, connection torn down");
}

struct RegisterPayload {
    node_id: String,
    hostname: String,
    projects: Vec<String>,
    capabilities: Vec<String>,
    sessions: Vec<TrackedSession>,
}

fn parse_register_payload(agent_id: &str, payload: &serde_json::Value) -> Option<RegisterPayload> {
    let node_id = payload.get("node_id").and_then(|v| v.as_str()).unwrap_or(agent_id).to_string();
    let hostname = payload.get("hostname")?.as_str()?.to_string();
    let projects = json_string_array(payload.get("projects"));
    let capabilities = json_string_array(payload.get("capabilities"));
    let sessions = payload
        .get("sessions")
        .and_then(|v| serde_json::from_value::<Vec<TrackedSession>>(v.clone()).ok())
        .unwrap_or_default();
    Some(RegisterPayload { node_id, hostname, projects, capabilities, sessions })
}

fn json_string_array(v: Option<&serde_json::Value>) -> Vec<String> {
    v.and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|x| x.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_wildcard_subdomain() {
        assert!(origin_matches("https://*.example.com", "https://foo.example.com"));
        assert!(!origin_matches("https://*.example.com", "https://example.com"));
    }

    #[test]
    fn origin_scheme_host_port_wildcard() {
        assert!(origin_matches("http://localhost:*", "http://localhost:5173"));
        assert!(!origin_matches("http://localhost:*", "http://otherhost:5173"));
    }

    #[test]
    fn origin_exact_and_star() {
        assert!(origin_matches("*", "anything"));
        assert!(origin_matches("https://a.com", "https://a.com"));
        assert!(!origin_matches("https://a.com", "https://b.com"));
    }

    #[test]
    fn register_payload_parses_minimal_fields() {
        let payload = serde_json::json!({"hostname": "host-a", "projects": ["p1"]});
        let parsed = parse_register_payload("n1", &payload).unwrap();
        assert_eq!(parsed.node_id, "n1");
        assert_eq!(parsed.hostname, "host-a");
        assert_eq!(parsed.projects, vec!["p1".to_string()]);
        assert!(parsed.sessions.is_empty());
    }
}
