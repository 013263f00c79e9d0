//! MCP session: one stateful JSON-RPC conversation with one server.
//!
//! Handles the protocol handshake (initialize + initialized notification),
//! id-correlated requests, notifications, tool discovery (tools/list) and
//! tool invocation (tools/call). A background reader task owns the inbound
//! half of the transport and hands responses to waiting callers.

use crate::compat::{self, Handshake, RemoteTool, ServerCapabilities, ServerInfo};
use crate::error::ProtocolError;
use crate::jsonrpc::{
    Incoming, JsonRpcNotification, JsonRpcReply, JsonRpcRequest, JsonRpcResponse,
    METHOD_NOT_FOUND, ServerNotification,
};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Notification sent once the handshake response has been accepted.
pub const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";

/// Default window for the initialize exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on `tools/list` pages followed in one discovery pass.
const MAX_TOOL_PAGES: usize = 64;

/// Identity this client presents during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "muster".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Closing,
    Closed,
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value, ProtocolError>>,
}

/// State shared between the session handle and its reader task.
struct Shared {
    name: String,
    transport: Arc<dyn Transport>,
    state: Mutex<SessionState>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    notifications: broadcast::Sender<ServerNotification>,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every in-flight request. The state must already be terminal so
    /// no new request can slip in afterwards.
    fn fail_pending(&self, reason: &str) {
        let drained: Vec<PendingRequest> = self.pending().drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            tracing::debug!(
                server = %self.name,
                count = drained.len(),
                "failing in-flight requests: {reason}"
            );
        }
        for request in drained {
            let _ = request
                .tx
                .send(Err(ProtocolError::ConnectionLost(reason.to_string())));
        }
    }

    async fn dispatch(&self, frame: Value) {
        match Incoming::classify(frame) {
            Ok(Incoming::Response(resp)) => self.complete(resp),
            Ok(Incoming::Request { id, method, .. }) => {
                let reply = if method == "ping" {
                    JsonRpcReply::result(id, json!({}))
                } else {
                    tracing::debug!(server = %self.name, method = %method, "unsupported server request");
                    JsonRpcReply::error(id, METHOD_NOT_FOUND, format!("Method not found: {method}"))
                };
                match serde_json::to_value(&reply) {
                    Ok(message) => {
                        if let Err(e) = self.transport.write_message(&message).await {
                            tracing::debug!(server = %self.name, "failed to answer server request: {e}");
                        }
                    }
                    Err(e) => tracing::warn!(server = %self.name, "failed to encode reply: {e}"),
                }
            }
            Ok(Incoming::Notification(notification)) => {
                tracing::debug!(
                    server = %self.name,
                    method = %notification.method,
                    "server notification"
                );
                let _ = self.notifications.send(notification);
            }
            Err(reason) => {
                tracing::warn!(server = %self.name, "ignoring unrecognized frame: {reason}");
            }
        }
    }

    fn complete(&self, resp: JsonRpcResponse) {
        let waiting = resp.numeric_id().and_then(|id| self.pending().remove(&id));
        let Some(request) = waiting else {
            tracing::debug!(server = %self.name, id = ?resp.id, "discarding response with unknown id");
            return;
        };

        let outcome = match (resp.error, resp.result) {
            (Some(err), _) => Err(ProtocolError::Rpc {
                code: err.code,
                message: err.message,
                data: err.data,
            }),
            (None, Some(result)) => Ok(result),
            (None, None) => Err(ProtocolError::MalformedResponse {
                method: request.method,
                reason: "response has neither result nor error".to_string(),
            }),
        };
        // The caller may have timed out in the meantime; that is fine.
        let _ = request.tx.send(outcome);
    }
}

/// Removes a pending slot if the waiting caller goes away first.
struct PendingSlot<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.shared.pending().remove(&self.id);
    }
}

async fn read_loop(shared: Arc<Shared>) {
    let reason = loop {
        match shared.transport.read_message().await {
            Ok(frame) => shared.dispatch(frame).await,
            Err(e) => break e.to_string(),
        }
    };

    let was = std::mem::replace(&mut *shared.state(), SessionState::Closed);
    shared.closed.send_replace(true);
    shared.fail_pending(&reason);
    if matches!(was, SessionState::Ready | SessionState::Initializing) {
        tracing::info!("MCP server '{}' disconnected: {}", shared.name, reason);
        shared.transport.close().await;
    }
}

/// Client for a single MCP server.
pub struct McpSession {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    handshake: OnceLock<Handshake>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl McpSession {
    /// Wrap a transport and start reading from it. The session begins
    /// `Uninitialized`; call [`initialize`](Self::initialize) next.
    pub fn start(name: impl Into<String>, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            name: name.into(),
            transport,
            state: Mutex::new(SessionState::Uninitialized),
            pending: Mutex::new(HashMap::new()),
            notifications,
            closed: watch::channel(false).0,
        });
        let reader_handle = tokio::spawn(read_loop(Arc::clone(&shared)));

        Arc::new(Self {
            shared,
            next_id: AtomicU64::new(1),
            handshake: OnceLock::new(),
            reader_handle: Mutex::new(Some(reader_handle)),
        })
    }

    /// Perform the handshake: offer the newest supported version, validate
    /// the answer, then send the initialized notification.
    ///
    /// Any failure closes the session.
    pub async fn initialize(
        &self,
        client_info: &ClientInfo,
        supported_versions: &[String],
        timeout: Duration,
    ) -> Result<ServerCapabilities, ProtocolError> {
        self.transition(SessionState::Uninitialized, SessionState::Initializing)?;

        match self.handshake(client_info, supported_versions, timeout).await {
            Ok(handshake) => {
                let capabilities = handshake.capabilities.clone();
                tracing::info!(
                    "MCP server '{}' initialized ({} {}, protocol {})",
                    self.shared.name,
                    handshake.server_info.name,
                    handshake.server_info.version,
                    handshake.protocol_version
                );
                let _ = self.handshake.set(handshake);
                Ok(capabilities)
            }
            Err(e) => {
                tracing::warn!("MCP server '{}' handshake failed: {}", self.shared.name, e);
                self.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        client_info: &ClientInfo,
        supported_versions: &[String],
        timeout: Duration,
    ) -> Result<Handshake, ProtocolError> {
        let offered = compat::preferred_version(supported_versions).ok_or_else(|| {
            ProtocolError::VersionMismatch {
                offered: Vec::new(),
                server: String::new(),
            }
        })?;

        let params = json!({
            "protocolVersion": offered,
            "capabilities": {},
            "clientInfo": client_info,
        });
        let raw = self
            .send_request("initialize", Some(params), Instant::now() + timeout)
            .await?;

        let handshake = compat::normalize_handshake(&raw)?;
        compat::negotiate_version(supported_versions, &handshake.protocol_version)?;

        self.transition(SessionState::Initializing, SessionState::Ready)?;
        self.send_notification(INITIALIZED_NOTIFICATION, Some(json!({})))
            .await?;
        Ok(handshake)
    }

    /// Send a request and wait for the response with the matching id.
    ///
    /// Only valid while `Ready`. On timeout the slot is freed and the session
    /// stays usable; a late response is discarded by the reader.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Instant,
    ) -> Result<Value, ProtocolError> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(ProtocolError::NotReady { state });
        }
        self.send_request(method, params, deadline).await
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Instant,
    ) -> Result<Value, ProtocolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = serde_json::to_value(JsonRpcRequest::new(id, method, params)).map_err(|e| {
            ProtocolError::Encode {
                method: method.to_string(),
                reason: e.to_string(),
            }
        })?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending();
            if matches!(
                *self.shared.state(),
                SessionState::Closing | SessionState::Closed
            ) {
                return Err(ProtocolError::ConnectionLost("session closed".to_string()));
            }
            pending.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    tx,
                },
            );
        }
        let _slot = PendingSlot {
            shared: &self.shared,
            id,
        };

        self.shared
            .transport
            .write_message(&message)
            .await
            .map_err(|e| ProtocolError::ConnectionLost(e.to_string()))?;

        let timeout_ms = deadline
            .saturating_duration_since(Instant::now())
            .as_millis() as u64;
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProtocolError::ConnectionLost(
                "response channel dropped".to_string(),
            )),
            Err(_) => {
                tracing::debug!(server = %self.shared.name, id, method, "request timed out");
                Err(ProtocolError::Timeout {
                    method: method.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Send a notification (fire-and-forget, no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProtocolError> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(ProtocolError::NotReady { state });
        }
        self.send_notification(method, params).await
    }

    async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ProtocolError> {
        let message = serde_json::to_value(JsonRpcNotification::new(method, params)).map_err(|e| {
            ProtocolError::Encode {
                method: method.to_string(),
                reason: e.to_string(),
            }
        })?;
        self.shared
            .transport
            .write_message(&message)
            .await
            .map_err(|e| ProtocolError::ConnectionLost(e.to_string()))
    }

    /// Fetch the server's full tool catalog, following pagination.
    pub async fn list_tools(&self, deadline: Instant) -> Result<Vec<RemoteTool>, ProtocolError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let raw = self.request("tools/list", Some(params), deadline).await?;
            let page = compat::normalize_tool_list(&raw)?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }

        tracing::warn!(
            server = %self.shared.name,
            "tools/list still paginating after {MAX_TOOL_PAGES} pages, truncating"
        );
        Ok(tools)
    }

    /// Call a tool on this server and return the raw `result` object.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        deadline: Instant,
    ) -> Result<Value, ProtocolError> {
        let params = json!({
            "name": tool_name,
            "arguments": arguments,
        });
        self.request("tools/call", Some(params), deadline).await
    }

    /// Lightweight liveness probe.
    pub async fn ping(&self, deadline: Instant) -> Result<(), ProtocolError> {
        self.request("ping", Some(json!({})), deadline).await.map(|_| ())
    }

    /// Shut the session down, failing in-flight requests. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.shared.state();
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }

        self.shared.fail_pending("session closed");
        self.shared.transport.close().await;
        *self.shared.state() = SessionState::Closed;
        self.shared.closed.send_replace(true);

        if let Some(handle) = self
            .reader_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        tracing::debug!(server = %self.shared.name, "session closed");
    }

    fn transition(&self, from: SessionState, to: SessionState) -> Result<(), ProtocolError> {
        let mut state = self.shared.state();
        if *state != from {
            return Err(ProtocolError::NotReady { state: *state });
        }
        *state = to;
        Ok(())
    }

    /// Resolves once the session is closed, whether by [`close`](Self::close)
    /// or because the server went away.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shared.closed.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }

    /// Subscribe to notifications the server sends.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<ServerNotification> {
        self.shared.notifications.subscribe()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Capabilities advertised by the server, once initialized.
    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.handshake.get().map(|h| &h.capabilities)
    }

    /// Negotiated protocol version, once initialized.
    pub fn protocol_version(&self) -> Option<&str> {
        self.handshake.get().map(|h| h.protocol_version.as_str())
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.handshake.get().map(|h| &h.server_info)
    }

    pub fn instructions(&self) -> Option<&str> {
        self.handshake.get().and_then(|h| h.instructions.as_deref())
    }

    /// Number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending().len()
    }
}

impl Drop for McpSession {
    fn drop(&mut self) {
        if let Some(handle) = self
            .reader_handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
