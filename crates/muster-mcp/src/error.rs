//! Error types for MCP operations.
//!
//! Errors are layered the same way the client is: transport failures are
//! terminal for one child process, protocol failures are surfaced to the
//! caller of a session, and call failures are what the router hands back.

use crate::session::SessionState;
use thiserror::Error;

/// Failures of the byte-stream plumbing underneath a session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broken pipe: the server process is no longer accepting input")]
    BrokenPipe,

    #[error("end of stream: the server process closed its output")]
    Eof,

    #[error("protocol desync after {consecutive} malformed frames (last: {last_error})")]
    MalformedFrame { consecutive: u32, last_error: String },

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while bringing a server online.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to spawn MCP server '{name}': {source}")]
    SpawnFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("MCP server '{name}': command '{command}' not found")]
    PathNotFound { name: String, command: String },

    #[error("MCP server '{name}' handshake failed: {source}")]
    Handshake {
        name: String,
        source: ProtocolError,
    },

    #[error("MCP server '{name}' unreachable after {attempts} reconnect attempts")]
    Exhausted { name: String, attempts: u32 },

    #[error("MCP server '{name}' is disabled")]
    Disabled { name: String },

    #[error("no MCP server named '{name}' is configured")]
    UnknownServer { name: String },
}

impl ConnectError {
    /// Name of the server this failure belongs to.
    pub fn server(&self) -> &str {
        match self {
            Self::SpawnFailed { name, .. }
            | Self::PathNotFound { name, .. }
            | Self::Handshake { name, .. }
            | Self::Exhausted { name, .. }
            | Self::Disabled { name }
            | Self::UnknownServer { name } => name,
        }
    }
}

/// Failures of the JSON-RPC conversation with one server.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("no common protocol version (offered {offered:?}, server answered '{server}')")]
    VersionMismatch { offered: Vec<String>, server: String },

    #[error("malformed initialize response: {0}")]
    MalformedHandshake(String),

    #[error("malformed '{method}' response: {reason}")]
    MalformedResponse { method: String, reason: String },

    #[error("'{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("session is not ready (state: {state:?})")]
    NotReady { state: SessionState },

    #[error("JSON-RPC error (code {code}): {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("failed to encode '{method}' message: {reason}")]
    Encode { method: String, reason: String },
}

impl ProtocolError {
    /// Whether the failure is transient and the operation may be retried.
    ///
    /// Only timeouts and lost connections qualify; version and handshake
    /// problems mean the server is incompatible, and an RPC error is a
    /// well-formed answer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ConnectionLost(_))
    }
}

/// Failures of a routed tool call.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("unknown tool '{name}'")]
    UnknownTool { name: String },

    #[error("MCP server '{server}' is unavailable")]
    ServerUnavailable { server: String },

    #[error("invalid arguments for '{tool}': {}", errors.join("; "))]
    InvalidArguments { tool: String, errors: Vec<String> },

    #[error("tool '{tool}' failed: {message}")]
    ToolExecutionError {
        tool: String,
        message: String,
        details: serde_json::Value,
    },

    #[error("tool '{tool}' failed after {attempts} attempts: {last_error}")]
    Exhausted {
        tool: String,
        attempts: u32,
        last_error: ProtocolError,
    },

    #[error("circuit open for MCP server '{server}' (retry in {retry_in_ms}ms)")]
    CircuitOpen { server: String, retry_in_ms: u64 },

    #[error("tool '{tool}': {source}")]
    Protocol { tool: String, source: ProtocolError },
}
