//! Multi-server MCP (Model Context Protocol) client.
//!
//! Each configured server is spawned as a child process speaking
//! newline-delimited JSON-RPC 2.0 over stdio. Sessions are initialized with
//! a version-negotiating handshake, their tools are merged into one
//! `server.tool` namespace, and calls are routed with argument validation,
//! retries and a per-server circuit breaker.

pub mod breaker;
pub mod compat;
pub mod config;
pub mod error;
pub mod hub;
pub mod jsonrpc;
pub mod manager;
pub mod registry;
pub mod retry;
pub mod router;
pub mod schema;
pub mod session;
pub mod transport;

#[cfg(test)]
mod mock;

pub use breaker::{BreakerConfig, CircuitState};
pub use compat::{ServerCapabilities, ServerInfo, ToolAnnotations};
pub use config::{DEFAULT_CALL_TIMEOUT, McpConfig, ServerConfig};
pub use error::{CallError, ConnectError, ProtocolError, TransportError};
pub use hub::{McpHub, StartReport};
pub use manager::{
    ConnectReport, Connector, HealthConfig, HealthStatus, ReconnectConfig, ServerStatus,
    SessionManager, StdioConnector,
};
pub use registry::{
    RegistryReport, ToolCapability, ToolDescriptor, ToolFilter, ToolRegistry, ToolSummary,
};
pub use retry::{Jitter, RetryPolicy};
pub use router::ExecutionRouter;
pub use session::{ClientInfo, McpSession, SessionState};
pub use transport::{StdioTransport, Transport};
