//! Configuration types for MCP servers and the policies around them.
//!
//! These are plain values; loading them from disk is the job of the host.

use crate::breaker::BreakerConfig;
use crate::manager::{HealthConfig, ReconnectConfig};
use crate::retry::RetryPolicy;
use crate::session::ClientInfo;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Per-call timeout for servers that do not set `timeout_ms`.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

fn default_timeout() -> u64 {
    DEFAULT_CALL_TIMEOUT.as_millis() as u64
}

fn default_handshake_timeout() -> u64 {
    10000
}

fn default_discovery_timeout() -> u64 {
    15000
}

/// Top-level MCP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default, alias = "mcpServers")]
    pub servers: BTreeMap<String, ServerConfig>,
    /// Identity sent in the `initialize` request.
    #[serde(default)]
    pub client: ClientInfo,
    /// Window for the initialize exchange (default: 10000).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Deadline for each server's `tools/list` during a refresh (default: 15000).
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            servers: BTreeMap::new(),
            client: ClientInfo::default(),
            handshake_timeout_ms: default_handshake_timeout(),
            discovery_timeout_ms: default_discovery_timeout(),
            retry: RetryPolicy::default(),
            reconnect: ReconnectConfig::default(),
            breaker: BreakerConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl McpConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Command to run (e.g., "npx", "python").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables to set for the server process.
    ///
    /// The child sees only these plus `PATH`.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Timeout for tool calls in milliseconds (default: 30000).
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Skip this server without removing it from the file.
    #[serde(default)]
    pub disabled: bool,
}

impl ServerConfig {
    /// A server entry with default timeout and no environment.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            timeout_ms: default_timeout(),
            disabled: false,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
