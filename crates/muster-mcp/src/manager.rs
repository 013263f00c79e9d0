//! Session manager: owns the named sessions and keeps them alive.
//!
//! Servers connect concurrently and fail independently. Health checks feed a
//! per-server failure count; past the threshold the server is reconnected
//! with backoff, and given up on after the configured number of attempts.

use crate::compat::{SUPPORTED_VERSIONS, ServerInfo};
use crate::config::{DEFAULT_CALL_TIMEOUT, McpConfig, ServerConfig};
use crate::error::{ConnectError, ProtocolError};
use crate::registry::ToolRegistry;
use crate::retry::{Jitter, RetryPolicy};
use crate::session::{ClientInfo, McpSession, SessionState};
use crate::transport::{StdioTransport, Transport, TransportFuture};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Health-check policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Period of the background monitor.
    pub interval_ms: u64,
    /// Deadline for one probe.
    pub timeout_ms: u64,
    /// Consecutive failed probes before a server is unreachable.
    pub failure_threshold: u32,
    /// Reconnect automatically once a server is unreachable.
    pub auto_reconnect: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 3000,
            failure_threshold: 3,
            auto_reconnect: true,
        }
    }
}

/// Reconnect backoff: exponential from `base_delay_ms`, capped, full jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_attempts,
            initial_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            backoff_factor: 2.0,
            jitter: Jitter::Full,
        }
    }
}

/// Result of probing one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unreachable,
}

/// Opens transports for configured servers.
pub trait Connector: Send + Sync {
    fn connect<'a>(
        &'a self,
        name: &'a str,
        config: &'a ServerConfig,
    ) -> TransportFuture<'a, Result<Arc<dyn Transport>, ConnectError>>;
}

/// Spawns each server as a child process speaking over stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioConnector;

impl Connector for StdioConnector {
    fn connect<'a>(
        &'a self,
        name: &'a str,
        config: &'a ServerConfig,
    ) -> TransportFuture<'a, Result<Arc<dyn Transport>, ConnectError>> {
        Box::pin(async move {
            let transport = StdioTransport::spawn(name, config)?;
            Ok(Arc::new(transport) as Arc<dyn Transport>)
        })
    }
}

/// A server that came up during `connect_all`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectedServer {
    pub protocol_version: String,
    pub server_info: ServerInfo,
}

/// Per-server outcomes of `connect_all`.
#[derive(Debug, Default)]
pub struct ConnectReport {
    pub outcomes: BTreeMap<String, Result<ConnectedServer, ConnectError>>,
}

impl ConnectReport {
    pub fn connected(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_ok())
            .map(|(name, _)| name.as_str())
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &ConnectError)> {
        self.outcomes
            .iter()
            .filter_map(|(name, outcome)| outcome.as_ref().err().map(|e| (name.as_str(), e)))
    }
}

/// Snapshot of one server's standing.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: Option<SessionState>,
    pub health: HealthStatus,
    pub consecutive_failures: u32,
    pub last_checked: Option<DateTime<Utc>>,
    pub protocol_version: Option<String>,
    /// Set once reconnects are exhausted; cleared by `reset`.
    pub gave_up: bool,
}

struct ServerEntry {
    config: ServerConfig,
    session: Option<Arc<McpSession>>,
    health: HealthStatus,
    consecutive_failures: u32,
    last_checked: Option<DateTime<Utc>>,
    reconnecting: bool,
    gave_up: bool,
    reconnect_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ServerEntry {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            session: None,
            health: HealthStatus::Unreachable,
            consecutive_failures: 0,
            last_checked: None,
            reconnecting: false,
            gave_up: false,
            reconnect_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn mark_connected(&mut self, session: Arc<McpSession>) -> Option<Arc<McpSession>> {
        self.health = HealthStatus::Healthy;
        self.consecutive_failures = 0;
        self.gave_up = false;
        self.session.replace(session)
    }
}

/// Manages connections to multiple MCP servers.
pub struct SessionManager {
    client_info: ClientInfo,
    supported_versions: Vec<String>,
    handshake_timeout: Duration,
    health: HealthConfig,
    reconnect: ReconnectConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<ToolRegistry>,
    entries: RwLock<HashMap<String, ServerEntry>>,
}

impl SessionManager {
    /// A manager that spawns servers as child processes.
    pub fn new(config: &McpConfig, registry: Arc<ToolRegistry>) -> Self {
        Self::with_connector(config, registry, Arc::new(StdioConnector))
    }

    pub fn with_connector(
        config: &McpConfig,
        registry: Arc<ToolRegistry>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            client_info: config.client.clone(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
            handshake_timeout: config.handshake_timeout(),
            health: config.health.clone(),
            reconnect: config.reconnect.clone(),
            connector,
            registry,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ServerEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ServerEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect every configured server concurrently.
    ///
    /// Servers that fail are logged and reported; the rest carry on.
    pub async fn connect_all(&self, configs: &BTreeMap<String, ServerConfig>) -> ConnectReport {
        {
            let mut entries = self.write();
            for (name, config) in configs {
                entries
                    .entry(name.clone())
                    .and_modify(|e| e.config = config.clone())
                    .or_insert_with(|| ServerEntry::new(config.clone()));
            }
        }

        let attempts = configs.iter().map(|(name, config)| async move {
            (name.clone(), self.connect_one(name, config).await)
        });

        let mut report = ConnectReport::default();
        for (name, outcome) in join_all(attempts).await {
            let outcome = match outcome {
                Ok(session) => {
                    let connected = ConnectedServer {
                        protocol_version: session.protocol_version().unwrap_or_default().to_string(),
                        server_info: session.server_info().cloned().unwrap_or_default(),
                    };
                    self.install(&name, session).await;
                    Ok(connected)
                }
                Err(e) => {
                    if matches!(e, ConnectError::Disabled { .. }) {
                        tracing::debug!("MCP server '{}' is disabled, skipping", name);
                    } else {
                        tracing::warn!("Failed to start MCP server '{}': {}", name, e);
                    }
                    Err(e)
                }
            };
            report.outcomes.insert(name, outcome);
        }

        tracing::info!(
            "{} of {} MCP servers connected",
            report.connected().count(),
            report.outcomes.len()
        );
        report
    }

    async fn connect_one(
        &self,
        name: &str,
        config: &ServerConfig,
    ) -> Result<Arc<McpSession>, ConnectError> {
        if config.disabled {
            return Err(ConnectError::Disabled {
                name: name.to_string(),
            });
        }

        let transport = self.connector.connect(name, config).await?;
        let session = McpSession::start(name, transport);
        session
            .initialize(
                &self.client_info,
                &self.supported_versions,
                self.handshake_timeout,
            )
            .await
            .map_err(|source| ConnectError::Handshake {
                name: name.to_string(),
                source,
            })?;
        Ok(session)
    }

    /// Swap a fresh session into the table, then retire whatever it replaced.
    async fn install(&self, name: &str, session: Arc<McpSession>) {
        self.watch_disconnect(&session);
        let replaced = self
            .write()
            .get_mut(name)
            .and_then(|entry| entry.mark_connected(session));
        if let Some(old) = replaced {
            self.retire(old).await;
        }
    }

    /// Drop the session's tools as soon as it closes, including when the
    /// server exits on its own.
    fn watch_disconnect(&self, session: &Arc<McpSession>) {
        let closed = session.closed();
        let session = Arc::downgrade(session);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            closed.await;
            if let Some(session) = session.upgrade() {
                tracing::debug!(server = %session.name(), "session closed, dropping its tools");
                registry.remove_session(&session);
            }
        });
    }

    async fn retire(&self, session: Arc<McpSession>) {
        session.close().await;
        self.registry.remove_session(&session);
    }

    /// The session for `name`, if it is ready.
    pub fn get_session(&self, name: &str) -> Option<Arc<McpSession>> {
        self.read()
            .get(name)
            .and_then(|entry| entry.session.as_ref())
            .filter(|session| session.is_ready())
            .cloned()
    }

    /// All ready sessions, by server name.
    pub fn ready_sessions(&self) -> Vec<(String, Arc<McpSession>)> {
        self.read()
            .iter()
            .filter_map(|(name, entry)| {
                entry
                    .session
                    .as_ref()
                    .filter(|session| session.is_ready())
                    .map(|session| (name.clone(), Arc::clone(session)))
            })
            .collect()
    }

    /// Per-call timeout configured for `name`, or the default.
    pub fn call_timeout(&self, name: &str) -> Duration {
        self.read()
            .get(name)
            .map(|entry| entry.config.timeout())
            .unwrap_or(DEFAULT_CALL_TIMEOUT)
    }

    /// Names of every server the manager knows about.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Probe one server. Crossing the failure threshold marks it
    /// unreachable and, if enabled, starts a background reconnect.
    ///
    /// Disabled and given-up servers report `Unreachable` without a probe.
    pub async fn health_check(self: &Arc<Self>, name: &str) -> HealthStatus {
        let session = match self.read().get(name) {
            None => return HealthStatus::Unreachable,
            // Disabled servers are never probed or reconnected.
            Some(entry) if entry.config.disabled || entry.gave_up => {
                return HealthStatus::Unreachable;
            }
            Some(entry) => entry.session.clone(),
        };

        let probe = match session {
            Some(session) if session.is_ready() => {
                let deadline = Instant::now() + Duration::from_millis(self.health.timeout_ms);
                match session.ping(deadline).await {
                    // A server without ping that still answers is alive.
                    Ok(()) | Err(ProtocolError::Rpc { .. }) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            _ => Err(ProtocolError::ConnectionLost("no live session".to_string())),
        };

        let (status, start_reconnect) = {
            let mut entries = self.write();
            let Some(entry) = entries.get_mut(name) else {
                return HealthStatus::Unreachable;
            };
            entry.last_checked = Some(Utc::now());
            match probe {
                Ok(()) => {
                    entry.consecutive_failures = 0;
                    entry.health = HealthStatus::Healthy;
                    (HealthStatus::Healthy, false)
                }
                Err(e) => {
                    entry.consecutive_failures += 1;
                    tracing::debug!(
                        server = %name,
                        failures = entry.consecutive_failures,
                        "health check failed: {e}"
                    );
                    if entry.consecutive_failures >= self.health.failure_threshold {
                        entry.health = HealthStatus::Unreachable;
                        let start = self.health.auto_reconnect && !entry.reconnecting;
                        if start {
                            entry.reconnecting = true;
                        }
                        (HealthStatus::Unreachable, start)
                    } else {
                        entry.health = HealthStatus::Degraded;
                        (HealthStatus::Degraded, false)
                    }
                }
            }
        };

        if start_reconnect {
            tracing::warn!("MCP server '{}' unreachable, reconnecting", name);
            let manager = Arc::clone(self);
            let name = name.to_string();
            tokio::spawn(async move {
                if let Err(e) = manager.reconnect(&name).await {
                    tracing::warn!("{e}");
                }
            });
        }
        status
    }

    /// Tear down the server's session and connect again with backoff.
    pub async fn reconnect(&self, name: &str) -> Result<(), ConnectError> {
        let (config, lock) = {
            let entries = self.read();
            let entry = entries.get(name).ok_or_else(|| ConnectError::UnknownServer {
                name: name.to_string(),
            })?;
            (entry.config.clone(), Arc::clone(&entry.reconnect_lock))
        };
        let _guard = lock.lock().await;

        let old = self
            .write()
            .get_mut(name)
            .and_then(|entry| entry.session.take());
        if let Some(old) = old {
            self.retire(old).await;
        }

        let result = self.reconnect_with_backoff(name, &config).await;

        let mut entries = self.write();
        if let Some(entry) = entries.get_mut(name) {
            entry.reconnecting = false;
            if result.is_err() && !config.disabled {
                entry.gave_up = true;
                entry.health = HealthStatus::Unreachable;
            }
        }
        result
    }

    async fn reconnect_with_backoff(
        &self,
        name: &str,
        config: &ServerConfig,
    ) -> Result<(), ConnectError> {
        let policy = self.reconnect.policy();
        let attempts = policy.max_retries.max(1);

        for attempt in 0..attempts {
            match self.connect_one(name, config).await {
                Ok(session) => {
                    self.install(name, session).await;
                    tracing::info!("MCP server '{}' reconnected", name);
                    if let Err(e) = self.registry.refresh_server(self, name).await {
                        tracing::warn!("tool discovery for '{}' failed after reconnect: {}", name, e);
                    }
                    return Ok(());
                }
                Err(e @ ConnectError::Disabled { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        server = %name,
                        attempt = attempt + 1,
                        "reconnect attempt failed: {e}"
                    );
                    if attempt + 1 < attempts {
                        tokio::time::sleep(policy.delay_for(attempt)).await;
                    }
                }
            }
        }

        tracing::warn!("giving up on MCP server '{}' until reset", name);
        Err(ConnectError::Exhausted {
            name: name.to_string(),
            attempts,
        })
    }

    /// Clear a given-up server's state and try to reconnect it.
    pub async fn reset(&self, name: &str) -> Result<(), ConnectError> {
        if let Some(entry) = self.write().get_mut(name) {
            entry.gave_up = false;
            entry.consecutive_failures = 0;
        }
        self.reconnect(name).await
    }

    /// Close one server's session and drop its tools.
    pub async fn close_session(&self, name: &str) {
        let old = self.write().get_mut(name).and_then(|entry| {
            entry.health = HealthStatus::Unreachable;
            entry.session.take()
        });
        if let Some(old) = old {
            self.retire(old).await;
        }
    }

    /// Current standing of every server, sorted by name.
    pub fn statuses(&self) -> Vec<ServerStatus> {
        let mut statuses: Vec<ServerStatus> = self
            .read()
            .iter()
            .map(|(name, entry)| ServerStatus {
                name: name.clone(),
                state: entry.session.as_ref().map(|s| s.state()),
                health: entry.health,
                consecutive_failures: entry.consecutive_failures,
                last_checked: entry.last_checked,
                protocol_version: entry
                    .session
                    .as_ref()
                    .and_then(|s| s.protocol_version().map(str::to_string)),
                gave_up: entry.gave_up,
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Run health checks for every server on the configured interval until cancelled.
    pub fn spawn_health_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = Duration::from_millis(self.health.interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let names = manager.server_names();
                        join_all(names.iter().map(|name| manager.health_check(name))).await;
                    }
                }
            }
        })
    }

    /// Shut down all connected servers.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<McpSession>> = self
            .write()
            .values_mut()
            .filter_map(|entry| entry.session.take())
            .collect();
        join_all(sessions.into_iter().map(|session| self.retire(session))).await;
    }
}
