//! The context object a host builds once and passes around.
//!
//! Owns the session manager, tool registry and execution router for one
//! configuration. Nothing in this crate is reachable through globals.

use crate::config::McpConfig;
use crate::error::CallError;
use crate::manager::{ConnectReport, Connector, SessionManager, StdioConnector};
use crate::registry::{RegistryReport, ToolDescriptor, ToolFilter, ToolRegistry};
use crate::router::ExecutionRouter;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of [`McpHub::start`].
#[derive(Debug)]
pub struct StartReport {
    pub connect: ConnectReport,
    pub discovery: RegistryReport,
}

pub struct McpHub {
    config: McpConfig,
    manager: Arc<SessionManager>,
    registry: Arc<ToolRegistry>,
    router: ExecutionRouter,
    monitor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl McpHub {
    /// A hub whose servers run as child processes.
    pub fn new(config: McpConfig) -> Self {
        Self::with_connector(config, Arc::new(StdioConnector))
    }

    pub fn with_connector(config: McpConfig, connector: Arc<dyn Connector>) -> Self {
        let registry = Arc::new(ToolRegistry::with_discovery_timeout(
            config.discovery_timeout(),
        ));
        let manager = Arc::new(SessionManager::with_connector(
            &config,
            Arc::clone(&registry),
            connector,
        ));
        let router = ExecutionRouter::new(
            Arc::clone(&registry),
            Arc::clone(&manager),
            config.retry.clone(),
            config.breaker.clone(),
        );
        Self {
            config,
            manager,
            registry,
            router,
            monitor: Mutex::new(None),
        }
    }

    /// Connect every configured server, then discover their tools.
    pub async fn start(&self) -> StartReport {
        let connect = self.manager.connect_all(&self.config.servers).await;
        let discovery = self.registry.refresh(&self.manager).await;
        tracing::info!(
            "{} tools available from {} servers",
            self.registry.len(),
            discovery.refreshed.len()
        );
        StartReport { connect, discovery }
    }

    /// Call a tool by qualified name.
    pub async fn call(
        &self,
        qualified_name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        self.router.call(qualified_name, arguments, timeout).await
    }

    /// Rediscover tools on every ready server.
    pub async fn refresh(&self) -> RegistryReport {
        self.registry.refresh(&self.manager).await
    }

    pub fn tools(&self, filter: &ToolFilter) -> Vec<Arc<ToolDescriptor>> {
        self.registry.list(filter)
    }

    /// Start periodic health checks. A second call is a no-op.
    pub fn start_health_monitor(&self) {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.is_none() {
            let cancel = CancellationToken::new();
            let handle = self.manager.spawn_health_monitor(cancel.clone());
            *monitor = Some((cancel, handle));
        }
    }

    /// Stop the health monitor and close every session.
    pub async fn shutdown(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((cancel, handle)) = monitor {
            cancel.cancel();
            let _ = handle.await;
        }
        self.manager.shutdown().await;
    }

    pub fn config(&self) -> &McpConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &ExecutionRouter {
        &self.router
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::mock::MockConnector;
    use serde_json::json;

    fn config() -> McpConfig {
        let mut config = McpConfig::default();
        config
            .servers
            .insert("alpha".into(), ServerConfig::new("mock", vec![]));
        config
            .servers
            .insert("broken".into(), ServerConfig::new("missing", vec![]));
        config
    }

    #[tokio::test]
    async fn start_call_shutdown() {
        let hub = McpHub::with_connector(config(), MockConnector::new());
        let report = hub.start().await;
        assert_eq!(report.connect.connected().collect::<Vec<_>>(), ["alpha"]);
        assert_eq!(report.connect.failed().count(), 1);
        assert_eq!(report.discovery.refreshed["alpha"], 1);

        let content = hub
            .call("alpha.echo", json!({"text": "hello"}), None)
            .await
            .unwrap();
        assert_eq!(content[0]["text"], "hello");
        assert!(matches!(
            hub.call("broken.echo", json!({"text": "hello"}), None).await,
            Err(CallError::UnknownTool { .. })
        ));

        hub.start_health_monitor();
        hub.start_health_monitor();
        hub.shutdown().await;
        assert!(hub.registry().is_empty());
        assert!(hub.manager().get_session("alpha").is_none());
    }
}
