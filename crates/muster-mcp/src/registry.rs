//! Tool registry: one namespace of tools across every connected server.
//!
//! Tools are keyed `server.tool`. The catalog is an immutable snapshot
//! behind an [`ArcSwap`]: readers load it without locking and writers
//! publish a complete replacement with `rcu`, so a lookup always sees
//! either the old or the new catalog in full.

use crate::compat::{RemoteTool, ToolAnnotations};
use crate::error::ProtocolError;
use crate::manager::SessionManager;
use crate::schema::ArgumentSchema;
use crate::session::McpSession;
use arc_swap::ArcSwap;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Separator between server and tool in a qualified name.
pub const QUALIFIER: char = '.';

/// Join a server and tool name into the registry key.
pub fn qualify(server: &str, tool: &str) -> String {
    format!("{server}{QUALIFIER}{tool}")
}

/// Split a qualified name at the first separator.
pub fn split_qualified(qualified: &str) -> Option<(&str, &str)> {
    qualified
        .split_once(QUALIFIER)
        .filter(|(server, tool)| !server.is_empty() && !tool.is_empty())
}

/// One discovered tool, bound to the session that reported it.
pub struct ToolDescriptor {
    pub qualified_name: String,
    pub server: String,
    /// Name as the server knows it; this is what goes on the wire.
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub annotations: ToolAnnotations,
    schema: ArgumentSchema,
    session: Weak<McpSession>,
}

impl ToolDescriptor {
    pub fn new(server: &str, tool: RemoteTool, session: &Arc<McpSession>) -> Self {
        let qualified_name = qualify(server, &tool.name);
        let schema = ArgumentSchema::compile(&qualified_name, &tool.input_schema);
        Self {
            qualified_name,
            server: server.to_string(),
            name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
            annotations: tool.annotations,
            schema,
            session: Arc::downgrade(session),
        }
    }

    /// The owning session, if it is still alive.
    pub fn session(&self) -> Option<Arc<McpSession>> {
        self.session.upgrade()
    }

    fn belongs_to(&self, session: &Arc<McpSession>) -> bool {
        std::ptr::eq(self.session.as_ptr(), Arc::as_ptr(session))
    }

    fn is_live(&self) -> bool {
        self.session().is_some_and(|s| s.is_ready())
    }

    /// Check arguments against the input schema.
    pub fn validate(&self, arguments: &Value) -> Result<(), Vec<String>> {
        self.schema.validate(arguments)
    }

    /// A serializable view for listings.
    pub fn summary(&self) -> ToolSummary {
        ToolSummary {
            name: self.qualified_name.clone(),
            server: self.server.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
            annotations: self.annotations.clone(),
        }
    }
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("qualified_name", &self.qualified_name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .field("annotations", &self.annotations)
            .field("live", &self.is_live())
            .finish()
    }
}

/// What a listing prints for one tool.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSummary {
    pub name: String,
    pub server: String,
    pub description: String,
    pub input_schema: Value,
    pub annotations: ToolAnnotations,
}

/// Behavioral filter over tool annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCapability {
    ReadOnly,
    NonDestructive,
    Idempotent,
    OpenWorld,
}

impl ToolCapability {
    pub fn matches(self, annotations: &ToolAnnotations) -> bool {
        match self {
            Self::ReadOnly => annotations.read_only(),
            Self::NonDestructive => !annotations.destructive(),
            Self::Idempotent => annotations.idempotent(),
            Self::OpenWorld => annotations.open_world(),
        }
    }
}

/// Selects tools for [`ToolRegistry::list`]. The default selects everything.
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    pub server: Option<String>,
    pub capability: Option<ToolCapability>,
}

impl ToolFilter {
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn capability(mut self, capability: ToolCapability) -> Self {
        self.capability = Some(capability);
        self
    }

    fn matches(&self, tool: &ToolDescriptor) -> bool {
        self.server.as_ref().is_none_or(|s| *s == tool.server)
            && self
                .capability
                .is_none_or(|c| c.matches(&tool.annotations))
    }
}

/// Per-server outcome of a discovery pass.
#[derive(Debug, Default)]
pub struct RegistryReport {
    /// Tool count for every server that answered.
    pub refreshed: BTreeMap<String, usize>,
    pub failed: BTreeMap<String, ProtocolError>,
}

impl RegistryReport {
    pub fn total_tools(&self) -> usize {
        self.refreshed.values().sum()
    }
}

#[derive(Default)]
struct Catalog {
    tools: HashMap<String, Arc<ToolDescriptor>>,
    by_server: BTreeMap<String, Vec<Arc<ToolDescriptor>>>,
    generation: u64,
}

impl Catalog {
    fn build<'a>(tools: impl IntoIterator<Item = &'a Arc<ToolDescriptor>>, generation: u64) -> Self {
        let mut catalog = Catalog {
            generation,
            ..Catalog::default()
        };
        for tool in tools {
            if !tool.is_live() {
                continue;
            }
            catalog
                .tools
                .insert(tool.qualified_name.clone(), Arc::clone(tool));
            catalog
                .by_server
                .entry(tool.server.clone())
                .or_default()
                .push(Arc::clone(tool));
        }
        catalog
    }
}

pub struct ToolRegistry {
    catalog: ArcSwap<Catalog>,
    discovery_timeout: Duration,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::with_discovery_timeout(Duration::from_secs(15))
    }

    pub fn with_discovery_timeout(discovery_timeout: Duration) -> Self {
        Self {
            catalog: ArcSwap::from_pointee(Catalog::default()),
            discovery_timeout,
        }
    }

    /// Rediscover tools on every ready session and publish a new catalog.
    ///
    /// A server whose listing fails loses its tools until the next
    /// successful refresh.
    pub async fn refresh(&self, manager: &SessionManager) -> RegistryReport {
        let sessions = manager.ready_sessions();
        let deadline = Instant::now() + self.discovery_timeout;
        let listings = join_all(sessions.into_iter().map(|(name, session)| async move {
            let result = session.list_tools(deadline).await;
            (name, session, result)
        }))
        .await;

        let mut report = RegistryReport::default();
        let mut discovered = Vec::new();
        let mut listed = Vec::new();
        for (name, session, result) in listings {
            listed.push(Arc::clone(&session));
            match result {
                Ok(tools) => {
                    tracing::debug!("MCP server '{}' reported {} tools", name, tools.len());
                    report.refreshed.insert(name.clone(), tools.len());
                    discovered.extend(
                        tools
                            .into_iter()
                            .map(|tool| Arc::new(ToolDescriptor::new(&name, tool, &session))),
                    );
                }
                Err(e) => {
                    tracing::warn!("Failed to list tools from MCP server '{}': {}", name, e);
                    report.failed.insert(name, e);
                }
            }
        }

        // A session installed while this pass ran (a reconnect) has already
        // published its own tools; keep them.
        self.catalog.rcu(|current| {
            let untouched = current
                .tools
                .values()
                .filter(|t| !listed.iter().any(|session| t.belongs_to(session)));
            Catalog::build(untouched.chain(&discovered), current.generation + 1)
        });
        report
    }

    /// Rediscover one server's tools, leaving every other server untouched.
    pub async fn refresh_server(
        &self,
        manager: &SessionManager,
        server: &str,
    ) -> Result<usize, ProtocolError> {
        let Some(session) = manager.get_session(server) else {
            self.publish_server(server, &[]);
            return Err(ProtocolError::ConnectionLost(format!(
                "server '{server}' is not connected"
            )));
        };

        let deadline = Instant::now() + self.discovery_timeout;
        match session.list_tools(deadline).await {
            Ok(tools) => {
                let fresh: Vec<Arc<ToolDescriptor>> = tools
                    .into_iter()
                    .map(|tool| Arc::new(ToolDescriptor::new(server, tool, &session)))
                    .collect();
                self.publish_server(server, &fresh);
                Ok(fresh.len())
            }
            Err(e) => {
                self.publish_server(server, &[]);
                Err(e)
            }
        }
    }

    fn publish_server(&self, server: &str, fresh: &[Arc<ToolDescriptor>]) {
        self.catalog.rcu(|current| {
            let kept = current.tools.values().filter(|t| t.server != server);
            Catalog::build(kept.chain(fresh), current.generation + 1)
        });
    }

    /// Drop every tool bound to `session`.
    pub fn remove_session(&self, session: &Arc<McpSession>) {
        self.catalog.rcu(|current| {
            let kept = current.tools.values().filter(|t| !t.belongs_to(session));
            Catalog::build(kept, current.generation + 1)
        });
    }

    /// Look up a tool by qualified name.
    ///
    /// Tools of a session that has stopped being ready are never returned,
    /// even before the catalog without them is published.
    pub fn lookup(&self, qualified_name: &str) -> Option<Arc<ToolDescriptor>> {
        self.catalog
            .load()
            .tools
            .get(qualified_name)
            .filter(|tool| tool.is_live())
            .cloned()
    }

    /// Tools matching `filter`, ordered by qualified name.
    pub fn list(&self, filter: &ToolFilter) -> Vec<Arc<ToolDescriptor>> {
        let catalog = self.catalog.load();
        let mut tools: Vec<Arc<ToolDescriptor>> = match &filter.server {
            Some(server) => catalog.by_server.get(server).cloned().unwrap_or_default(),
            None => catalog.tools.values().cloned().collect(),
        };
        tools.retain(|tool| tool.is_live() && filter.matches(tool));
        tools.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        tools
    }

    /// Tool counts per server in the current catalog.
    pub fn servers(&self) -> BTreeMap<String, usize> {
        self.catalog
            .load()
            .by_server
            .iter()
            .map(|(server, tools)| {
                let live = tools.iter().filter(|t| t.is_live()).count();
                (server.clone(), live)
            })
            .filter(|(_, count)| *count > 0)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.catalog
            .load()
            .tools
            .values()
            .filter(|tool| tool.is_live())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Incremented on every published catalog.
    pub fn generation(&self) -> u64 {
        self.catalog.load().generation
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
