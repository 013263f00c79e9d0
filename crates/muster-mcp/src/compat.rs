//! Normalization of response shapes across MCP server implementations.
//!
//! Servers that speak the same protocol still disagree on details: optional
//! fields go missing and a few SDKs use different field names. Everything
//! tolerated here is listed in an explicit alias table; anything else is
//! treated as malformed.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Protocol versions this client speaks, newest first.
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// An alternate spelling of a field, and the server family that uses it.
#[derive(Debug, Clone, Copy)]
pub struct FieldAlias {
    pub canonical: &'static str,
    pub alias: &'static str,
    pub variant: &'static str,
}

/// Aliases accepted in `initialize` results.
pub const HANDSHAKE_ALIASES: &[FieldAlias] = &[
    FieldAlias {
        canonical: "protocolVersion",
        alias: "protocol_version",
        variant: "snake_case SDKs",
    },
    FieldAlias {
        canonical: "serverInfo",
        alias: "server_info",
        variant: "snake_case SDKs",
    },
];

/// Aliases accepted in `tools/list` results and tool entries.
pub const TOOL_ALIASES: &[FieldAlias] = &[
    FieldAlias {
        canonical: "inputSchema",
        alias: "input_schema",
        variant: "snake_case SDKs",
    },
    FieldAlias {
        canonical: "inputSchema",
        alias: "parameters",
        variant: "function-calling style servers",
    },
    FieldAlias {
        canonical: "nextCursor",
        alias: "next_cursor",
        variant: "snake_case SDKs",
    },
];

/// What the server says it can do, reduced to the parts the client uses.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerCapabilities {
    pub tools: bool,
    pub tools_list_changed: bool,
    pub resources: bool,
    pub prompts: bool,
    pub logging: bool,
    /// The capabilities object exactly as received.
    pub raw: Value,
}

/// Server identity from the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: "unknown".to_string(),
            version: "0.0.0".to_string(),
        }
    }
}

/// A normalized `initialize` result.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
    pub instructions: Option<String>,
}

/// Behavioral hints a server attaches to a tool.
///
/// Missing hints resolve to the protocol's defaults through the accessors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolAnnotations {
    pub title: Option<String>,
    pub read_only_hint: Option<bool>,
    pub destructive_hint: Option<bool>,
    pub idempotent_hint: Option<bool>,
    pub open_world_hint: Option<bool>,
}

impl ToolAnnotations {
    pub fn read_only(&self) -> bool {
        self.read_only_hint.unwrap_or(false)
    }

    pub fn destructive(&self) -> bool {
        !self.read_only() && self.destructive_hint.unwrap_or(true)
    }

    pub fn idempotent(&self) -> bool {
        self.read_only() || self.idempotent_hint.unwrap_or(false)
    }

    pub fn open_world(&self) -> bool {
        self.open_world_hint.unwrap_or(true)
    }
}

/// One tool as reported by a server, before qualification.
#[derive(Debug, Clone)]
pub struct RemoteTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub annotations: ToolAnnotations,
}

/// One page of a `tools/list` result.
#[derive(Debug, Clone, Default)]
pub struct ToolPage {
    pub tools: Vec<RemoteTool>,
    pub next_cursor: Option<String>,
}

fn default_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

fn field<'a>(object: &'a Map<String, Value>, canonical: &str, table: &[FieldAlias]) -> Option<&'a Value> {
    object.get(canonical).or_else(|| {
        table
            .iter()
            .filter(|a| a.canonical == canonical)
            .find_map(|a| object.get(a.alias))
    })
}

/// Pick the version to offer from those the caller supports.
///
/// Dated versions compare correctly as strings, so the newest is the maximum.
pub fn preferred_version(supported: &[String]) -> Option<&str> {
    supported.iter().map(String::as_str).max()
}

/// Accept the server's answered version only if we offered support for it.
pub fn negotiate_version(supported: &[String], server: &str) -> Result<String, ProtocolError> {
    if supported.iter().any(|v| v == server) {
        Ok(server.to_string())
    } else {
        Err(ProtocolError::VersionMismatch {
            offered: supported.to_vec(),
            server: server.to_string(),
        })
    }
}

/// Normalize an `initialize` result.
///
/// `protocolVersion` is the only required field; capabilities and server
/// identity fall back to empty defaults.
pub fn normalize_handshake(raw: &Value) -> Result<Handshake, ProtocolError> {
    let object = raw
        .as_object()
        .ok_or_else(|| ProtocolError::MalformedHandshake("result is not an object".to_string()))?;

    let protocol_version = field(object, "protocolVersion", HANDSHAKE_ALIASES)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProtocolError::MalformedHandshake("missing protocolVersion".to_string()))?
        .to_string();

    let capabilities = match object.get("capabilities") {
        Some(caps @ Value::Object(_)) => normalize_capabilities(caps),
        _ => {
            tracing::debug!("initialize result without capabilities, assuming none");
            ServerCapabilities {
                raw: json!({}),
                ..ServerCapabilities::default()
            }
        }
    };

    let server_info = field(object, "serverInfo", HANDSHAKE_ALIASES)
        .and_then(Value::as_object)
        .map(|info| ServerInfo {
            name: info
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            version: info
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or("0.0.0")
                .to_string(),
        })
        .unwrap_or_default();

    let instructions = object
        .get("instructions")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(Handshake {
        protocol_version,
        capabilities,
        server_info,
        instructions,
    })
}

fn normalize_capabilities(caps: &Value) -> ServerCapabilities {
    let present = |key: &str| matches!(caps.get(key), Some(Value::Object(_) | Value::Bool(true)));
    ServerCapabilities {
        tools: present("tools"),
        tools_list_changed: caps
            .pointer("/tools/listChanged")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        resources: present("resources"),
        prompts: present("prompts"),
        logging: present("logging"),
        raw: caps.clone(),
    }
}

/// Normalize one page of a `tools/list` result.
///
/// Entries without a usable name are skipped; a missing or non-object
/// schema becomes an empty object schema.
pub fn normalize_tool_list(raw: &Value) -> Result<ToolPage, ProtocolError> {
    let malformed = |reason: &str| ProtocolError::MalformedResponse {
        method: "tools/list".to_string(),
        reason: reason.to_string(),
    };

    let object = raw.as_object().ok_or_else(|| malformed("result is not an object"))?;
    let entries = object
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("missing tools array"))?;

    let tools = entries
        .iter()
        .filter_map(|entry| {
            let tool = normalize_tool(entry);
            if tool.is_none() {
                tracing::warn!("skipping tool entry without a name: {entry}");
            }
            tool
        })
        .collect();

    let next_cursor = field(object, "nextCursor", TOOL_ALIASES)
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    Ok(ToolPage { tools, next_cursor })
}

fn normalize_tool(entry: &Value) -> Option<RemoteTool> {
    let object = entry.as_object()?;
    let name = object.get("name").and_then(Value::as_str).filter(|n| !n.is_empty())?;

    let input_schema = match field(object, "inputSchema", TOOL_ALIASES) {
        Some(schema @ Value::Object(_)) => schema.clone(),
        Some(_) => {
            tracing::warn!(tool = %name, "tool schema is not an object, using empty schema");
            default_schema()
        }
        None => default_schema(),
    };

    let annotations = object
        .get("annotations")
        .and_then(Value::as_object)
        .map(|a| ToolAnnotations {
            title: a.get("title").and_then(Value::as_str).map(str::to_string),
            read_only_hint: a.get("readOnlyHint").and_then(Value::as_bool),
            destructive_hint: a.get("destructiveHint").and_then(Value::as_bool),
            idempotent_hint: a.get("idempotentHint").and_then(Value::as_bool),
            open_world_hint: a.get("openWorldHint").and_then(Value::as_bool),
        })
        .unwrap_or_default();

    Some(RemoteTool {
        name: name.to_string(),
        description: object
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        input_schema,
        annotations,
    })
}
