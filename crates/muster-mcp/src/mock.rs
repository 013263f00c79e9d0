//! In-memory MCP peer used by unit tests.
//!
//! A `MockTransport` answers requests through a handler closure, records
//! every message the client writes, and can be killed to simulate a crash.

use crate::compat::SUPPORTED_VERSIONS;
use crate::config::ServerConfig;
use crate::error::{ConnectError, TransportError};
use crate::manager::Connector;
use crate::session::{ClientInfo, McpSession};
use crate::transport::{Transport, TransportFuture};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How the mock answers one request.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Result(Value),
    Error(i64, String),
    Delayed(Duration, Box<Reply>),
    Silent,
}

type Handler = Arc<dyn Fn(&str, &Value) -> Reply + Send + Sync>;

pub(crate) struct MockTransport {
    inbound_tx: mpsc::UnboundedSender<Value>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
    handler: Handler,
    writes: Mutex<Vec<Value>>,
    killed: CancellationToken,
}

/// Replies of a well-behaved server exposing `tools`.
///
/// `tools/call` echoes `arguments.text` back as text content.
pub(crate) fn standard_reply(method: &str, params: &Value, tools: &Value) -> Reply {
    match method {
        "initialize" => Reply::Result(json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {"tools": {"listChanged": true}},
            "serverInfo": {"name": "mock", "version": "1.0.0"}
        })),
        "tools/list" => Reply::Result(json!({ "tools": tools })),
        "tools/call" => Reply::Result(json!({
            "content": [{"type": "text", "text": params["arguments"]["text"].clone()}]
        })),
        "ping" => Reply::Result(json!({})),
        other => Reply::Error(-32601, format!("Method not found: {other}")),
    }
}

/// The `echo` tool schema used across tests.
pub(crate) fn echo_tools() -> Value {
    json!([{
        "name": "echo",
        "description": "Echo text back",
        "inputSchema": {
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        }
    }])
}

impl MockTransport {
    pub(crate) fn new(
        handler: impl Fn(&str, &Value) -> Reply + Send + Sync + 'static,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            handler: Arc::new(handler),
            writes: Mutex::new(Vec::new()),
            killed: CancellationToken::new(),
        })
    }

    /// A well-behaved server exposing `tools`.
    pub(crate) fn server(tools: Value) -> Arc<Self> {
        Self::new(move |method, params| standard_reply(method, params, &tools))
    }

    /// Everything the client has written so far.
    pub(crate) fn writes(&self) -> Vec<Value> {
        self.writes.lock().unwrap().clone()
    }

    /// Number of writes with the given method.
    pub(crate) fn count(&self, method: &str) -> usize {
        self.writes()
            .iter()
            .filter(|w| w["method"] == method)
            .count()
    }

    /// Deliver a frame to the client as if the server had sent it.
    pub(crate) fn push(&self, frame: Value) {
        let _ = self.inbound_tx.send(frame);
    }

    /// Simulate the server process dying.
    pub(crate) fn kill(&self) {
        self.killed.cancel();
    }

    fn schedule(&self, id: Value, reply: Reply) {
        match reply {
            Reply::Result(result) => {
                self.push(json!({"jsonrpc": "2.0", "id": id, "result": result}));
            }
            Reply::Error(code, message) => {
                self.push(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": code, "message": message}
                }));
            }
            Reply::Delayed(delay, inner) => {
                let tx = self.inbound_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let frame = match *inner {
                        Reply::Result(result) => {
                            json!({"jsonrpc": "2.0", "id": id, "result": result})
                        }
                        Reply::Error(code, message) => json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": {"code": code, "message": message}
                        }),
                        Reply::Delayed(..) | Reply::Silent => return,
                    };
                    let _ = tx.send(frame);
                });
            }
            Reply::Silent => {}
        }
    }
}

impl Transport for MockTransport {
    fn write_message<'a>(
        &'a self,
        message: &'a Value,
    ) -> TransportFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            if self.killed.is_cancelled() {
                return Err(TransportError::BrokenPipe);
            }
            self.writes.lock().unwrap().push(message.clone());

            if let (Some(method), Some(id)) = (message["method"].as_str(), message.get("id")) {
                let reply = (self.handler)(method, &message["params"]);
                self.schedule(id.clone(), reply);
            }
            Ok(())
        })
    }

    fn read_message(&self) -> TransportFuture<'_, Result<Value, TransportError>> {
        Box::pin(async move {
            let mut rx = self.inbound_rx.lock().await;
            tokio::select! {
                biased;
                () = self.killed.cancelled() => Err(TransportError::Eof),
                frame = rx.recv() => frame.ok_or(TransportError::Eof),
            }
        })
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move { self.killed.cancel() })
    }
}

/// Start a session over `transport` and complete the handshake.
pub(crate) async fn ready_session(name: &str, transport: Arc<MockTransport>) -> Arc<McpSession> {
    let session = McpSession::start(name, transport);
    let versions: Vec<String> = SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect();
    session
        .initialize(&ClientInfo::default(), &versions, Duration::from_secs(1))
        .await
        .unwrap();
    session
}

/// Connector handing out mock transports by server name.
///
/// Servers whose command is `missing` fail to spawn; every successful
/// connect creates a fresh transport from the server's factory.
pub(crate) struct MockConnector {
    factories: Mutex<HashMap<String, Arc<dyn Fn() -> Arc<MockTransport> + Send + Sync>>>,
    pub(crate) transports: Mutex<HashMap<String, Arc<MockTransport>>>,
    pub(crate) connects: AtomicUsize,
}

impl MockConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            factories: Mutex::new(HashMap::new()),
            transports: Mutex::new(HashMap::new()),
            connects: AtomicUsize::new(0),
        })
    }

    pub(crate) fn serve(
        &self,
        name: &str,
        factory: impl Fn() -> Arc<MockTransport> + Send + Sync + 'static,
    ) {
        self.factories
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(factory));
    }

    /// The most recent transport handed out for `name`.
    pub(crate) fn transport(&self, name: &str) -> Arc<MockTransport> {
        Arc::clone(&self.transports.lock().unwrap()[name])
    }
}

impl Connector for MockConnector {
    fn connect<'a>(
        &'a self,
        name: &'a str,
        config: &'a ServerConfig,
    ) -> TransportFuture<'a, Result<Arc<dyn Transport>, ConnectError>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if config.command == "missing" {
                return Err(ConnectError::PathNotFound {
                    name: name.to_string(),
                    command: config.command.clone(),
                });
            }
            let factory = self.factories.lock().unwrap().get(name).cloned();
            let transport = match factory {
                Some(factory) => factory(),
                None => MockTransport::server(echo_tools()),
            };
            self.transports
                .lock()
                .unwrap()
                .insert(name.to_string(), Arc::clone(&transport));
            Ok(transport as Arc<dyn Transport>)
        })
    }
}
