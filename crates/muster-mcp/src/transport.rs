//! Stdio transport for MCP server communication.
//!
//! Spawns a child process and frames newline-delimited JSON over its
//! stdin/stdout. The [`Transport`] trait is the seam the session is built
//! on, so tests can swap the child process for an in-memory peer.

use crate::config::ServerConfig;
use crate::error::{ConnectError, TransportError};
use serde_json::Value;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Consecutive unparsable frames tolerated before the stream is declared desynced.
pub const MAX_MALFORMED_FRAMES: u32 = 3;

/// `PATH` handed to children when the parent has none.
const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Boxed future returned by [`Transport`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A framed, bidirectional JSON message stream to one server.
///
/// `read_message` is only ever called from one task at a time (the session
/// reader); `write_message` may be called concurrently.
pub trait Transport: Send + Sync {
    /// Write one complete message.
    fn write_message<'a>(&'a self, message: &'a Value)
    -> TransportFuture<'a, Result<(), TransportError>>;

    /// Wait for the next complete message.
    fn read_message(&self) -> TransportFuture<'_, Result<Value, TransportError>>;

    /// Release the underlying resources. Safe to call more than once.
    fn close(&self) -> TransportFuture<'_, ()>;
}

struct WriteJob {
    line: String,
    done: oneshot::Sender<io::Result<()>>,
}

struct FrameReader {
    lines: Lines<BufReader<ChildStdout>>,
    consecutive_malformed: u32,
    desynced: bool,
    eof: bool,
}

/// Async stdio transport for communicating with an MCP server process.
pub struct StdioTransport {
    name: String,
    connection_id: Uuid,
    write_tx: std::sync::Mutex<Option<mpsc::Sender<WriteJob>>>,
    reader: Mutex<FrameReader>,
    child: Arc<Mutex<Child>>,
    writer_handle: JoinHandle<()>,
    stderr_handle: JoinHandle<()>,
    closed: AtomicBool,
    shutdown_grace: Duration,
}

impl StdioTransport {
    /// Spawn a child process and start the background writer.
    ///
    /// The child inherits only `PATH` and the variables listed in the
    /// config. Must be called from within a tokio runtime.
    pub fn spawn(name: &str, config: &ServerConfig) -> Result<Self, ConnectError> {
        let path = std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string());

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .env_clear()
            .env("PATH", path)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ConnectError::PathNotFound {
                name: name.to_string(),
                command: config.command.clone(),
            },
            _ => ConnectError::SpawnFailed {
                name: name.to_string(),
                source: e,
            },
        })?;

        let missing = |stream: &str| ConnectError::SpawnFailed {
            name: name.to_string(),
            source: io::Error::other(format!("child {stream} was not captured")),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let connection_id = Uuid::new_v4();

        // Writer task: drains channel and writes to child stdin, reporting
        // each outcome back to the caller.
        let (write_tx, mut write_rx) = mpsc::channel::<WriteJob>(64);
        let writer_handle = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(job) = write_rx.recv().await {
                let result = async {
                    stdin.write_all(job.line.as_bytes()).await?;
                    stdin.flush().await
                }
                .await;
                let failed = result.is_err();
                let _ = job.done.send(result);
                if failed {
                    break;
                }
            }
        });

        // Stderr is diagnostic only; forward it to the log.
        let server = name.to_string();
        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(server = %server, "stderr: {line}");
            }
        });

        tracing::debug!(
            server = %name,
            connection = %connection_id,
            command = %config.command,
            "spawned MCP server process"
        );

        Ok(Self {
            name: name.to_string(),
            connection_id,
            write_tx: std::sync::Mutex::new(Some(write_tx)),
            reader: Mutex::new(FrameReader {
                lines: BufReader::new(stdout).lines(),
                consecutive_malformed: 0,
                desynced: false,
                eof: false,
            }),
            child: Arc::new(Mutex::new(child)),
            writer_handle,
            stderr_handle,
            closed: AtomicBool::new(false),
            shutdown_grace: Duration::from_secs(5),
        })
    }

    /// How long `close` waits for the child to exit before killing it.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Identifier distinguishing this process from earlier ones for the same server.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    fn writer(&self) -> Option<mpsc::Sender<WriteJob>> {
        self.write_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn take_writer(&self) -> Option<mpsc::Sender<WriteJob>> {
        self.write_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    async fn write_line(&self, message: &Value) -> Result<(), TransportError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let writer = self.writer().ok_or(TransportError::BrokenPipe)?;
        let (done, outcome) = oneshot::channel();
        writer
            .send(WriteJob { line, done })
            .await
            .map_err(|_| TransportError::BrokenPipe)?;

        match outcome.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => Err(TransportError::BrokenPipe),
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(TransportError::BrokenPipe),
        }
    }

    async fn next_frame(&self) -> Result<Value, TransportError> {
        let mut reader = self.reader.lock().await;
        if reader.desynced || reader.eof {
            return Err(TransportError::Eof);
        }

        loop {
            let line = match reader.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    // The server is gone; later writes must not reach a dead pipe.
                    reader.eof = true;
                    drop(self.take_writer());
                    return Err(TransportError::Eof);
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    if let Some(err) = self.record_malformed(&mut reader, e.to_string()).await {
                        return Err(err);
                    }
                    continue;
                }
                Err(e) => return Err(TransportError::Io(e)),
            };

            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(&line) {
                Ok(frame) => {
                    reader.consecutive_malformed = 0;
                    return Ok(frame);
                }
                Err(e) => {
                    if let Some(err) = self.record_malformed(&mut reader, e.to_string()).await {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Count a bad frame; after too many in a row, tear the process down.
    async fn record_malformed(
        &self,
        reader: &mut FrameReader,
        error: String,
    ) -> Option<TransportError> {
        reader.consecutive_malformed += 1;
        tracing::warn!(
            server = %self.name,
            consecutive = reader.consecutive_malformed,
            "skipping malformed frame: {error}"
        );
        if reader.consecutive_malformed < MAX_MALFORMED_FRAMES {
            return None;
        }

        reader.desynced = true;
        tracing::warn!(server = %self.name, "protocol desync, closing transport");
        drop(self.take_writer());
        let _ = self.child.lock().await.start_kill();
        Some(TransportError::MalformedFrame {
            consecutive: reader.consecutive_malformed,
            last_error: error,
        })
    }

    /// Shut down the transport: drop the write channel, wait briefly, then kill.
    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Dropping the write channel closes the child's stdin.
        drop(self.take_writer());

        let child = Arc::clone(&self.child);
        let graceful = tokio::time::timeout(self.shutdown_grace, async {
            let mut child = child.lock().await;
            let _ = child.wait().await;
        })
        .await;

        if graceful.is_err() {
            tracing::debug!(server = %self.name, "grace period elapsed, killing process");
            let mut child = self.child.lock().await;
            let _ = child.kill().await;
        }

        self.writer_handle.abort();
        self.stderr_handle.abort();
        tracing::debug!(server = %self.name, connection = %self.connection_id, "transport closed");
    }
}

impl Transport for StdioTransport {
    fn write_message<'a>(
        &'a self,
        message: &'a Value,
    ) -> TransportFuture<'a, Result<(), TransportError>> {
        Box::pin(self.write_line(message))
    }

    fn read_message(&self) -> TransportFuture<'_, Result<Value, TransportError>> {
        Box::pin(self.next_frame())
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(self.shutdown())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // The child itself is killed by `kill_on_drop`.
        self.writer_handle.abort();
        self.stderr_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn shell(script: &str) -> ServerConfig {
        ServerConfig::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn spawn_echo_process() {
        let transport = StdioTransport::spawn("cat", &ServerConfig::new("cat", vec![]));
        assert!(transport.is_ok());
        transport.unwrap().close().await;
    }

    #[tokio::test]
    async fn spawn_nonexistent_command_fails() {
        let config = ServerConfig::new("this_command_does_not_exist_xyz123", vec![]);
        match StdioTransport::spawn("ghost", &config) {
            Err(ConnectError::PathNotFound { name, command }) => {
                assert_eq!(name, "ghost");
                assert_eq!(command, "this_command_does_not_exist_xyz123");
            }
            Err(other) => panic!("Expected PathNotFound, got: {other:?}"),
            Ok(_) => panic!("Expected error, got Ok"),
        }
    }

    #[tokio::test]
    async fn write_then_read_through_cat() {
        let transport = StdioTransport::spawn("cat", &ServerConfig::new("cat", vec![])).unwrap();
        let message = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});

        transport.write_message(&message).await.unwrap();
        let echoed = transport.read_message().await.unwrap();
        assert_eq!(echoed, message);

        transport.close().await;
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let config = shell(r#"echo 'not json'; echo; echo '{"ok":true}'"#);
        let transport = StdioTransport::spawn("noisy", &config).unwrap();

        let frame = transport.read_message().await.unwrap();
        assert_eq!(frame["ok"], true);
        transport.close().await;
    }

    #[tokio::test]
    async fn three_malformed_frames_desync_the_stream() {
        let config = shell("echo one; echo two; echo three; echo '{\"late\":1}'; sleep 5");
        let transport = StdioTransport::spawn("garbled", &config).unwrap();

        match transport.read_message().await {
            Err(TransportError::MalformedFrame { consecutive, .. }) => assert_eq!(consecutive, 3),
            other => panic!("Expected MalformedFrame, got: {other:?}"),
        }
        assert!(matches!(
            transport.read_message().await,
            Err(TransportError::Eof)
        ));
        transport.close().await;
    }

    #[tokio::test]
    async fn eof_when_child_exits() {
        let transport = StdioTransport::spawn("true", &ServerConfig::new("true", vec![])).unwrap();
        assert!(matches!(
            transport.read_message().await,
            Err(TransportError::Eof)
        ));
        transport.close().await;
    }

    #[tokio::test]
    async fn write_after_exit_is_broken_pipe() {
        let transport = StdioTransport::spawn("true", &ServerConfig::new("true", vec![])).unwrap();
        assert!(matches!(
            transport.read_message().await,
            Err(TransportError::Eof)
        ));

        for _ in 0..3 {
            let result = transport.write_message(&json!({"jsonrpc": "2.0"})).await;
            assert!(
                matches!(result, Err(TransportError::BrokenPipe)),
                "got {result:?}"
            );
        }
        assert!(matches!(
            transport.read_message().await,
            Err(TransportError::Eof)
        ));
        transport.close().await;
    }

    #[tokio::test]
    async fn write_after_close_is_broken_pipe() {
        let transport = StdioTransport::spawn("cat", &ServerConfig::new("cat", vec![])).unwrap();
        transport.close().await;
        let result = transport.write_message(&json!({})).await;
        assert!(matches!(result, Err(TransportError::BrokenPipe)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let transport = StdioTransport::spawn("cat", &ServerConfig::new("cat", vec![])).unwrap();
        transport.close().await;
        transport.close().await;
    }

    #[tokio::test]
    async fn close_kills_after_grace_period() {
        let transport = StdioTransport::spawn("sleeper", &ServerConfig::new("sleep", vec!["30".into()]))
            .unwrap()
            .with_shutdown_grace(Duration::from_millis(100));

        let started = std::time::Instant::now();
        transport.close().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn child_sees_only_listed_environment() {
        let mut config = shell(r#"printf '{"custom":"%s","path_set":%s}\n' "$CUSTOM" "$([ -n "$PATH" ] && echo true || echo false)""#);
        config.env = HashMap::from([("CUSTOM".to_string(), "yes".to_string())]);
        let transport = StdioTransport::spawn("env", &config).unwrap();

        let frame = transport.read_message().await.unwrap();
        assert_eq!(frame["custom"], "yes");
        assert_eq!(frame["path_set"], true);
        transport.close().await;
    }
}
