//! Stdio transport implementation (subprocess)

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use super::Transport;
use super::client::initialize_params;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId};
use crate::{Error, Result};

/// Stdio transport for subprocess MCP servers
pub struct StdioTransport {
    /// Child process
    child: Mutex<Option<Child>>,
    /// Pending requests waiting for response
    pending: DashMap<String, oneshot::Sender<JsonRpcResponse>>,
    /// Request ID counter
    request_id: AtomicU64,
    /// Connected flag
    connected: AtomicBool,
    /// Command line to execute
    command: String,
    /// Environment variables
    env: HashMap<String, String>,
    /// Working directory
    cwd: Option<String>,
    /// Per-request timeout
    timeout: Duration,
    /// Writer handle
    writer: Mutex<Option<ChildStdin>>,
}

impl StdioTransport {
    /// Create a new stdio transport
    #[must_use]
    pub fn new(
        command: &str,
        env: HashMap<String, String>,
        cwd: Option<String>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            child: Mutex::new(None),
            pending: DashMap::new(),
            request_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            command: command.to_string(),
            env,
            cwd,
            timeout,
            writer: Mutex::new(None),
        })
    }

    /// Spawn the subprocess and run the MCP handshake
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let parts = shlex::split(&self.command)
            .ok_or_else(|| Error::Config(format!("Unparseable command: {}", self.command)))?;
        let (program, args) = parts
            .split_first()
            .ok_or_else(|| Error::Config("Empty command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Transport(format!("Failed to spawn '{program}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("Failed to get stdout".to_string()))?;
        let stderr = child.stderr.take();

        *self.writer.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        // Reader task: route responses to their waiters. It holds only a weak
        // reference, so dropping the transport (even mid-handshake) drops the
        // child and kill_on_drop reaps it.
        let transport = Arc::downgrade(self);
        let command = self.command.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();

            while let Ok(Some(line)) = reader.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let Some(transport) = transport.upgrade() else {
                    break;
                };
                if let Err(e) = transport.handle_line(&line).await {
                    warn!(command = %command, error = %e, "Failed to handle message");
                }
            }

            if let Some(transport) = transport.upgrade() {
                transport.connected.store(false, Ordering::Relaxed);
                // Dropping the senders wakes every waiter with a closed channel
                transport.pending.clear();
            }
            debug!(command = %command, "Stdio reader task ended");
        });

        // Downstream stderr goes to our log
        if let Some(stderr) = stderr {
            let command = self.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(command = %command, "stderr: {line}");
                }
            });
        }

        self.initialize().await
    }

    /// Initialize the MCP connection
    async fn initialize(&self) -> Result<()> {
        let response = self
            .request(
                "initialize",
                Some(initialize_params(PROTOCOL_VERSION)),
            )
            .await?;

        if let Some(error) = response.error {
            return Err(Error::Protocol(format!(
                "Initialize failed: {}",
                error.message
            )));
        }

        self.notify("notifications/initialized", None).await?;

        self.connected.store(true, Ordering::Relaxed);
        debug!(command = %self.command, "Stdio transport initialized");

        Ok(())
    }

    /// Handle one line from the server's stdout
    async fn handle_line(&self, line: &str) -> Result<()> {
        let message: Value = serde_json::from_str(line)?;

        if let Some(method) = message.get("method").and_then(Value::as_str) {
            // Server-initiated traffic. Only `ping` needs an answer.
            if let Some(id) = message.get("id") {
                let reply = if method == "ping" {
                    json!({"jsonrpc": "2.0", "id": id, "result": {}})
                } else {
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32601, "message": format!("Method not supported: {method}")}
                    })
                };
                self.write_message(&reply.to_string()).await?;
            } else {
                debug!(command = %self.command, method = %method, "Ignoring server notification");
            }
            return Ok(());
        }

        let response: JsonRpcResponse = serde_json::from_value(message)?;
        if let Some(ref id) = response.id {
            if let Some((_, sender)) = self.pending.remove(&id.to_string()) {
                let _ = sender.send(response);
            }
        }

        Ok(())
    }

    /// Write a message to stdin
    async fn write_message(&self, message: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(ref mut stdin) = *writer else {
            return Err(Error::Transport("Not connected".to_string()));
        };
        stdin
            .write_all(message.as_bytes())
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    /// Get next request ID
    fn next_id(&self) -> RequestId {
        RequestId::Number(i64::try_from(self.request_id.fetch_add(1, Ordering::Relaxed)).unwrap_or(i64::MAX))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = self.next_id();
        let key = id.to_string();
        let request = JsonRpcRequest::new(id, method, params);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(key.clone(), tx);

        let message = serde_json::to_string(&request)?;
        if let Err(e) = self.write_message(&message).await {
            self.pending.remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Transport("Server closed the connection".to_string())),
            Err(_) => {
                self.pending.remove(&key);
                Err(Error::BackendTimeout(format!(
                    "{method} timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        let message = serde_json::to_string(&notification)?;
        self.write_message(&message).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);

        // Closing stdin asks well-behaved servers to exit
        *self.writer.lock().await = None;

        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        self.pending.clear();

        Ok(())
    }
}
