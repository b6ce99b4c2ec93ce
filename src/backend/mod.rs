//! Downstream server sessions
//!
//! A [`ServerSession`] owns the lazy connection to one downstream server of
//! one toolbox, plus the last catalog fetched from it.
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected
//!                           Connecting --err-> Failed
//! Connected --transport error--> Failed
//! Connected | Failed --close--> Disconnected
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ServerDefinition;
use crate::protocol::Tool;
use crate::transport::{Connector, DownstreamSession};
use crate::{Error, Result};

/// Connection state of a [`ServerSession`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No connection held
    #[default]
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// Initialized and usable
    Connected,
    /// Last connect attempt or operation hit a transport failure
    Failed,
}

#[derive(Default)]
struct Inner {
    state: SessionState,
    client: Option<Arc<dyn DownstreamSession>>,
    catalog: Vec<Tool>,
    last_error: Option<String>,
}

/// Lazy connection to one downstream server
pub struct ServerSession {
    toolbox: String,
    definition: ServerDefinition,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    inner: RwLock<Inner>,
    /// Serializes connect attempts and close
    connect_gate: Mutex<()>,
    /// Completed connect attempts, successful or not
    attempts: AtomicU64,
}

/// Resets a session to `Disconnected` if a connect future is dropped mid-flight
struct ConnectGuard<'a> {
    session: &'a ServerSession,
    armed: bool,
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.session.inner.write();
            inner.state = SessionState::Disconnected;
            inner.client = None;
            debug!(
                toolbox = %self.session.toolbox,
                server = %self.session.definition.name,
                "Connect attempt cancelled"
            );
        }
    }
}

impl ServerSession {
    /// Create a disconnected session
    #[must_use]
    pub fn new(
        toolbox: &str,
        definition: ServerDefinition,
        connector: Arc<dyn Connector>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            toolbox: toolbox.to_string(),
            definition,
            connector,
            connect_timeout,
            inner: RwLock::new(Inner::default()),
            connect_gate: Mutex::new(()),
            attempts: AtomicU64::new(0),
        }
    }

    /// Owning toolbox
    #[must_use]
    pub fn toolbox(&self) -> &str {
        &self.toolbox
    }

    /// Server name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.read().state
    }

    /// Message of the last failure, if the session is `Failed`
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.read().last_error.clone()
    }

    /// Tools fetched by the last successful [`list_tools`](Self::list_tools)
    #[must_use]
    pub fn catalog(&self) -> Vec<Tool> {
        self.inner.read().catalog.clone()
    }

    /// Establish the connection.
    ///
    /// Returns immediately when already connected. Concurrent callers share
    /// one attempt: whoever waited on an in-flight attempt gets its outcome
    /// instead of starting another one.
    pub async fn connect(&self) -> Result<()> {
        if self.state() == SessionState::Connected {
            return Ok(());
        }

        let observed = self.attempts.load(Ordering::Acquire);
        let _gate = self.connect_gate.lock().await;

        {
            let inner = self.inner.read();
            match inner.state {
                SessionState::Connected => return Ok(()),
                SessionState::Failed if self.attempts.load(Ordering::Acquire) != observed => {
                    return Err(self.connection_error(
                        inner.last_error.clone().unwrap_or_default(),
                    ));
                }
                _ => {}
            }
        }

        let stale = {
            let mut inner = self.inner.write();
            inner.state = SessionState::Connecting;
            inner.last_error = None;
            inner.client.take()
        };
        let mut guard = ConnectGuard {
            session: self,
            armed: true,
        };
        if let Some(stale) = stale {
            if let Err(e) = stale.close().await {
                warn!(
                    toolbox = %self.toolbox,
                    server = %self.definition.name,
                    error = %e,
                    "Closing stale connection failed"
                );
            }
        }

        let outcome = match tokio::time::timeout(
            self.connect_timeout,
            self.connector.connect(&self.toolbox, &self.definition),
        )
        .await
        {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.connect_timeout)),
        };

        guard.armed = false;
        self.attempts.fetch_add(1, Ordering::AcqRel);

        match outcome {
            Ok(client) => {
                let mut inner = self.inner.write();
                inner.state = SessionState::Connected;
                inner.client = Some(client);
                info!(toolbox = %self.toolbox, server = %self.definition.name, "Server connected");
                Ok(())
            }
            Err(cause) => {
                {
                    let mut inner = self.inner.write();
                    inner.state = SessionState::Failed;
                    inner.last_error = Some(cause.clone());
                }
                telemetry_metrics::counter!(
                    "connect_failures_total",
                    "toolbox" => self.toolbox.clone(),
                    "server" => self.definition.name.clone()
                )
                .increment(1);
                warn!(
                    toolbox = %self.toolbox,
                    server = %self.definition.name,
                    error = %cause,
                    "Server connect failed"
                );
                Err(self.connection_error(cause))
            }
        }
    }

    /// Fetch and store the server's full catalog
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let client = self.connected_client()?;
        match client.list_tools().await {
            Ok(tools) => {
                debug!(
                    toolbox = %self.toolbox,
                    server = %self.definition.name,
                    count = tools.len(),
                    "Fetched tool catalog"
                );
                self.inner.write().catalog.clone_from(&tools);
                Ok(tools)
            }
            Err(e) => Err(self.observe_failure(e)),
        }
    }

    /// Invoke a tool, returning the downstream result untouched
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let client = self.connected_client()?;
        client
            .call_tool(name, arguments)
            .await
            .map_err(|e| self.observe_failure(e))
    }

    /// Release the connection, from any state
    pub async fn close(&self) -> Result<()> {
        let _gate = self.connect_gate.lock().await;
        let client = {
            let mut inner = self.inner.write();
            inner.state = SessionState::Disconnected;
            inner.catalog.clear();
            inner.last_error = None;
            inner.client.take()
        };

        match client {
            Some(client) => {
                debug!(toolbox = %self.toolbox, server = %self.definition.name, "Closing session");
                client.close().await
            }
            None => Ok(()),
        }
    }

    fn connected_client(&self) -> Result<Arc<dyn DownstreamSession>> {
        let client = {
            let inner = self.inner.read();
            match (inner.state, &inner.client) {
                (SessionState::Connected, Some(client)) => Arc::clone(client),
                _ => return Err(self.not_connected()),
            }
        };

        if !client.is_connected() {
            self.mark_failed("connection lost".to_string());
            return Err(self.not_connected());
        }
        Ok(client)
    }

    /// Transport failures poison the session; protocol errors do not
    fn observe_failure(&self, error: Error) -> Error {
        if error.is_transport_failure() {
            self.mark_failed(error.to_string());
        }
        error
    }

    fn mark_failed(&self, cause: String) {
        warn!(
            toolbox = %self.toolbox,
            server = %self.definition.name,
            error = %cause,
            "Session failed"
        );
        let mut inner = self.inner.write();
        if inner.state == SessionState::Connected {
            inner.state = SessionState::Failed;
            inner.last_error = Some(cause);
        }
    }

    fn connection_error(&self, cause: String) -> Error {
        Error::Connection {
            toolbox: self.toolbox.clone(),
            server: self.definition.name.clone(),
            cause,
        }
    }

    fn not_connected(&self) -> Error {
        Error::NotConnected {
            toolbox: self.toolbox.clone(),
            server: self.definition.name.clone(),
        }
    }
}
