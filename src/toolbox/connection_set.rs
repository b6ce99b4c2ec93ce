//! Sessions and catalog of one open toolbox

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{RegisteredToolEntry, ToolFilter};
use crate::backend::{ServerSession, SessionState};
use crate::config::ToolboxConfig;
use crate::naming;
use crate::protocol::Tool;
use crate::transport::Connector;
use crate::{Error, Result};

/// Lifecycle state of a [`ToolboxConnectionSet`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolboxState {
    /// No sessions exist
    #[default]
    Closed,
    /// Sessions are being connected
    Opening,
    /// Catalog published
    Open,
    /// Sessions are being released
    Closing,
}

/// A server that could not contribute tools during open
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedServer {
    /// Server name
    pub server: String,
    /// Why it failed
    pub error: String,
}

/// Outcome of a successful open
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenReport {
    /// Exposed tools, in server then downstream order
    pub tools: Vec<RegisteredToolEntry>,
    /// Servers that failed to connect or list tools
    pub failed_servers: Vec<FailedServer>,
}

/// Connection state of one server, as reported to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    /// Server name
    pub name: String,
    /// Session state
    pub state: SessionState,
}

/// Tunables for opening sessions
#[derive(Debug, Clone, Copy)]
pub struct OpenSettings {
    /// Bound on one server's connect
    pub connect_timeout: Duration,
    /// Maximum simultaneous connects (0 = unlimited)
    pub max_concurrent_connects: usize,
}

/// The sessions of one toolbox and the merged catalog they expose
pub struct ToolboxConnectionSet {
    config: Arc<ToolboxConfig>,
    filter: ToolFilter,
    connector: Arc<dyn Connector>,
    settings: OpenSettings,
    state: RwLock<ToolboxState>,
    sessions: RwLock<Vec<Arc<ServerSession>>>,
    catalog: RwLock<Vec<RegisteredToolEntry>>,
    failed: RwLock<Vec<FailedServer>>,
}

impl ToolboxConnectionSet {
    /// Create a closed set for `config`
    pub fn new(
        config: Arc<ToolboxConfig>,
        connector: Arc<dyn Connector>,
        settings: OpenSettings,
    ) -> Result<Self> {
        let filter = ToolFilter::from_config(&config.tools)?;
        Ok(Self {
            config,
            filter,
            connector,
            settings,
            state: RwLock::new(ToolboxState::Closed),
            sessions: RwLock::new(Vec::new()),
            catalog: RwLock::new(Vec::new()),
            failed: RwLock::new(Vec::new()),
        })
    }

    /// Toolbox name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ToolboxState {
        *self.state.read()
    }

    /// Connect every server and publish the filtered catalog.
    ///
    /// Individual server failures do not fail the open; they are returned in
    /// [`OpenReport::failed_servers`].
    pub async fn open(&self) -> Result<OpenReport> {
        {
            let mut state = self.state.write();
            if *state != ToolboxState::Closed {
                return Err(Error::AlreadyOpen(self.config.name.clone()));
            }
            *state = ToolboxState::Opening;
        }

        let toolbox = self.config.name.as_str();
        info!(toolbox = %toolbox, servers = self.config.servers.len(), "Opening toolbox");

        let sessions: Vec<Arc<ServerSession>> = self
            .config
            .servers
            .iter()
            .map(|definition| {
                Arc::new(ServerSession::new(
                    toolbox,
                    definition.clone(),
                    Arc::clone(&self.connector),
                    self.settings.connect_timeout,
                ))
            })
            .collect();
        self.sessions.write().clone_from(&sessions);

        let limiter = (self.settings.max_concurrent_connects > 0)
            .then(|| Semaphore::new(self.settings.max_concurrent_connects));

        let outcomes = join_all(sessions.iter().map(|session| {
            let limiter = limiter.as_ref();
            async move {
                let _permit = match limiter {
                    Some(semaphore) => semaphore.acquire().await.ok(),
                    None => None,
                };
                session.connect().await?;
                session.list_tools().await
            }
        }))
        .await;

        let mut report = OpenReport::default();
        for (session, outcome) in sessions.iter().zip(outcomes) {
            match outcome {
                Ok(tools) => report.tools.extend(self.register(session.name(), tools)),
                Err(e) => {
                    let connected = session.state() == SessionState::Connected;
                    report.failed_servers.push(FailedServer {
                        server: session.name().to_string(),
                        error: e.to_string(),
                    });
                    // A session that connected but could not list tools is released
                    if connected {
                        if let Err(close_err) = session.close().await {
                            warn!(toolbox = %toolbox, server = %session.name(), error = %close_err, "Close after failed listing");
                        }
                    }
                }
            }
        }

        self.catalog.write().clone_from(&report.tools);
        self.failed.write().clone_from(&report.failed_servers);
        *self.state.write() = ToolboxState::Open;

        info!(
            toolbox = %toolbox,
            tools = report.tools.len(),
            failed = report.failed_servers.len(),
            "Toolbox open"
        );
        Ok(report)
    }

    /// Filter, deduplicate and rename one server's catalog
    fn register(&self, server: &str, tools: Vec<Tool>) -> Vec<RegisteredToolEntry> {
        let toolbox = self.config.name.as_str();
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(tools.len());

        for tool in tools {
            if !self.filter.is_allowed(&tool.name) {
                debug!(toolbox = %toolbox, server = %server, tool = %tool.name, "Tool filtered out");
                continue;
            }
            if !seen.insert(tool.name.clone()) {
                let err = Error::DuplicateTool {
                    toolbox: toolbox.to_string(),
                    server: server.to_string(),
                    name: tool.name.clone(),
                };
                warn!(error = %err, "Dropping duplicate tool");
                continue;
            }
            match naming::encode(toolbox, server, &tool.name) {
                Ok(qualified) => entries.push(RegisteredToolEntry::new(qualified, toolbox, server, tool)),
                Err(e) => warn!(toolbox = %toolbox, server = %server, error = %e, "Skipping unnamed tool"),
            }
        }

        entries
    }

    /// Release every session and discard the catalog.
    ///
    /// Session close errors are logged, never returned.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state == ToolboxState::Closed {
                return Err(Error::NotOpen(self.config.name.clone()));
            }
            *state = ToolboxState::Closing;
        }

        let sessions = std::mem::take(&mut *self.sessions.write());
        let results = join_all(sessions.iter().map(|session| session.close())).await;
        for (session, result) in sessions.iter().zip(results) {
            if let Err(e) = result {
                warn!(toolbox = %self.config.name, server = %session.name(), error = %e, "Session close failed");
            }
        }

        self.catalog.write().clear();
        self.failed.write().clear();
        *self.state.write() = ToolboxState::Closed;

        info!(toolbox = %self.config.name, "Toolbox closed");
        Ok(())
    }

    /// Session for `server`, if it belongs to this toolbox
    #[must_use]
    pub fn session(&self, server: &str) -> Option<Arc<ServerSession>> {
        self.sessions
            .read()
            .iter()
            .find(|s| s.name() == server)
            .cloned()
    }

    /// Catalog entry for a downstream tool, if exposed
    #[must_use]
    pub fn entry(&self, server: &str, name: &str) -> Option<RegisteredToolEntry> {
        self.catalog
            .read()
            .iter()
            .find(|e| e.server == server && e.original_name == name)
            .cloned()
    }

    /// Published catalog
    #[must_use]
    pub fn catalog(&self) -> Vec<RegisteredToolEntry> {
        self.catalog.read().clone()
    }

    /// Servers that failed during the last open
    #[must_use]
    pub fn failed_servers(&self) -> Vec<FailedServer> {
        self.failed.read().clone()
    }

    /// Per-server connection state
    #[must_use]
    pub fn server_statuses(&self) -> Vec<ServerStatus> {
        let failed = self.failed.read();
        self.sessions
            .read()
            .iter()
            .map(|session| {
                let state = if failed.iter().any(|f| f.server == session.name()) {
                    SessionState::Failed
                } else {
                    session.state()
                };
                ServerStatus {
                    name: session.name().to_string(),
                    state,
                }
            })
            .collect()
    }
}
