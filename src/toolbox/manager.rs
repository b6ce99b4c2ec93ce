//! Process-wide table of toolboxes

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{OpenReport, OpenSettings, RegisteredToolEntry, ServerStatus, ToolboxConnectionSet, ToolboxState};
use crate::config::{SessionConfig, ToolboxConfig};
use crate::transport::Connector;
use crate::{Error, Result};

/// One row of `list_toolboxes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolboxStatus {
    /// Toolbox name
    pub name: String,
    /// `open` or `closed`
    pub state: ToolboxState,
    /// Operator-supplied description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Per-server state, empty while closed
    pub servers: Vec<ServerStatus>,
}

/// Sets that are open, and the qualified names they registered
#[derive(Default)]
struct OpenTable {
    sets: HashMap<String, Arc<ToolboxConnectionSet>>,
    registry: BTreeMap<String, RegisteredToolEntry>,
}

/// Releases a half-opened set when `open` is dropped before it finishes
struct OpenRollback {
    set: Option<Arc<ToolboxConnectionSet>>,
}

impl Drop for OpenRollback {
    fn drop(&mut self) {
        let Some(set) = self.set.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(toolbox = %set.name(), "Open cancelled, releasing sessions");
                handle.spawn(async move {
                    if let Err(e) = set.close().await {
                        warn!(toolbox = %set.name(), error = %e, "Rollback close failed");
                    }
                });
            }
            Err(_) => warn!(toolbox = %set.name(), "Open cancelled outside a runtime"),
        }
    }
}

/// Owns every toolbox for the lifetime of the process.
///
/// Nothing connects until a toolbox is opened. `open` and `close` of the same
/// toolbox are serialized by a per-toolbox lock; different toolboxes never
/// wait on each other. The table lock is only held to insert, remove or look
/// up, never across a connect.
pub struct ToolboxManager {
    configs: Vec<Arc<ToolboxConfig>>,
    lifecycle: HashMap<String, Mutex<()>>,
    table: RwLock<OpenTable>,
    connector: Arc<dyn Connector>,
    settings: OpenSettings,
}

impl ToolboxManager {
    /// Create a manager for the configured toolboxes
    #[must_use]
    pub fn new(
        toolboxes: Vec<ToolboxConfig>,
        sessions: &SessionConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let lifecycle = toolboxes
            .iter()
            .map(|t| (t.name.clone(), Mutex::new(())))
            .collect();
        Self {
            configs: toolboxes.into_iter().map(Arc::new).collect(),
            lifecycle,
            table: RwLock::new(OpenTable::default()),
            connector,
            settings: OpenSettings {
                connect_timeout: sessions.connect_timeout,
                max_concurrent_connects: sessions.max_concurrent_connects,
            },
        }
    }

    fn config(&self, name: &str) -> Result<&Arc<ToolboxConfig>> {
        self.configs
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::ToolboxNotFound(name.to_string()))
    }

    fn lifecycle_lock(&self, name: &str) -> Result<&Mutex<()>> {
        self.lifecycle
            .get(name)
            .ok_or_else(|| Error::ToolboxNotFound(name.to_string()))
    }

    /// Open a configured toolbox.
    ///
    /// Fails with `ToolboxNotFound` for unknown names and `AlreadyOpen` when
    /// it is open already. If the returned future is dropped mid-open the
    /// toolbox stays closed and sessions that already connected are closed
    /// in the background.
    pub async fn open(&self, name: &str) -> Result<OpenReport> {
        let config = Arc::clone(self.config(name)?);
        let _lifecycle = self.lifecycle_lock(name)?.lock().await;

        if self.table.read().sets.contains_key(name) {
            return Err(Error::AlreadyOpen(name.to_string()));
        }

        let set = Arc::new(ToolboxConnectionSet::new(
            config,
            Arc::clone(&self.connector),
            self.settings,
        )?);
        let mut rollback = OpenRollback {
            set: Some(Arc::clone(&set)),
        };
        let report = set.open().await?;
        rollback.set = None;

        let mut table = self.table.write();
        for entry in &report.tools {
            table
                .registry
                .insert(entry.qualified_name.clone(), entry.clone());
        }
        table.sets.insert(name.to_string(), set);
        debug!(toolbox = %name, registered = report.tools.len(), "Toolbox registered");

        Ok(report)
    }

    /// Close a toolbox.
    ///
    /// Returns `false` when it was already closed. Unknown names fail with
    /// `ToolboxNotFound`.
    pub async fn close(&self, name: &str) -> Result<bool> {
        let _lifecycle = self.lifecycle_lock(name)?.lock().await;

        let set = {
            let mut table = self.table.write();
            table.registry.retain(|_, entry| entry.toolbox != name);
            table.sets.remove(name)
        };

        let Some(set) = set else {
            return Ok(false);
        };
        if let Err(e) = set.close().await {
            warn!(toolbox = %name, error = %e, "Toolbox close reported an error");
        }
        Ok(true)
    }

    /// Close every open toolbox
    pub async fn close_all(&self) {
        let open: Vec<String> = self.table.read().sets.keys().cloned().collect();
        futures::future::join_all(open.iter().map(|name| self.close(name))).await;
    }

    /// Open set for `name`, if any
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ToolboxConnectionSet>> {
        self.table.read().sets.get(name).cloned()
    }

    /// Whether `name` is a configured toolbox
    #[must_use]
    pub fn is_configured(&self, name: &str) -> bool {
        self.lifecycle.contains_key(name)
    }

    /// Registered entry for a qualified tool name
    #[must_use]
    pub fn route(&self, qualified_name: &str) -> Option<RegisteredToolEntry> {
        self.table.read().registry.get(qualified_name).cloned()
    }

    /// Every registered entry, ordered by qualified name
    #[must_use]
    pub fn registered(&self) -> Vec<RegisteredToolEntry> {
        self.table.read().registry.values().cloned().collect()
    }

    /// Status of every configured toolbox, in configuration order
    #[must_use]
    pub fn list(&self) -> Vec<ToolboxStatus> {
        let table = self.table.read();
        self.configs
            .iter()
            .map(|config| {
                let (state, servers) = match table.sets.get(&config.name) {
                    Some(set) => (set.state(), set.server_statuses()),
                    None => (ToolboxState::Closed, Vec::new()),
                };
                ToolboxStatus {
                    name: config.name.clone(),
                    state,
                    description: (!config.description.is_empty())
                        .then(|| config.description.clone()),
                    servers,
                }
            })
            .collect()
    }
}
