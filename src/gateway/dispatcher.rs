//! Routing of tool invocations to downstream sessions
//!
//! Both dispatch modes end in the same delegation path, so the same
//! `(toolbox, server, tool, arguments)` reaches the same session through the
//! same filtered catalog whichever way the client named it.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::DispatchMode;
use crate::naming;
use crate::protocol::{JsonRpcNotification, Tool};
use crate::toolbox::{OpenReport, ToolboxManager, ToolboxState, ToolboxStatus};
use crate::{Error, Result};

/// Notification sent when the advertised tool list changes
pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

/// Capacity of the notification channel
const NOTIFICATION_BUFFER: usize = 64;

/// Applies the configured [`DispatchMode`] on top of the [`ToolboxManager`]
pub struct Dispatcher {
    mode: DispatchMode,
    manager: Arc<ToolboxManager>,
    notifications: broadcast::Sender<JsonRpcNotification>,
}

impl Dispatcher {
    /// Create a dispatcher
    #[must_use]
    pub fn new(mode: DispatchMode, manager: Arc<ToolboxManager>) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self {
            mode,
            manager,
            notifications,
        }
    }

    /// Active mode
    #[must_use]
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Underlying toolbox manager
    #[must_use]
    pub fn manager(&self) -> &Arc<ToolboxManager> {
        &self.manager
    }

    /// Receive upstream notifications (`tools/list_changed`)
    pub fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.notifications.subscribe()
    }

    /// Status of every configured toolbox
    #[must_use]
    pub fn list_toolboxes(&self) -> Vec<ToolboxStatus> {
        self.manager.list()
    }

    /// Open a toolbox, registering its tools in dynamic mode
    pub async fn open_toolbox(&self, name: &str) -> Result<OpenReport> {
        let report = self.manager.open(name).await?;
        telemetry_metrics::counter!("toolbox_opens_total", "toolbox" => name.to_string())
            .increment(1);
        if self.mode == DispatchMode::Dynamic {
            self.notify_list_changed();
        }
        Ok(report)
    }

    /// Close a toolbox. Returns `false` if it was already closed.
    pub async fn close_toolbox(&self, name: &str) -> Result<bool> {
        let was_open = self.manager.close(name).await?;
        if was_open {
            telemetry_metrics::counter!("toolbox_closes_total", "toolbox" => name.to_string())
                .increment(1);
            if self.mode == DispatchMode::Dynamic {
                self.notify_list_changed();
            }
        }
        Ok(was_open)
    }

    /// Tools advertised besides the meta-tools
    #[must_use]
    pub fn registered_tools(&self) -> Vec<Tool> {
        match self.mode {
            DispatchMode::Dynamic => self
                .manager
                .registered()
                .iter()
                .map(|entry| entry.to_tool())
                .collect(),
            DispatchMode::Proxy => Vec::new(),
        }
    }

    /// Whether `name` is a tool registered under a qualified name
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.mode == DispatchMode::Dynamic && self.manager.route(name).is_some()
    }

    /// Invoke a tool by qualified name.
    ///
    /// Registered names use their stored route; anything else is decoded so
    /// the failure names the missing toolbox, server or tool.
    pub async fn call_qualified(&self, qualified: &str, arguments: Value) -> Result<Value> {
        match self.manager.route(qualified) {
            Some(entry) => {
                self.delegate(&entry.toolbox, &entry.server, &entry.original_name, arguments)
                    .await
            }
            None => {
                let target = naming::decode(qualified)?;
                self.delegate(&target.toolbox, &target.server, &target.name, arguments)
                    .await
            }
        }
    }

    /// Proxy-mode invocation with an explicit target
    pub async fn use_tool(
        &self,
        toolbox: &str,
        server: &str,
        name: &str,
        arguments: Value,
    ) -> Result<Value> {
        self.delegate(toolbox, server, name, arguments).await
    }

    /// Resolve toolbox, server and tool in that order, then call downstream
    async fn delegate(
        &self,
        toolbox: &str,
        server: &str,
        name: &str,
        arguments: Value,
    ) -> Result<Value> {
        let set = self
            .manager
            .get(toolbox)
            .filter(|set| set.state() == ToolboxState::Open)
            .ok_or_else(|| Error::ToolboxNotFound(toolbox.to_string()))?;

        let session = set.session(server).ok_or_else(|| Error::ServerNotFound {
            toolbox: toolbox.to_string(),
            server: server.to_string(),
        })?;

        if set.entry(server, name).is_none() {
            return Err(Error::ToolNotFound {
                toolbox: toolbox.to_string(),
                server: server.to_string(),
                name: name.to_string(),
            });
        }

        debug!(toolbox = %toolbox, server = %server, tool = %name, "Delegating tool call");

        let result = session.call_tool(name, arguments).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        telemetry_metrics::counter!(
            "tool_calls_total",
            "toolbox" => toolbox.to_string(),
            "server" => server.to_string(),
            "outcome" => outcome
        )
        .increment(1);

        result.map_err(|e| Error::Delegation {
            toolbox: toolbox.to_string(),
            server: server.to_string(),
            name: name.to_string(),
            cause: e.to_string(),
        })
    }

    fn notify_list_changed(&self) {
        let receivers = self
            .notifications
            .send(JsonRpcNotification::new(TOOLS_LIST_CHANGED, None))
            .unwrap_or(0);
        info!(receivers, "Tool list changed");
    }
}
