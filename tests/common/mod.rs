//! In-memory downstream servers for engine tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use toolbox_gateway::config::{
    Config, DispatchMode, ServerDefinition, SessionConfig, ToolFilterConfig, ToolboxConfig,
    TransportConfig,
};
use toolbox_gateway::gateway::{Dispatcher, McpHandler};
use toolbox_gateway::protocol::Tool;
use toolbox_gateway::toolbox::ToolboxManager;
use toolbox_gateway::transport::{Connector, DownstreamSession};
use toolbox_gateway::{Error, Result};

/// A downstream tool call observed by the mock
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub toolbox: String,
    pub server: String,
    pub tool: String,
    pub arguments: Value,
}

/// Connector serving fixed catalogs keyed by server name
#[derive(Default)]
pub struct MockConnector {
    catalogs: HashMap<String, Vec<String>>,
    failing: HashSet<String>,
    connect_delay: Duration,
    server_delays: HashMap<String, Duration>,
    connects: AtomicUsize,
    connecting: AtomicUsize,
    peak_connecting: AtomicUsize,
    live: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `tools` from every server named `server`
    pub fn with_server(mut self, server: &str, tools: &[&str]) -> Self {
        self.catalogs.insert(
            server.to_string(),
            tools.iter().map(ToString::to_string).collect(),
        );
        self
    }

    /// Refuse connections to `server`
    pub fn with_failing(mut self, server: &str) -> Self {
        self.failing.insert(server.to_string());
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Delay connects to `server` only
    pub fn with_server_delay(mut self, server: &str, delay: Duration) -> Self {
        self.server_delays.insert(server.to_string(), delay);
        self
    }

    /// Connection attempts so far
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Most connects observed in flight at once
    pub fn peak_connecting(&self) -> usize {
        self.peak_connecting.load(Ordering::SeqCst)
    }

    /// Sessions currently open
    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        toolbox: &str,
        server: &ServerDefinition,
    ) -> Result<Arc<dyn DownstreamSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let now = self.connecting.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_connecting.fetch_max(now, Ordering::SeqCst);
        let delay = self
            .server_delays
            .get(&server.name)
            .copied()
            .unwrap_or(self.connect_delay);
        tokio::time::sleep(delay).await;
        self.connecting.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&server.name) {
            return Err(Error::Transport(format!("{} refused the connection", server.name)));
        }

        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSession {
            toolbox: toolbox.to_string(),
            server: server.name.clone(),
            tools: self.catalogs.get(&server.name).cloned().unwrap_or_default(),
            open: AtomicBool::new(true),
            live: Arc::clone(&self.live),
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct MockSession {
    toolbox: String,
    server: String,
    tools: Vec<String>,
    open: AtomicBool,
    live: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

#[async_trait]
impl DownstreamSession for MockSession {
    async fn list_tools(&self) -> Result<Vec<Tool>> {
        Ok(self.tools.iter().map(|name| tool(name)).collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.calls.lock().push(RecordedCall {
            toolbox: self.toolbox.clone(),
            server: self.server.clone(),
            tool: name.to_string(),
            arguments: arguments.clone(),
        });
        Ok(json!({
            "content": [{"type": "text", "text": format!("{}:{name}", self.server)}],
            "isError": false
        }))
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub fn tool(name: &str) -> Tool {
    Tool {
        name: name.to_string(),
        title: None,
        description: Some(format!("{name} tool")),
        input_schema: json!({"type": "object"}),
        output_schema: None,
        annotations: None,
    }
}

pub fn server(name: &str) -> ServerDefinition {
    ServerDefinition {
        name: name.to_string(),
        transport: TransportConfig::Stdio {
            command: format!("mock-{name}"),
            cwd: None,
        },
        env: HashMap::new(),
        headers: HashMap::new(),
    }
}

pub fn toolbox(name: &str, servers: &[&str]) -> ToolboxConfig {
    ToolboxConfig {
        name: name.to_string(),
        description: format!("{name} toolbox"),
        servers: servers.iter().map(|s| server(s)).collect(),
        tools: ToolFilterConfig::default(),
    }
}

pub fn config(mode: DispatchMode, toolboxes: Vec<ToolboxConfig>) -> Config {
    Config {
        mode,
        toolboxes,
        ..Config::default()
    }
}

pub fn manager(toolboxes: Vec<ToolboxConfig>, connector: &Arc<MockConnector>) -> Arc<ToolboxManager> {
    manager_with(toolboxes, &SessionConfig::default(), connector)
}

pub fn manager_with(
    toolboxes: Vec<ToolboxConfig>,
    sessions: &SessionConfig,
    connector: &Arc<MockConnector>,
) -> Arc<ToolboxManager> {
    let connector: Arc<dyn Connector> = connector.clone();
    Arc::new(ToolboxManager::new(toolboxes, sessions, connector))
}

pub fn dispatcher(
    mode: DispatchMode,
    toolboxes: Vec<ToolboxConfig>,
    connector: &Arc<MockConnector>,
) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(mode, manager(toolboxes, connector)))
}

pub fn handler(
    mode: DispatchMode,
    toolboxes: Vec<ToolboxConfig>,
    connector: &Arc<MockConnector>,
) -> McpHandler {
    McpHandler::new(dispatcher(mode, toolboxes, connector))
}

/// The `dev` toolbox: filesystem + git
pub fn dev_toolbox() -> ToolboxConfig {
    toolbox("dev", &["filesystem", "git"])
}

pub fn dev_connector() -> MockConnector {
    MockConnector::new()
        .with_server("filesystem", &["read_file", "write_file"])
        .with_server("git", &["status", "log"])
}
