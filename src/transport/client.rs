//! MCP client session over a [`Transport`]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{Connector, DownstreamSession, HttpTransport, StdioTransport, Transport};
use crate::config::{ServerDefinition, TransportConfig};
use crate::protocol::{
    ClientCapabilities, Info, InitializeParams, JsonRpcResponse, Tool, ToolsCallParams,
    ToolsListParams, ToolsListResult,
};
use crate::{Error, Result};

/// Upper bound on `tools/list` pages followed for one catalog
const MAX_LIST_PAGES: usize = 100;

/// Tool-capable MCP client session
pub struct McpClient {
    transport: Arc<dyn Transport>,
}

impl McpClient {
    /// Wrap an initialized transport
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

/// Turn a JSON-RPC response into its result, surfacing protocol errors
fn into_result(response: JsonRpcResponse) -> Result<Value> {
    if let Some(error) = response.error {
        return Err(Error::JsonRpc {
            code: error.code,
            message: error.message,
            data: error.data,
        });
    }
    Ok(response.result.unwrap_or(Value::Null))
}

#[async_trait]
impl DownstreamSession for McpClient {
    async fn list_tools(&self) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = ToolsListParams {
                cursor: cursor.take(),
            };
            let response = self
                .transport
                .request("tools/list", Some(serde_json::to_value(params)?))
                .await?;
            let page: ToolsListResult = serde_json::from_value(into_result(response)?)?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        Err(Error::Protocol(format!(
            "tools/list did not finish within {MAX_LIST_PAGES} pages"
        )))
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let params = ToolsCallParams {
            name: name.to_string(),
            arguments,
        };
        let response = self
            .transport
            .request("tools/call", Some(serde_json::to_value(params)?))
            .await?;
        into_result(response)
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}

/// Default [`Connector`]: spawns stdio servers or opens HTTP sessions
pub struct TransportConnector {
    request_timeout: Duration,
}

impl TransportConnector {
    /// Create a connector whose transports time out requests after `request_timeout`
    #[must_use]
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(
        &self,
        toolbox: &str,
        server: &ServerDefinition,
    ) -> Result<Arc<dyn DownstreamSession>> {
        info!(
            toolbox = %toolbox,
            server = %server.name,
            transport = server.transport.transport_type(),
            "Connecting downstream server"
        );

        let transport: Arc<dyn Transport> = match &server.transport {
            TransportConfig::Stdio { command, cwd } => {
                let transport = StdioTransport::new(
                    command,
                    server.env.clone(),
                    cwd.clone(),
                    self.request_timeout,
                );
                if let Err(e) = transport.start().await {
                    // Reap the child if the handshake failed after spawn
                    let _ = transport.close().await;
                    return Err(e);
                }
                transport
            }
            TransportConfig::Http {
                http_url,
                streamable_http,
                protocol_version,
            } => {
                let transport = HttpTransport::new(
                    http_url,
                    server.headers.clone(),
                    self.request_timeout,
                    *streamable_http,
                    protocol_version.clone(),
                )?;
                transport.initialize().await?;
                transport
            }
        };

        debug!(toolbox = %toolbox, server = %server.name, "Downstream server initialized");
        Ok(Arc::new(McpClient::new(transport)))
    }
}

/// `initialize` params announcing this gateway as the client
pub(crate) fn initialize_params(protocol_version: &str) -> Value {
    let params = InitializeParams {
        protocol_version: protocol_version.to_string(),
        capabilities: ClientCapabilities::default(),
        client_info: Info {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
        },
    };
    serde_json::to_value(params).unwrap_or_else(|_| json!({"protocolVersion": protocol_version}))
}
