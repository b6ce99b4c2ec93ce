//! Downstream transports
//!
//! Two layers live here:
//!
//! - [`Transport`]: raw JSON-RPC request/notify over a subprocess or HTTP.
//! - [`DownstreamSession`] / [`Connector`]: the tool-capable session the
//!   toolbox engine consumes. [`TransportConnector`] builds one on top of a
//!   [`Transport`]; tests substitute their own connector.

mod client;
mod http;
mod stdio;

pub use self::client::{McpClient, TransportConnector};
pub use self::http::HttpTransport;
pub use self::stdio::StdioTransport;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::ServerDefinition;
use crate::protocol::{JsonRpcResponse, Tool};
use crate::Result;

/// Transport trait for MCP communication
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for response
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse>;

    /// Send a notification (no response expected)
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Check if transport is connected
    fn is_connected(&self) -> bool;

    /// Close the transport
    async fn close(&self) -> Result<()>;
}

/// An initialized, tool-capable connection to one downstream server
#[async_trait]
pub trait DownstreamSession: Send + Sync {
    /// Fetch the server's full tool catalog
    async fn list_tools(&self) -> Result<Vec<Tool>>;

    /// Call a tool, returning the `tools/call` result object untouched
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;

    /// Whether the underlying connection is still usable
    fn is_connected(&self) -> bool;

    /// Release the connection
    async fn close(&self) -> Result<()>;
}

/// Opens [`DownstreamSession`]s from server definitions
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and initialize a session for `server` of `toolbox`
    async fn connect(
        &self,
        toolbox: &str,
        server: &ServerDefinition,
    ) -> Result<Arc<dyn DownstreamSession>>;
}
