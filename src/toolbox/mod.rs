//! Toolboxes: named groups of downstream servers opened on demand
//!
//! [`ToolboxManager`] owns every open [`ToolboxConnectionSet`]; each set owns
//! the sessions of one toolbox and the catalog of [`RegisteredToolEntry`]s
//! they expose.

mod connection_set;
mod filter;
mod manager;

pub use connection_set::{
    FailedServer, OpenReport, OpenSettings, ServerStatus, ToolboxConnectionSet, ToolboxState,
};
pub use filter::ToolFilter;
pub use manager::{ToolboxManager, ToolboxStatus};

use serde::Serialize;
use serde_json::Value;

use crate::protocol::{Tool, ToolAnnotations};

/// A downstream tool as exposed upstream
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredToolEntry {
    /// `<toolbox>__<server>__<tool>`
    pub qualified_name: String,
    /// Owning toolbox
    #[serde(skip)]
    pub toolbox: String,
    /// Owning server
    #[serde(skip)]
    pub server: String,
    /// Name the downstream server knows the tool by
    #[serde(skip)]
    pub original_name: String,
    /// Provenance-prefixed description
    pub description: String,
    /// Input schema, unchanged
    pub schema: Value,
    #[serde(skip)]
    output_schema: Option<Value>,
    #[serde(skip)]
    annotations: Option<ToolAnnotations>,
}

impl RegisteredToolEntry {
    pub(crate) fn new(qualified_name: String, toolbox: &str, server: &str, tool: Tool) -> Self {
        let description = match tool.description.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => format!("[{toolbox}/{server}] {text}"),
            _ => format!("[{toolbox}/{server}] {}", tool.name),
        };
        Self {
            qualified_name,
            toolbox: toolbox.to_string(),
            server: server.to_string(),
            original_name: tool.name,
            description,
            schema: tool.input_schema,
            output_schema: tool.output_schema,
            annotations: tool.annotations,
        }
    }

    /// Tool definition advertised under the qualified name
    #[must_use]
    pub fn to_tool(&self) -> Tool {
        Tool {
            name: self.qualified_name.clone(),
            title: None,
            description: Some(self.description.clone()),
            input_schema: self.schema.clone(),
            output_schema: self.output_schema.clone(),
            annotations: self.annotations.clone(),
        }
    }
}
