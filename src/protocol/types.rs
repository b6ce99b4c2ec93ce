//! MCP Protocol type definitions

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name
    pub name: String,
    /// Human-readable title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Tool description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Input JSON Schema
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    /// Output JSON Schema
    #[serde(rename = "outputSchema", skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Tool annotations (hints about behavior)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
}

/// Tool annotations (hints about tool behavior)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolAnnotations {
    /// Human-readable title for the tool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// If true, tool does not modify external state
    #[serde(rename = "readOnlyHint", skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
    /// If true, tool may perform destructive actions
    #[serde(rename = "destructiveHint", skip_serializing_if = "Option::is_none")]
    pub destructive_hint: Option<bool>,
    /// If true, repeated calls with the same arguments have no extra effect
    #[serde(rename = "idempotentHint", skip_serializing_if = "Option::is_none")]
    pub idempotent_hint: Option<bool>,
    /// If true, tool interacts with external entities
    #[serde(rename = "openWorldHint", skip_serializing_if = "Option::is_none")]
    pub open_world_hint: Option<bool>,
}

/// Content item in tool call response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Content {
    /// Text content
    #[serde(rename = "text")]
    Text {
        /// Text value
        text: String,
    },
    /// Image content
    #[serde(rename = "image")]
    Image {
        /// Base64-encoded data
        data: String,
        /// MIME type
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

impl Content {
    /// Plain text content item
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Client/Server info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Info {
    /// Name
    pub name: String,
    /// Version
    pub version: String,
    /// Title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Server capabilities
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Experimental capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<HashMap<String, Value>>,
    /// Tools capability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
}

/// Tools capability
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsCapability {
    /// List changed notification support
    #[serde(rename = "listChanged", default)]
    pub list_changed: bool,
}

/// Client capabilities
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Experimental capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<HashMap<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_uses_camel_case_schema_fields() {
        let tool = Tool {
            name: "read_file".to_string(),
            title: None,
            description: Some("Read a file".to_string()),
            input_schema: json!({"type": "object"}),
            output_schema: None,
            annotations: Some(ToolAnnotations {
                read_only_hint: Some(true),
                ..Default::default()
            }),
        };
        let json = serde_json::to_value(&tool).unwrap();
        assert_eq!(json["inputSchema"]["type"], "object");
        assert_eq!(json["annotations"]["readOnlyHint"], true);
        assert!(json.get("outputSchema").is_none());
        assert!(json.get("title").is_none());
    }

    #[test]
    fn tool_deserializes_downstream_listing() {
        let tool: Tool = serde_json::from_value(json!({
            "name": "search",
            "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}
        }))
        .unwrap();
        assert_eq!(tool.name, "search");
        assert!(tool.description.is_none());
        assert_eq!(tool.input_schema["properties"]["q"]["type"], "string");
    }

    #[test]
    fn content_is_tagged_by_type() {
        let text = serde_json::to_value(Content::text("hello")).unwrap();
        assert_eq!(text, json!({"type": "text", "text": "hello"}));

        let image: Content = serde_json::from_value(json!({
            "type": "image",
            "data": "aGk=",
            "mimeType": "image/png"
        }))
        .unwrap();
        assert_eq!(
            image,
            Content::Image {
                data: "aGk=".to_string(),
                mime_type: "image/png".to_string()
            }
        );
    }

    #[test]
    fn tools_capability_serializes_list_changed() {
        let caps = ServerCapabilities {
            tools: Some(ToolsCapability { list_changed: true }),
            ..Default::default()
        };
        let json = serde_json::to_value(&caps).unwrap();
        assert_eq!(json["tools"]["listChanged"], true);
        assert!(json.get("experimental").is_none());
    }
}
