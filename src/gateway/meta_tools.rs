//! Meta-tools: `list_toolboxes`, `open_toolbox`, `close_toolbox`, `use_tool`
//!
//! Every failure here is reported as a tool result with `isError: true`;
//! none of them turn into JSON-RPC errors.

use serde_json::{Value, json};

use super::dispatcher::Dispatcher;
use crate::config::DispatchMode;
use crate::protocol::{Content, Tool, ToolAnnotations, ToolsCallResult};
use crate::{Error, Result};

/// The gateway's own tools
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaTool {
    /// Show configured toolboxes and their state
    ListToolboxes,
    /// Connect a toolbox's servers
    OpenToolbox,
    /// Release a toolbox's servers
    CloseToolbox,
    /// Invoke a downstream tool by explicit target (proxy mode)
    UseTool,
}

impl MetaTool {
    /// Tool name as advertised
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ListToolboxes => "list_toolboxes",
            Self::OpenToolbox => "open_toolbox",
            Self::CloseToolbox => "close_toolbox",
            Self::UseTool => "use_tool",
        }
    }

    /// Meta-tools available in `mode`
    #[must_use]
    pub fn available(mode: DispatchMode) -> &'static [Self] {
        match mode {
            DispatchMode::Dynamic => &[Self::ListToolboxes, Self::OpenToolbox, Self::CloseToolbox],
            DispatchMode::Proxy => &[
                Self::ListToolboxes,
                Self::OpenToolbox,
                Self::CloseToolbox,
                Self::UseTool,
            ],
        }
    }

    /// Look up a meta-tool by name, honoring the mode
    #[must_use]
    pub fn from_name(name: &str, mode: DispatchMode) -> Option<Self> {
        Self::available(mode).iter().copied().find(|t| t.name() == name)
    }

    /// Tool definition for `tools/list`
    #[must_use]
    pub fn definition(self) -> Tool {
        let (title, description, input_schema, read_only) = match self {
            Self::ListToolboxes => (
                "List Toolboxes",
                "List configured toolboxes, whether each is open, and the connection state of its servers.",
                json!({"type": "object", "properties": {}}),
                true,
            ),
            Self::OpenToolbox => (
                "Open Toolbox",
                "Connect every server of a toolbox and expose its tools. Servers that fail are reported in failedServers.",
                json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Toolbox name"}
                    },
                    "required": ["name"]
                }),
                false,
            ),
            Self::CloseToolbox => (
                "Close Toolbox",
                "Disconnect every server of a toolbox. Closing a closed toolbox succeeds.",
                json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Toolbox name"}
                    },
                    "required": ["name"]
                }),
                false,
            ),
            Self::UseTool => (
                "Use Tool",
                "Invoke a tool of an open toolbox. Address it with toolbox, server and name, or with its qualified name (toolbox__server__name).",
                json!({
                    "type": "object",
                    "properties": {
                        "toolbox": {"type": "string", "description": "Toolbox name"},
                        "server": {"type": "string", "description": "Server name within the toolbox"},
                        "name": {"type": "string", "description": "Tool name as reported by the server"},
                        "qualifiedName": {"type": "string", "description": "Alternative to toolbox/server/name"},
                        "arguments": {"type": "object", "description": "Tool arguments", "default": {}}
                    }
                }),
                false,
            ),
        };

        Tool {
            name: self.name().to_string(),
            title: Some(title.to_string()),
            description: Some(description.to_string()),
            input_schema,
            output_schema: None,
            annotations: read_only.then(|| ToolAnnotations {
                read_only_hint: Some(true),
                ..Default::default()
            }),
        }
    }

    /// Run the meta-tool, producing a `tools/call` result
    pub async fn invoke(self, dispatcher: &Dispatcher, args: &Value) -> Value {
        let outcome = match self {
            Self::ListToolboxes => Ok(tool_success(&json!({
                "toolboxes": dispatcher.list_toolboxes()
            }))),
            Self::OpenToolbox => open_toolbox(dispatcher, args).await.map(|v| tool_success(&v)),
            Self::CloseToolbox => close_toolbox(dispatcher, args).await.map(|v| tool_success(&v)),
            Self::UseTool => use_tool(dispatcher, args).await,
        };
        outcome.unwrap_or_else(|e| tool_error(&e))
    }
}

/// Definitions of every meta-tool available in `mode`
#[must_use]
pub fn meta_tool_definitions(mode: DispatchMode) -> Vec<Tool> {
    MetaTool::available(mode)
        .iter()
        .map(|t| t.definition())
        .collect()
}

async fn open_toolbox(dispatcher: &Dispatcher, args: &Value) -> Result<Value> {
    let name = extract_required_str(args, "name")?;
    let report = dispatcher.open_toolbox(name).await?;
    Ok(json!({
        "toolbox": name,
        "tools": report.tools,
        "failedServers": report.failed_servers
    }))
}

async fn close_toolbox(dispatcher: &Dispatcher, args: &Value) -> Result<Value> {
    let name = extract_required_str(args, "name")?;
    dispatcher.close_toolbox(name).await?;
    Ok(json!({ "toolbox": name, "closed": true }))
}

/// Downstream results are passed through untouched
async fn use_tool(dispatcher: &Dispatcher, args: &Value) -> Result<Value> {
    let arguments = parse_tool_arguments(args)?;

    if let Some(qualified) = args.get("qualifiedName").and_then(Value::as_str) {
        return dispatcher.call_qualified(qualified, arguments).await;
    }

    let toolbox = extract_required_str(args, "toolbox")?;
    let server = extract_required_str(args, "server")?;
    let name = extract_required_str(args, "name")?;
    dispatcher.use_tool(toolbox, server, name, arguments).await
}

/// Required string argument
pub(crate) fn extract_required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::json_rpc(-32602, format!("Missing '{key}' parameter")))
}

/// Tool arguments: an object, a JSON string holding an object, or absent
pub(crate) fn parse_tool_arguments(args: &Value) -> Result<Value> {
    let mut arguments = match args.get("arguments") {
        None | Some(Value::Null) => json!({}),
        Some(value) => value.clone(),
    };

    if let Value::String(raw) = &arguments {
        arguments = serde_json::from_str(raw).map_err(|e| {
            Error::json_rpc(-32602, format!("Invalid 'arguments' JSON string: {e}"))
        })?;
    }

    if !arguments.is_object() {
        return Err(Error::json_rpc(
            -32602,
            "Invalid 'arguments': expected object or JSON object string",
        ));
    }

    Ok(arguments)
}

/// Successful meta-tool result carrying `content` as pretty JSON text
pub(crate) fn tool_success(content: &Value) -> Value {
    let result = ToolsCallResult {
        content: vec![Content::text(
            serde_json::to_string_pretty(content).unwrap_or_default(),
        )],
        is_error: false,
    };
    let mut value = serde_json::to_value(result).unwrap_or_else(|_| json!({}));
    value["structuredContent"] = content.clone();
    value
}

/// Failed invocation, reported to the client as a tool error
pub(crate) fn tool_error(error: &Error) -> Value {
    let result = ToolsCallResult {
        content: vec![Content::text(error.to_string())],
        is_error: true,
    };
    serde_json::to_value(result).unwrap_or_else(|_| json!({"isError": true}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn proxy_mode_adds_use_tool() {
        let proxy: Vec<_> = meta_tool_definitions(DispatchMode::Proxy)
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(
            proxy,
            vec!["list_toolboxes", "open_toolbox", "close_toolbox", "use_tool"]
        );

        let dynamic: Vec<_> = meta_tool_definitions(DispatchMode::Dynamic)
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(dynamic, vec!["list_toolboxes", "open_toolbox", "close_toolbox"]);
    }

    #[test]
    fn use_tool_is_unknown_in_dynamic_mode() {
        assert_eq!(
            MetaTool::from_name("use_tool", DispatchMode::Proxy),
            Some(MetaTool::UseTool)
        );
        assert_eq!(MetaTool::from_name("use_tool", DispatchMode::Dynamic), None);
        assert_eq!(MetaTool::from_name("gateway_invoke", DispatchMode::Proxy), None);
    }

    #[test]
    fn definitions_have_object_schemas() {
        for tool in meta_tool_definitions(DispatchMode::Proxy) {
            assert_eq!(tool.input_schema["type"], "object", "{}", tool.name);
            assert!(tool.description.is_some());
        }
    }

    #[test]
    fn arguments_default_to_empty_object() {
        assert_eq!(parse_tool_arguments(&json!({})).unwrap(), json!({}));
        assert_eq!(parse_tool_arguments(&json!({"arguments": null})).unwrap(), json!({}));
    }

    #[test]
    fn arguments_accept_json_string() {
        let args = json!({"arguments": "{\"path\": \"/etc/hosts\"}"});
        assert_eq!(parse_tool_arguments(&args).unwrap(), json!({"path": "/etc/hosts"}));
    }

    #[test]
    fn arguments_reject_non_objects() {
        assert!(parse_tool_arguments(&json!({"arguments": [1, 2]})).is_err());
        assert!(parse_tool_arguments(&json!({"arguments": "not json"})).is_err());
    }

    #[test]
    fn required_str_rejects_missing_and_empty() {
        let args = json!({"name": "", "other": 1});
        assert!(extract_required_str(&args, "name").is_err());
        assert!(extract_required_str(&args, "other").is_err());
        assert!(extract_required_str(&args, "absent").is_err());
        assert_eq!(extract_required_str(&json!({"name": "dev"}), "name").unwrap(), "dev");
    }

    #[test]
    fn tool_error_sets_is_error() {
        let value = tool_error(&Error::ToolboxNotFound("dev".to_string()));
        assert_eq!(value["isError"], true);
        assert!(value["content"][0]["text"].as_str().unwrap().contains("dev"));
    }

    #[test]
    fn tool_success_embeds_structured_content() {
        let value = tool_success(&json!({"toolbox": "dev", "closed": true}));
        assert_eq!(value["isError"], false);
        assert_eq!(value["structuredContent"]["closed"], true);
    }
}
