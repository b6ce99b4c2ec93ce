//! Upstream MCP request handling, shared by the HTTP and stdio servers

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::debug;

use super::dispatcher::Dispatcher;
use super::meta_tools::{MetaTool, meta_tool_definitions, tool_error};
use crate::config::DispatchMode;
use crate::error::rpc_codes;
use crate::protocol::{
    Info, InitializeResult, JsonRpcResponse, RequestId, ServerCapabilities, ToolsCapability,
    ToolsListResult, negotiate_version,
};

/// Answers upstream JSON-RPC messages
pub struct McpHandler {
    dispatcher: Arc<Dispatcher>,
}

impl McpHandler {
    /// Create a handler over `dispatcher`
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Dispatcher behind this handler
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Handle one raw JSON-RPC message.
    ///
    /// Returns `None` for notifications and for responses sent by the client.
    pub async fn handle_message(&self, message: &Value) -> Option<JsonRpcResponse> {
        if message.get("method").is_none()
            && (message.get("result").is_some() || message.get("error").is_some())
        {
            debug!("Ignoring client response");
            return None;
        }

        let (id, method, params) = match parse_request(message) {
            Ok(parsed) => parsed,
            Err(response) => return Some(response),
        };

        if is_notification_method(&method) {
            debug!(notification = %method, "Client notification");
            return None;
        }

        // parse_request guarantees an id for everything but notifications
        let id = id?;
        Some(self.handle_request(id, &method, params.as_ref()).await)
    }

    /// Handle a request whose id and method are known
    pub async fn handle_request(
        &self,
        id: RequestId,
        method: &str,
        params: Option<&Value>,
    ) -> JsonRpcResponse {
        debug!(method = %method, id = %id, "Request");
        match method {
            "initialize" => self.initialize(id, params),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => self.tools_list(id),
            "tools/call" => self.tools_call(id, params).await,
            _ => JsonRpcResponse::error(
                Some(id),
                rpc_codes::METHOD_NOT_FOUND,
                format!("Method not found: {method}"),
            ),
        }
    }

    fn initialize(&self, id: RequestId, params: Option<&Value>) -> JsonRpcResponse {
        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let negotiated = negotiate_version(requested);
        debug!(client = requested, negotiated, "Protocol version negotiation");

        let result = build_initialize_result(negotiated, self.dispatcher.mode());
        to_response(id, &result)
    }

    fn tools_list(&self, id: RequestId) -> JsonRpcResponse {
        let mut tools = meta_tool_definitions(self.dispatcher.mode());
        tools.extend(self.dispatcher.registered_tools());
        to_response(
            id,
            &ToolsListResult {
                tools,
                next_cursor: None,
            },
        )
    }

    async fn tools_call(&self, id: RequestId, params: Option<&Value>) -> JsonRpcResponse {
        let Some(name) = params.and_then(|p| p.get("name")).and_then(Value::as_str) else {
            return JsonRpcResponse::error(
                Some(id),
                rpc_codes::INVALID_PARAMS,
                "Missing tool name",
            );
        };
        // Absent and null arguments both reach the tool as {}, as with use_tool
        let args = params
            .and_then(|p| p.get("arguments"))
            .filter(|a| !a.is_null())
            .cloned()
            .unwrap_or_else(|| json!({}));

        let mode = self.dispatcher.mode();
        if let Some(meta) = MetaTool::from_name(name, mode) {
            return JsonRpcResponse::success(id, meta.invoke(&self.dispatcher, &args).await);
        }

        match mode {
            DispatchMode::Dynamic => {
                let result = self
                    .dispatcher
                    .call_qualified(name, args)
                    .await
                    .unwrap_or_else(|e| tool_error(&e));
                JsonRpcResponse::success(id, result)
            }
            DispatchMode::Proxy => JsonRpcResponse::error(
                Some(id),
                rpc_codes::INVALID_PARAMS,
                format!("Unknown tool: {name}. Use use_tool to call toolbox tools"),
            ),
        }
    }
}

fn to_response(id: RequestId, result: &impl serde::Serialize) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(Some(id), rpc_codes::INTERNAL_ERROR, e.to_string()),
    }
}

/// `initialize` result for the negotiated version
pub(crate) fn build_initialize_result(version: &str, mode: DispatchMode) -> InitializeResult {
    let instructions = match mode {
        DispatchMode::Dynamic => {
            "Call list_toolboxes to see what is available, then open_toolbox. \
             The toolbox's tools appear in tools/list as toolbox__server__tool."
        }
        DispatchMode::Proxy => {
            "Call list_toolboxes to see what is available, then open_toolbox. \
             Invoke the returned tools with use_tool."
        }
    };

    InitializeResult {
        protocol_version: version.to_string(),
        capabilities: ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: mode == DispatchMode::Dynamic,
            }),
            ..Default::default()
        },
        server_info: Info {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Toolbox Gateway".to_string()),
        },
        instructions: Some(instructions.to_string()),
    }
}

/// JSON-RPC id: string or integer
fn extract_request_id(value: &Value) -> Option<RequestId> {
    match value {
        Value::String(s) => Some(RequestId::String(s.clone())),
        Value::Number(n) => n.as_i64().map(RequestId::Number),
        _ => None,
    }
}

fn is_notification_method(method: &str) -> bool {
    method.starts_with("notifications/")
}

/// Split a JSON-RPC message into (id, method, params).
///
/// The id is `None` only for notifications.
#[allow(clippy::result_large_err)]
pub(crate) fn parse_request(
    value: &Value,
) -> std::result::Result<(Option<RequestId>, String, Option<Value>), JsonRpcResponse> {
    if value.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Invalid JSON-RPC version",
        ));
    }

    let id = value.get("id").and_then(extract_request_id);

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            JsonRpcResponse::error(id.clone(), rpc_codes::INVALID_REQUEST, "Missing method")
        })?;

    if !is_notification_method(method) && id.is_none() {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Missing id",
        ));
    }

    Ok((id, method.to_string(), value.get("params").cloned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn extract_request_id_accepts_strings_and_integers() {
        assert_eq!(
            extract_request_id(&json!("abc")),
            Some(RequestId::String("abc".to_string()))
        );
        assert_eq!(extract_request_id(&json!(-1)), Some(RequestId::Number(-1)));
        assert_eq!(extract_request_id(&json!(0)), Some(RequestId::Number(0)));
    }

    #[test]
    fn extract_request_id_rejects_other_types() {
        assert!(extract_request_id(&json!(null)).is_none());
        assert!(extract_request_id(&json!(true)).is_none());
        assert!(extract_request_id(&json!(1.5)).is_none());
    }

    #[test]
    fn parse_request_with_params() {
        let req = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": "open_toolbox", "arguments": {"name": "dev"}}
        });
        let (id, method, params) = parse_request(&req).unwrap();
        assert_eq!(id, Some(RequestId::Number(1)));
        assert_eq!(method, "tools/call");
        assert_eq!(params.unwrap()["arguments"]["name"], "dev");
    }

    #[test]
    fn parse_request_notification_without_id() {
        let req = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let (id, method, _) = parse_request(&req).unwrap();
        assert!(id.is_none());
        assert_eq!(method, "notifications/initialized");
    }

    #[test]
    fn parse_request_rejects_bad_version() {
        let err = parse_request(&json!({"jsonrpc": "1.0", "id": 1, "method": "ping"})).unwrap_err();
        assert_eq!(err.error.unwrap().code, rpc_codes::INVALID_REQUEST);
    }

    #[test]
    fn parse_request_rejects_missing_method() {
        let err = parse_request(&json!({"jsonrpc": "2.0", "id": 1})).unwrap_err();
        assert!(err.error.unwrap().message.contains("method"));
    }

    #[test]
    fn parse_request_requires_id_for_requests() {
        let err = parse_request(&json!({"jsonrpc": "2.0", "method": "tools/list"})).unwrap_err();
        assert!(err.error.unwrap().message.contains("id"));
    }

    #[test]
    fn initialize_advertises_list_changed_only_in_dynamic_mode() {
        let dynamic = build_initialize_result("2025-06-18", DispatchMode::Dynamic);
        assert!(dynamic.capabilities.tools.unwrap().list_changed);

        let proxy = build_initialize_result("2025-06-18", DispatchMode::Proxy);
        assert!(!proxy.capabilities.tools.unwrap().list_changed);
        assert!(proxy.instructions.unwrap().contains("use_tool"));
    }
}
