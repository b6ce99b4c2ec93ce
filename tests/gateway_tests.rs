//! Upstream MCP surface tests: JSON-RPC handling and the stdio server

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use common::{MockConnector, dev_connector, dev_toolbox, handler, toolbox};
use toolbox_gateway::config::DispatchMode;
use toolbox_gateway::gateway::{McpHandler, stdio};

async fn call(handler: &McpHandler, id: i64, method: &str, params: Value) -> Value {
    let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
    let response = handler.handle_message(&request).await.unwrap();
    serde_json::to_value(response).unwrap()
}

async fn call_tool(handler: &McpHandler, name: &str, arguments: Value) -> Value {
    call(handler, 1, "tools/call", json!({"name": name, "arguments": arguments})).await["result"]
        .clone()
}

async fn tool_names(handler: &McpHandler) -> Vec<String> {
    let listed = call(handler, 1, "tools/list", json!({})).await;
    listed["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_initialize_reports_list_changed_in_dynamic_mode() {
    let connector = Arc::new(dev_connector());
    let handler = handler(DispatchMode::Dynamic, vec![dev_toolbox()], &connector);

    let response = call(
        &handler,
        1,
        "initialize",
        json!({"protocolVersion": "2025-03-26", "capabilities": {}, "clientInfo": {"name": "t", "version": "0"}}),
    )
    .await;

    assert_eq!(response["result"]["protocolVersion"], "2025-03-26");
    assert_eq!(response["result"]["capabilities"]["tools"]["listChanged"], true);
    assert_eq!(response["result"]["serverInfo"]["name"], "toolbox-gateway");
}

#[tokio::test]
async fn test_ping_and_unknown_method() {
    let connector = Arc::new(dev_connector());
    let handler = handler(DispatchMode::Proxy, vec![dev_toolbox()], &connector);

    assert_eq!(call(&handler, 1, "ping", json!({})).await["result"], json!({}));
    assert_eq!(
        call(&handler, 2, "resources/list", json!({})).await["error"]["code"],
        -32601
    );
}

#[tokio::test]
async fn test_notifications_get_no_response() {
    let connector = Arc::new(dev_connector());
    let handler = handler(DispatchMode::Proxy, vec![dev_toolbox()], &connector);

    let notification = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
    assert!(handler.handle_message(&notification).await.is_none());
}

#[tokio::test]
async fn test_dynamic_tools_list_follows_open_and_close() {
    let connector = Arc::new(dev_connector());
    let handler = handler(DispatchMode::Dynamic, vec![dev_toolbox()], &connector);

    assert_eq!(
        tool_names(&handler).await,
        vec!["list_toolboxes", "open_toolbox", "close_toolbox"]
    );

    let opened = call_tool(&handler, "open_toolbox", json!({"name": "dev"})).await;
    assert_eq!(opened["isError"], false);
    assert_eq!(opened["structuredContent"]["tools"].as_array().unwrap().len(), 4);
    assert_eq!(
        opened["structuredContent"]["tools"][0]["qualifiedName"],
        "dev__filesystem__read_file"
    );

    let names = tool_names(&handler).await;
    assert_eq!(names.len(), 7);
    assert!(names.contains(&"dev__filesystem__read_file".to_string()));

    call_tool(&handler, "close_toolbox", json!({"name": "dev"})).await;
    assert_eq!(tool_names(&handler).await.len(), 3);
}

#[tokio::test]
async fn test_dynamic_call_by_qualified_name() {
    let connector = Arc::new(dev_connector());
    let handler = handler(DispatchMode::Dynamic, vec![dev_toolbox()], &connector);
    call_tool(&handler, "open_toolbox", json!({"name": "dev"})).await;

    let result = call_tool(
        &handler,
        "dev__filesystem__read_file",
        json!({"path": "/etc/hosts"}),
    )
    .await;

    assert_eq!(result["content"][0]["text"], "filesystem:read_file");
    assert_eq!(connector.calls()[0].arguments, json!({"path": "/etc/hosts"}));
}

#[tokio::test]
async fn test_dynamic_unknown_tool_is_a_tool_error() {
    let connector = Arc::new(dev_connector());
    let handler = handler(DispatchMode::Dynamic, vec![dev_toolbox()], &connector);

    let result = call_tool(&handler, "dev__filesystem__read_file", json!({})).await;

    assert_eq!(result["isError"], true);
    assert!(result["content"][0]["text"].as_str().unwrap().contains("dev"));
}

#[tokio::test]
async fn test_open_toolbox_twice_is_a_tool_error() {
    let connector = Arc::new(dev_connector());
    let handler = handler(DispatchMode::Proxy, vec![dev_toolbox()], &connector);

    call_tool(&handler, "open_toolbox", json!({"name": "dev"})).await;
    let second = call_tool(&handler, "open_toolbox", json!({"name": "dev"})).await;

    assert_eq!(second["isError"], true);
    assert!(second["content"][0]["text"].as_str().unwrap().contains("already open"));
}

#[tokio::test]
async fn test_open_reports_failed_servers() {
    let connector = Arc::new(
        MockConnector::new()
            .with_server("filesystem", &["read_file"])
            .with_failing("git"),
    );
    let handler = handler(DispatchMode::Proxy, vec![dev_toolbox()], &connector);

    let opened = call_tool(&handler, "open_toolbox", json!({"name": "dev"})).await;

    assert_eq!(opened["isError"], false);
    assert_eq!(opened["structuredContent"]["failedServers"][0]["server"], "git");
}

#[tokio::test]
async fn test_list_toolboxes_shows_state() {
    let connector = Arc::new(dev_connector().with_server("k8s", &["pods"]));
    let handler = handler(
        DispatchMode::Proxy,
        vec![dev_toolbox(), toolbox("ops", &["k8s"])],
        &connector,
    );
    call_tool(&handler, "open_toolbox", json!({"name": "ops"})).await;

    let listed = call_tool(&handler, "list_toolboxes", json!({})).await;
    let rows = &listed["structuredContent"]["toolboxes"];

    assert_eq!(rows[0]["name"], "dev");
    assert_eq!(rows[0]["state"], "closed");
    assert_eq!(rows[0]["servers"], json!([]));
    assert_eq!(rows[1]["name"], "ops");
    assert_eq!(rows[1]["state"], "open");
    assert_eq!(rows[1]["servers"][0], json!({"name": "k8s", "state": "connected"}));
}

#[tokio::test]
async fn test_use_tool_by_target_and_qualified_name() {
    let connector = Arc::new(dev_connector());
    let handler = handler(DispatchMode::Proxy, vec![dev_toolbox()], &connector);
    call_tool(&handler, "open_toolbox", json!({"name": "dev"})).await;

    let by_target = call_tool(
        &handler,
        "use_tool",
        json!({"toolbox": "dev", "server": "git", "name": "status", "arguments": {}}),
    )
    .await;
    let by_name = call_tool(
        &handler,
        "use_tool",
        json!({"qualifiedName": "dev__git__status"}),
    )
    .await;

    assert_eq!(by_target, by_name);
    assert_eq!(by_target["content"][0]["text"], "git:status");
    assert_eq!(connector.calls().len(), 2);
}

#[tokio::test]
async fn test_use_tool_on_unopened_toolbox_creates_no_session() {
    let connector = Arc::new(dev_connector());
    let handler = handler(DispatchMode::Proxy, vec![dev_toolbox()], &connector);

    let result = call_tool(
        &handler,
        "use_tool",
        json!({"toolbox": "dev", "server": "filesystem", "name": "read_file"}),
    )
    .await;

    assert_eq!(result["isError"], true);
    assert!(result["content"][0]["text"].as_str().unwrap().contains("Toolbox not found"));
    assert_eq!(connector.connects(), 0);
}

#[tokio::test]
async fn test_proxy_mode_rejects_direct_tool_calls() {
    let connector = Arc::new(dev_connector());
    let handler = handler(DispatchMode::Proxy, vec![dev_toolbox()], &connector);
    call_tool(&handler, "open_toolbox", json!({"name": "dev"})).await;

    let response = call(
        &handler,
        3,
        "tools/call",
        json!({"name": "dev__git__status", "arguments": {}}),
    )
    .await;

    assert_eq!(response["error"]["code"], -32602);
    assert!(connector.calls().is_empty());
}

#[tokio::test]
async fn test_stdio_server_round_trip() {
    let connector = Arc::new(dev_connector());
    let handler = Arc::new(handler(DispatchMode::Dynamic, vec![dev_toolbox()], &connector));

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let (client_read, mut client_write) = tokio::io::split(client);

    let serving = tokio::spawn(stdio::serve(
        handler,
        server_read,
        server_write,
        CancellationToken::new(),
    ));

    let requests = [
        json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call",
               "params": {"name": "open_toolbox", "arguments": {"name": "dev"}}}),
    ];
    for request in &requests {
        client_write
            .write_all(format!("{request}\n").as_bytes())
            .await
            .unwrap();
    }
    client_write.write_all(b"not json\n").await.unwrap();
    client_write.shutdown().await.unwrap();

    let mut lines = BufReader::new(client_read).lines();
    let mut received = Vec::new();
    while let Some(line) = lines.next_line().await.unwrap() {
        received.push(serde_json::from_str::<Value>(&line).unwrap());
    }
    serving.await.unwrap().unwrap();

    let response_ids: Vec<&Value> = received
        .iter()
        .filter(|m| m.get("method").is_none())
        .map(|m| &m["id"])
        .collect();
    assert_eq!(response_ids.len(), 3);
    assert!(response_ids.contains(&&json!(1)));
    assert!(response_ids.contains(&&json!(2)));
    assert!(response_ids.contains(&&Value::Null));

    let notifications: Vec<&Value> = received
        .iter()
        .filter(|m| m.get("method").is_some())
        .collect();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0]["method"], "notifications/tools/list_changed");
}

#[tokio::test]
async fn test_null_arguments_reach_the_tool_as_empty_object() {
    let connector = Arc::new(dev_connector());
    let dynamic = handler(DispatchMode::Dynamic, vec![dev_toolbox()], &connector);
    call_tool(&dynamic, "open_toolbox", json!({"name": "dev"})).await;

    let proxy = handler(DispatchMode::Proxy, vec![dev_toolbox()], &connector);
    call_tool(&proxy, "open_toolbox", json!({"name": "dev"})).await;

    let direct = call_tool(&dynamic, "dev__git__status", Value::Null).await;
    let absent = call(&dynamic, 2, "tools/call", json!({"name": "dev__git__log"})).await;
    let via_use_tool = call_tool(
        &proxy,
        "use_tool",
        json!({"qualifiedName": "dev__git__status", "arguments": null}),
    )
    .await;

    assert_eq!(direct["isError"], false);
    assert_eq!(absent["result"]["isError"], false);
    assert_eq!(direct, via_use_tool);
    let calls = connector.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.arguments == json!({})));
}

#[tokio::test]
async fn test_stdio_long_session_answers_every_request() {
    let connector = Arc::new(dev_connector());
    let handler = Arc::new(handler(DispatchMode::Dynamic, vec![dev_toolbox()], &connector));

    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server);
    let (client_read, mut client_write) = tokio::io::split(client);
    let serving = tokio::spawn(stdio::serve(
        handler,
        server_read,
        server_write,
        CancellationToken::new(),
    ));

    let mut lines = BufReader::new(client_read).lines();
    for id in 0..500 {
        let request = json!({"jsonrpc": "2.0", "id": id, "method": "ping"});
        client_write
            .write_all(format!("{request}\n").as_bytes())
            .await
            .unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["id"], id);
        assert_eq!(response["result"], json!({}));
    }

    client_write.shutdown().await.unwrap();
    assert!(lines.next_line().await.unwrap().is_none());
    serving.await.unwrap().unwrap();
}
