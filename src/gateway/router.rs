//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, compression::CompressionLayer, trace::TraceLayer};
use tracing::{debug, info};

use super::handler::McpHandler;
use super::streaming::{NotificationMultiplexer, create_sse_response};
use crate::config::StreamingConfig;
use crate::error::rpc_codes;
use crate::protocol::JsonRpcResponse;
use crate::toolbox::ToolboxState;

const SESSION_HEADER: &str = "mcp-session-id";

/// Shared application state
pub struct AppState {
    /// JSON-RPC handler
    pub handler: Arc<McpHandler>,
    /// Upstream sessions and SSE fan-out
    pub multiplexer: Arc<NotificationMultiplexer>,
    /// Streaming configuration
    pub streaming: StreamingConfig,
    /// Maximum accepted request body, in bytes
    pub max_body_size: usize,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/mcp",
            post(mcp_post_handler)
                .get(mcp_sse_handler)
                .delete(mcp_delete_handler),
        )
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn session_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn with_session(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

fn rpc_error(status: StatusCode, code: i32, message: String) -> Response {
    (
        status,
        Json(json!({
            "jsonrpc": "2.0",
            "error": {"code": code, "message": message},
            "id": null
        })),
    )
        .into_response()
}

/// POST /mcp: one JSON-RPC message per request
async fn mcp_post_handler(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
) -> Response {
    let existing = session_id_from(request.headers());

    let body = match to_bytes(request.into_body(), state.max_body_size).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                rpc_codes::PARSE_ERROR,
                format!("Failed to read body: {e}"),
            );
        }
    };

    let message: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                rpc_codes::PARSE_ERROR,
                format!("Invalid JSON: {e}"),
            );
        }
    };

    let session_id = state.multiplexer.get_or_create_session(existing.as_deref());

    let response = match state.handler.handle_message(&message).await {
        Some(response) => {
            let status = if response.error.is_some() && response.id.is_none() {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::OK
            };
            (status, Json(response)).into_response()
        }
        None => StatusCode::ACCEPTED.into_response(),
    };

    with_session(response, &session_id)
}

/// GET /mcp: SSE stream of server notifications
async fn mcp_sse_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !accept.contains("text/event-stream") {
        return (
            StatusCode::NOT_ACCEPTABLE,
            Json(json!({"error": "Must accept text/event-stream for SSE notifications"})),
        )
            .into_response();
    }

    let existing = session_id_from(&headers);
    let session_id = state.multiplexer.get_or_create_session(existing.as_deref());
    info!(session_id = %session_id, "Client connected to SSE stream");

    match create_sse_response(
        Arc::clone(&state.multiplexer),
        session_id.clone(),
        state.streaming.keep_alive_interval,
    ) {
        Some(sse) => with_session(sse.into_response(), &session_id),
        None => rpc_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            rpc_codes::INTERNAL_ERROR,
            "Failed to create SSE stream".to_string(),
        ),
    }
}

/// DELETE /mcp: session termination
async fn mcp_delete_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> StatusCode {
    match session_id_from(&headers) {
        Some(id) if state.multiplexer.remove_session(&id) => {
            info!(session_id = %id, "Session terminated by client");
            StatusCode::NO_CONTENT
        }
        Some(id) => {
            debug!(session_id = %id, "Session not found for DELETE");
            StatusCode::NOT_FOUND
        }
        None => StatusCode::BAD_REQUEST,
    }
}

/// Health check: process liveness plus toolbox counts
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let dispatcher = state.handler.dispatcher();
    let toolboxes = dispatcher.list_toolboxes();
    let open = toolboxes
        .iter()
        .filter(|t| t.state == ToolboxState::Open)
        .count();

    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": dispatcher.mode().as_str(),
        "toolboxes": {
            "configured": toolboxes.len(),
            "open": open
        },
        "sessions": state.multiplexer.session_count()
    }))
}
