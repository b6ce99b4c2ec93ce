//! HTTP transport for remote MCP servers
//!
//! Two wire styles are supported:
//!
//! - Streamable HTTP: every message is a POST to the configured URL. The
//!   server may answer with JSON or with a single-event SSE body.
//! - Legacy SSE: a GET on the configured URL yields an `endpoint` event whose
//!   data is the URL messages are POSTed to.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::Transport;
use super::client::initialize_params;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId};
use crate::{Error, Result};

const SESSION_HEADER: &str = "mcp-session-id";
const VERSION_HEADER: &str = "mcp-protocol-version";

/// HTTP transport for one remote MCP server
pub struct HttpTransport {
    client: Client,
    /// Configured server URL
    base_url: String,
    /// Where messages are POSTed once the handshake is done
    message_url: RwLock<Option<String>>,
    /// Static headers from configuration, validated at construction
    headers: HeaderMap,
    /// Session id assigned by the server
    session_id: RwLock<Option<String>>,
    request_id: AtomicU64,
    connected: AtomicBool,
    streamable_http: bool,
    /// Protocol version announced in `initialize` and request headers
    protocol_version: String,
}

impl HttpTransport {
    /// Create a new HTTP transport.
    ///
    /// Fails if a configured header is not a valid HTTP header.
    pub fn new(
        url: &str,
        headers: HashMap<String, String>,
        timeout: Duration,
        streamable_http: bool,
        protocol_version: Option<String>,
    ) -> Result<Arc<Self>> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        let mut static_headers = HeaderMap::new();
        for (key, value) in &headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| Error::Config(format!("Invalid header name '{key}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("Invalid value for header '{key}': {e}")))?;
            static_headers.insert(name, value);
        }

        Ok(Arc::new(Self {
            client,
            base_url: url.to_string(),
            message_url: RwLock::new(None),
            headers: static_headers,
            session_id: RwLock::new(None),
            request_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            streamable_http,
            protocol_version: protocol_version.unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
        }))
    }

    /// Run the handshake: locate the message endpoint, then `initialize`.
    pub async fn initialize(&self) -> Result<()> {
        let message_url = if self.streamable_http {
            self.base_url.clone()
        } else {
            let endpoint = self.discover_endpoint().await?;
            resolve_message_url(&self.base_url, &endpoint)?
        };
        debug!(url = %self.base_url, message_url = %message_url, "HTTP endpoint resolved");
        *self.message_url.write() = Some(message_url);

        let response = self
            .request(
                "initialize",
                Some(initialize_params(&self.protocol_version)),
            )
            .await?;

        if let Some(error) = response.error {
            return Err(Error::Protocol(format!(
                "Initialize failed: {}",
                error.message
            )));
        }

        self.notify("notifications/initialized", None).await?;

        self.connected.store(true, Ordering::Relaxed);
        debug!(url = %self.base_url, streamable = self.streamable_http, "HTTP transport initialized");

        Ok(())
    }

    /// Read the legacy SSE stream until the `endpoint` event arrives
    async fn discover_endpoint(&self) -> Result<String> {
        let mut headers = self.base_headers();
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));

        let response = self
            .client
            .get(&self.base_url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("SSE connection failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("SSE endpoint returned {status}")));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut event_type: Option<String> = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Transport(format!("SSE read failed: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                let line = line.trim();

                if line.is_empty() {
                    event_type = None;
                } else if let Some(event) = line.strip_prefix("event:") {
                    event_type = Some(event.trim().to_string());
                } else if let Some(data) = line.strip_prefix("data:") {
                    if event_type.as_deref() == Some("endpoint") {
                        let endpoint = data.trim().to_string();
                        self.remember_query_session(&endpoint);
                        return Ok(endpoint);
                    }
                }
            }
        }

        Err(Error::Transport(
            "SSE stream ended without an endpoint event".to_string(),
        ))
    }

    /// Legacy servers carry the session in the endpoint's query string
    fn remember_query_session(&self, endpoint: &str) {
        let parsed = Url::parse(endpoint).or_else(|_| Url::parse("http://localhost")?.join(endpoint));
        if let Ok(url) = parsed {
            if let Some((_, value)) = url.query_pairs().find(|(k, _)| k == "session_id") {
                *self.session_id.write() = Some(value.into_owned());
            }
        }
    }

    /// Headers sent with every message
    fn base_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Ok(version) = HeaderValue::from_str(&self.protocol_version) {
            headers.insert(VERSION_HEADER, version);
        }
        if let Some(ref id) = *self.session_id.read() {
            if let Ok(value) = HeaderValue::from_str(id) {
                headers.insert(SESSION_HEADER, value);
            }
        }
        headers
    }

    fn message_url(&self) -> String {
        self.message_url
            .read()
            .clone()
            .unwrap_or_else(|| self.base_url.clone())
    }

    /// POST a JSON-RPC payload, adopting any session id the server assigns
    async fn post(&self, body: &impl serde::Serialize, accept: &'static str) -> Result<Response> {
        let url = self.message_url();
        let mut headers = self.base_headers();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::ACCEPT, HeaderValue::from_static(accept));

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::BackendTimeout(format!("POST {url}: {e}"))
                } else {
                    Error::Transport(format!("POST {url}: {e}"))
                }
            })?;

        if self.session_id.read().is_none() {
            if let Some(id) = response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                debug!(url = %url, session_id = %id, "Server assigned session");
                *self.session_id.write() = Some(id.to_string());
            }
        }

        Ok(response)
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(i64::try_from(self.request_id.fetch_add(1, Ordering::Relaxed)).unwrap_or(i64::MAX))
    }
}

/// Resolve a possibly relative endpoint against the SSE URL
fn resolve_message_url(base: &str, endpoint: &str) -> Result<String> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return Ok(endpoint.to_string());
    }
    let base = Url::parse(base).map_err(|e| Error::Transport(format!("Invalid SSE URL: {e}")))?;
    base.join(endpoint)
        .map(String::from)
        .map_err(|e| Error::Transport(format!("Invalid endpoint '{endpoint}': {e}")))
}

/// Decode a response body that is either plain JSON or a single SSE event
fn parse_response_body(content_type: &str, body: &str) -> Result<JsonRpcResponse> {
    if content_type.contains("text/event-stream") {
        let data = body
            .lines()
            .find_map(|line| line.strip_prefix("data:"))
            .ok_or_else(|| Error::Protocol("SSE response carried no data".to_string()))?;
        return Ok(serde_json::from_str(data.trim())?);
    }
    Ok(serde_json::from_str(body)?)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let request = JsonRpcRequest::new(self.next_id(), method, params);
        let response = self
            .post(&request, "application/json, text/event-stream")
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!("HTTP {status}: {body}")));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.text().await?;
        parse_response_body(&content_type, &body)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        let response = self.post(&notification, "application/json").await?;

        if !response.status().is_success() {
            warn!(
                status = %response.status(),
                url = %self.base_url,
                method = %method,
                "Notification rejected"
            );
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);

        let session_id = self.session_id.write().take();
        if let Some(id) = session_id {
            let _ = self
                .client
                .delete(self.message_url())
                .header(SESSION_HEADER, id)
                .send()
                .await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn relative_endpoint_resolves_against_base() {
        let url = resolve_message_url("http://localhost:8080/sse", "/messages?session_id=abc").unwrap();
        assert_eq!(url, "http://localhost:8080/messages?session_id=abc");
    }

    #[test]
    fn absolute_endpoint_is_used_as_is() {
        let url = resolve_message_url("http://a/sse", "https://b/messages").unwrap();
        assert_eq!(url, "https://b/messages");
    }

    #[test]
    fn json_body_parses() {
        let resp = parse_response_body(
            "application/json",
            r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#,
        )
        .unwrap();
        assert!(resp.error.is_none());
        assert_eq!(resp.result.unwrap()["tools"], json!([]));
    }

    #[test]
    fn sse_body_parses_first_data_line() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{}}\n\n";
        let resp = parse_response_body("text/event-stream; charset=utf-8", body).unwrap();
        assert_eq!(resp.id, Some(RequestId::Number(2)));
    }

    #[test]
    fn sse_body_without_data_is_protocol_error() {
        let err = parse_response_body("text/event-stream", "event: message\n\n").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn invalid_header_is_rejected() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        let err = HttpTransport::new("http://localhost", headers, Duration::from_secs(1), true, None)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn session_id_is_read_from_endpoint_query() {
        let transport =
            HttpTransport::new("http://localhost/sse", HashMap::new(), Duration::from_secs(1), false, None)
                .unwrap();
        transport.remember_query_session("/messages?session_id=xyz");
        assert_eq!(transport.session_id.read().as_deref(), Some("xyz"));
    }
}
