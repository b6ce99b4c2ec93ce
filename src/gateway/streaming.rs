//! Upstream client sessions and SSE notification fan-out
//!
//! - POST /mcp creates a session and returns its id in `Mcp-Session-Id`
//! - GET /mcp opens an SSE stream of that session's notifications
//! - DELETE /mcp ends the session
//!
//! Gateway notifications (`tools/list_changed`) are broadcast to every
//! session.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_stream::stream;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StreamingConfig;
use crate::protocol::JsonRpcNotification;

/// A notification queued for one session
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// Monotonic event id, for `Last-Event-ID`
    pub id: String,
    /// The JSON-RPC notification
    pub notification: JsonRpcNotification,
}

#[derive(Debug)]
struct ClientSession {
    tx: broadcast::Sender<StreamEvent>,
}

/// Tracks upstream sessions and fans notifications out to them
pub struct NotificationMultiplexer {
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
    config: StreamingConfig,
    event_counter: AtomicU64,
}

impl NotificationMultiplexer {
    /// Create an empty multiplexer
    #[must_use]
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
            event_counter: AtomicU64::new(1),
        }
    }

    /// Return the session for `session_id`, creating it if needed
    pub fn get_or_create_session(&self, session_id: Option<&str>) -> String {
        let id = session_id.map_or_else(|| format!("tbx-{}", Uuid::new_v4()), String::from);

        let mut sessions = self.sessions.write();
        if !sessions.contains_key(&id) {
            let (tx, _) = broadcast::channel(self.config.buffer_size.max(1));
            sessions.insert(
                id.clone(),
                Arc::new(ClientSession { tx }),
            );
            info!(session_id = %id, "Created upstream session");
        }

        id
    }

    /// Remove a session. Returns whether it existed.
    pub fn remove_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().remove(session_id).is_some();
        if removed {
            info!(session_id = %session_id, "Removed upstream session");
        }
        removed
    }

    /// Check if a session exists
    #[must_use]
    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    /// Number of live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Receiver for one session's events
    fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<StreamEvent>> {
        self.sessions
            .read()
            .get(session_id)
            .map(|session| session.tx.subscribe())
    }

    /// Send a notification to every session
    pub fn broadcast(&self, notification: &JsonRpcNotification) {
        let event = StreamEvent {
            id: self.next_event_id(),
            notification: notification.clone(),
        };
        let sessions = self.sessions.read();
        for session in sessions.values() {
            let _ = session.tx.send(event.clone());
        }
        debug!(method = %notification.method, sessions = sessions.len(), "Broadcast notification");
    }

    fn next_event_id(&self) -> String {
        format!("evt-{}", self.event_counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Forward gateway notifications to all sessions until `shutdown` fires
    pub fn spawn_forwarder(
        self: &Arc<Self>,
        mut notifications: broadcast::Receiver<JsonRpcNotification>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let multiplexer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    received = notifications.recv() => match received {
                        Ok(notification) => multiplexer.broadcast(&notification),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(missed = n, "Notification forwarder lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}

/// SSE response streaming one session's notifications
///
/// Takes owned data so the stream can outlive the handler.
pub fn create_sse_response(
    multiplexer: Arc<NotificationMultiplexer>,
    session_id: String,
    keep_alive_interval: Duration,
) -> Option<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let mut rx = multiplexer.subscribe(&session_id)?;

    let stream = stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event.notification).unwrap_or_default();
                    yield Ok(Event::default().event("message").id(event.id).data(data));
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(session_id = %session_id, missed = n, "SSE client lagged");
                    yield Ok(Event::default()
                        .event("lagged")
                        .data(json!({ "missed": n }).to_string()));
                }
            }
        }
    };

    Some(Sse::new(stream).keep_alive(KeepAlive::new().interval(keep_alive_interval).text("ping")))
}
