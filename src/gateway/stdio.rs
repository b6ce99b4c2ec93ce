//! Stdio upstream: newline-delimited JSON-RPC on a reader/writer pair

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::handler::McpHandler;
use crate::Result;
use crate::error::rpc_codes;
use crate::protocol::{JsonRpcNotification, JsonRpcResponse};

/// Serve one upstream client until EOF or `shutdown`.
///
/// Requests run concurrently; responses and notifications share one writer.
/// Requests still in flight at EOF are answered before returning.
pub async fn serve<R, W>(
    handler: Arc<McpHandler>,
    reader: R,
    mut writer: W,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            };
            if let Err(e) = written.await {
                warn!(error = %e, "Upstream write failed");
                break;
            }
        }
    });

    let mut notifications = handler.dispatcher().subscribe();
    let notify_tx = tx.clone();
    let stop = CancellationToken::new();
    let stop_forwarder = stop.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                received = notifications.recv() => match received {
                    Ok(notification) => forward(&notify_tx, &notification),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(missed = n, "Notification forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                () = stop_forwarder.cancelled() => {
                    // Flush what was queued before the last response went out
                    while let Ok(notification) = notifications.try_recv() {
                        forward(&notify_tx, &notification);
                    }
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    let mut in_flight: JoinSet<()> = JoinSet::new();
    let mut outcome = Ok(());

    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            // Reap finished requests so the set only holds live ones
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "Request task failed");
                }
                continue;
            }
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                outcome = Err(e.into());
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                let response = JsonRpcResponse::error(
                    None,
                    rpc_codes::PARSE_ERROR,
                    format!("Invalid JSON: {e}"),
                );
                send(&tx, &response);
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        let tx = tx.clone();
        in_flight.spawn(async move {
            if let Some(response) = handler.handle_message(&message).await {
                send(&tx, &response);
            }
        });
    }

    while in_flight.join_next().await.is_some() {}

    stop.cancel();
    let _ = forwarder.await;
    drop(tx);
    let _ = writer_task.await;

    debug!("Stdio upstream finished");
    outcome
}

fn forward(tx: &mpsc::UnboundedSender<String>, notification: &JsonRpcNotification) {
    match serde_json::to_string(notification) {
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(e) => warn!(error = %e, "Failed to serialize notification"),
    }
}

fn send(tx: &mpsc::UnboundedSender<String>, response: &JsonRpcResponse) {
    match serde_json::to_string(response) {
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(e) => warn!(error = %e, "Failed to serialize response"),
    }
}
