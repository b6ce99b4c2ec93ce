//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::dispatcher::Dispatcher;
use super::handler::McpHandler;
use super::router::{AppState, create_router};
use super::stdio;
use super::streaming::NotificationMultiplexer;
use crate::config::Config;
use crate::toolbox::ToolboxManager;
use crate::transport::{Connector, TransportConnector};
use crate::{Error, Result};

/// Toolbox gateway
pub struct Gateway {
    config: Config,
    dispatcher: Arc<Dispatcher>,
}

impl Gateway {
    /// Create a gateway that reaches downstream servers over stdio or HTTP
    #[must_use]
    pub fn new(config: Config) -> Self {
        let connector = Arc::new(TransportConnector::new(config.sessions.request_timeout));
        Self::with_connector(config, connector)
    }

    /// Create a gateway over a custom [`Connector`]
    #[must_use]
    pub fn with_connector(config: Config, connector: Arc<dyn Connector>) -> Self {
        let manager = Arc::new(ToolboxManager::new(
            config.toolboxes.clone(),
            &config.sessions,
            connector,
        ));
        let dispatcher = Arc::new(Dispatcher::new(config.mode, manager));
        Self { config, dispatcher }
    }

    /// Dispatcher shared by every upstream surface
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    fn log_banner(&self, surface: &str) {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            mode = self.config.mode.as_str(),
            surface,
            toolboxes = self.config.toolboxes.len(),
            "Toolbox gateway starting"
        );
        for toolbox in &self.config.toolboxes {
            info!(toolbox = %toolbox.name, servers = toolbox.servers.len(), "Toolbox available");
        }
    }

    /// Serve MCP over HTTP until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let shutdown = CancellationToken::new();
        let multiplexer = Arc::new(NotificationMultiplexer::new(self.config.streaming.clone()));
        let forwarder = multiplexer.spawn_forwarder(self.dispatcher.subscribe(), shutdown.clone());

        let state = Arc::new(AppState {
            handler: Arc::new(McpHandler::new(Arc::clone(&self.dispatcher))),
            multiplexer,
            streaming: self.config.streaming.clone(),
            max_body_size: self.config.server.max_body_size,
        });
        let app = create_router(state);

        let listener = TcpListener::bind(addr).await?;
        self.log_banner("http");
        info!(address = %addr, "Listening on http://{addr}/mcp");

        tokio::spawn(shutdown_signal(shutdown.clone()));
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        shutdown.cancel();
        let _ = forwarder.await;
        close_toolboxes(&self.dispatcher, self.config.server.shutdown_timeout).await;
        Ok(())
    }

    /// Serve MCP over this process's stdin/stdout
    pub async fn run_stdio(self) -> Result<()> {
        self.log_banner("stdio");

        let shutdown = CancellationToken::new();
        tokio::spawn(shutdown_signal(shutdown.clone()));

        let handler = Arc::new(McpHandler::new(Arc::clone(&self.dispatcher)));
        let served = stdio::serve(handler, tokio::io::stdin(), tokio::io::stdout(), shutdown).await;

        close_toolboxes(&self.dispatcher, self.config.server.shutdown_timeout).await;
        served
    }
}

/// Close every open toolbox, giving up after `timeout`
async fn close_toolboxes(dispatcher: &Dispatcher, timeout: Duration) {
    info!("Closing open toolboxes");
    if tokio::time::timeout(timeout, dispatcher.manager().close_all())
        .await
        .is_err()
    {
        warn!(timeout = ?timeout, "Timed out closing toolboxes");
    }
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
        () = shutdown.cancelled() => return,
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
