//! Toolbox gateway library
//!
//! An MCP gateway that groups downstream MCP servers into named toolboxes
//! which clients open and close on demand.
//!
//! # Features
//!
//! - **Toolboxes**: open/close groups of downstream servers at runtime
//! - **Dispatch modes**: register tools dynamically, or proxy through `use_tool`
//! - **Qualified names**: `<toolbox>__<server>__<tool>`, reversible
//! - **Transports**: stdio subprocesses, Streamable HTTP, SSE
//! - **Upstream**: HTTP with SSE notifications, or stdio

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod naming;
pub mod protocol;
pub mod toolbox;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging.
///
/// Output goes to stderr so that stdout stays free for the stdio upstream.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
