//! Upstream surface: dispatch, meta-tools and the HTTP/stdio servers

mod dispatcher;
mod handler;
mod meta_tools;
mod router;
mod server;
pub mod stdio;
pub mod streaming;

pub use dispatcher::{Dispatcher, TOOLS_LIST_CHANGED};
pub use handler::McpHandler;
pub use meta_tools::{MetaTool, meta_tool_definitions};
pub use server::Gateway;
pub use streaming::NotificationMultiplexer;
