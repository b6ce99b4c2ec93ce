//! Error types for the toolbox gateway

use std::io;

use thiserror::Error;

/// Result type alias for the toolbox gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Toolbox gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(String),

    /// Toolbox is not configured, or not open when a tool is addressed
    #[error("Toolbox not found: {0}")]
    ToolboxNotFound(String),

    /// Toolbox is already open
    #[error("Toolbox already open: {0}")]
    AlreadyOpen(String),

    /// Toolbox is not open
    #[error("Toolbox not open: {0}")]
    NotOpen(String),

    /// Server is not part of the toolbox
    #[error("Server '{server}' not found in toolbox '{toolbox}'")]
    ServerNotFound {
        /// Toolbox name
        toolbox: String,
        /// Server name
        server: String,
    },

    /// Tool is not in the server's (filtered) catalog
    #[error("Tool '{name}' not found on server '{server}' in toolbox '{toolbox}'")]
    ToolNotFound {
        /// Toolbox name
        toolbox: String,
        /// Server name
        server: String,
        /// Original tool name
        name: String,
    },

    /// Server reported the same tool name twice
    #[error("Duplicate tool '{name}' reported by server '{server}' in toolbox '{toolbox}'")]
    DuplicateTool {
        /// Toolbox name
        toolbox: String,
        /// Server name
        server: String,
        /// Original tool name
        name: String,
    },

    /// Downstream connection could not be established
    #[error("Failed to connect to server '{server}' in toolbox '{toolbox}': {cause}")]
    Connection {
        /// Toolbox name
        toolbox: String,
        /// Server name
        server: String,
        /// Underlying failure
        cause: String,
    },

    /// Session is not connected
    #[error("Server '{server}' in toolbox '{toolbox}' is not connected")]
    NotConnected {
        /// Toolbox name
        toolbox: String,
        /// Server name
        server: String,
    },

    /// Downstream call failed to execute
    #[error("Call to '{name}' on server '{server}' in toolbox '{toolbox}' failed: {cause}")]
    Delegation {
        /// Toolbox name
        toolbox: String,
        /// Server name
        server: String,
        /// Original tool name
        name: String,
        /// Underlying failure
        cause: String,
    },

    /// A qualified-name component is empty or ambiguous
    #[error("Invalid {component} name '{value}'")]
    InvalidComponent {
        /// Which component (toolbox, server, tool)
        component: &'static str,
        /// Offending value
        value: String,
    },

    /// Qualified name could not be decoded
    #[error("Invalid qualified tool name: '{raw}'")]
    InvalidQualifiedName {
        /// Raw input
        raw: String,
    },

    /// Backend timeout
    #[error("Backend timeout: {0}")]
    BackendTimeout(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON-RPC error
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
        /// Optional data
        data: Option<serde_json::Value>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a JSON-RPC error
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Whether the error means the downstream connection itself is broken.
    ///
    /// Sessions move to `Failed` on these; JSON-RPC level errors leave the
    /// connection usable.
    #[must_use]
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Io(_) | Self::Http(_) | Self::BackendTimeout(_)
        )
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::Protocol(_) => rpc_codes::INVALID_REQUEST,
            Self::InvalidComponent { .. } | Self::InvalidQualifiedName { .. } => {
                rpc_codes::INVALID_PARAMS
            }
            Self::ToolboxNotFound(_)
            | Self::ServerNotFound { .. }
            | Self::ToolNotFound { .. } => -32001,
            Self::AlreadyOpen(_) | Self::NotOpen(_) => -32002,
            Self::Connection { .. }
            | Self::NotConnected { .. }
            | Self::Delegation { .. }
            | Self::BackendTimeout(_)
            | Self::Transport(_) => rpc_codes::SERVER_ERROR_START,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }
}

/// Standard JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server error range start
    pub const SERVER_ERROR_START: i32 = -32000;
}
