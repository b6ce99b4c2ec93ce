//! MCP Protocol types

mod messages;
mod types;

pub use messages::*;
pub use types::*;

/// MCP Protocol version (latest supported)
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol versions accepted from upstream clients, newest first
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Pick the protocol version to answer an `initialize` with.
///
/// Echoes the client's version when supported, otherwise falls back to the
/// latest one.
pub fn negotiate_version(client_version: &str) -> &'static str {
    SUPPORTED_VERSIONS
        .iter()
        .find(|v| **v == client_version)
        .copied()
        .unwrap_or(PROTOCOL_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiates_supported_versions() {
        assert_eq!(negotiate_version("2024-11-05"), "2024-11-05");
        assert_eq!(negotiate_version("2025-03-26"), "2025-03-26");
    }

    #[test]
    fn falls_back_to_latest() {
        assert_eq!(negotiate_version("2023-01-01"), PROTOCOL_VERSION);
        assert_eq!(negotiate_version(""), PROTOCOL_VERSION);
    }
}
