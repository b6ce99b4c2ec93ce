//! Qualified tool names
//!
//! Every downstream tool is exposed upstream as
//! `<toolbox>__<server>__<tool>`. Toolbox and server names come from the
//! operator's configuration and are checked at encode time so they can never
//! swallow part of the separator. The tool name comes from the downstream
//! server and may contain anything, including the separator itself: decoding
//! only splits on the first two separators.

use std::fmt;

use crate::{Error, Result};

/// Separator between the three components of a qualified name.
pub const SEPARATOR: &str = "__";

/// A decoded `(toolbox, server, tool)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedToolName {
    /// Toolbox name
    pub toolbox: String,
    /// Server name within the toolbox
    pub server: String,
    /// Tool name as reported by the downstream server
    pub name: String,
}

impl QualifiedToolName {
    /// Build a triple, validating every component.
    pub fn new(
        toolbox: impl Into<String>,
        server: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self> {
        let qualified = Self {
            toolbox: toolbox.into(),
            server: server.into(),
            name: name.into(),
        };
        validate_prefix_component("toolbox", &qualified.toolbox)?;
        validate_prefix_component("server", &qualified.server)?;
        if qualified.name.is_empty() {
            return Err(Error::InvalidComponent {
                component: "tool",
                value: String::new(),
            });
        }
        Ok(qualified)
    }

    /// Parse a qualified name produced by [`encode`].
    pub fn parse(raw: &str) -> Result<Self> {
        decode(raw)
    }
}

impl fmt::Display for QualifiedToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.toolbox, self.server, self.name
        )
    }
}

/// Encode `(toolbox, server, name)` into a single upstream tool name.
pub fn encode(toolbox: &str, server: &str, name: &str) -> Result<String> {
    QualifiedToolName::new(toolbox, server, name).map(|q| q.to_string())
}

/// Decode a qualified name back into its three components.
///
/// Anything after the second separator belongs to the tool name.
pub fn decode(raw: &str) -> Result<QualifiedToolName> {
    let invalid = || Error::InvalidQualifiedName {
        raw: raw.to_string(),
    };

    let mut parts = raw.splitn(3, SEPARATOR);
    let toolbox = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
    let server = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
    let name = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;

    Ok(QualifiedToolName {
        toolbox: toolbox.to_string(),
        server: server.to_string(),
        name: name.to_string(),
    })
}

/// Check that a toolbox or server name can sit in front of a separator.
///
/// The first separator found in `"{value}__"` must be the one we appended,
/// which rules out values containing `__` as well as values ending in `_`.
pub fn validate_prefix_component(component: &'static str, value: &str) -> Result<()> {
    let probe = format!("{value}{SEPARATOR}");
    if value.is_empty() || probe.find(SEPARATOR) != Some(value.len()) {
        return Err(Error::InvalidComponent {
            component,
            value: value.to_string(),
        });
    }
    Ok(())
}
