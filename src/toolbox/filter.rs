//! Allow/deny filtering of downstream tool names.
//!
//! Patterns are shell globs (`read_*`, `*_file`, `git_?`), matched against
//! the tool name exactly as the downstream server reports it.
//!
//! # Precedence
//!
//! 1. If the `allow` list is non-empty, a tool must match at least one
//!    allow pattern, otherwise it is hidden regardless of the deny list.
//! 2. If the tool matches any deny pattern, it is hidden.
//! 3. Otherwise it is exposed.

use glob::Pattern;

use crate::config::ToolFilterConfig;
use crate::{Error, Result};

/// Compiled tool filter for one toolbox
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    allow: Vec<Pattern>,
    deny: Vec<Pattern>,
}

impl ToolFilter {
    /// Compile the configured patterns
    pub fn from_config(config: &ToolFilterConfig) -> Result<Self> {
        Ok(Self {
            allow: compile(&config.allow)?,
            deny: compile(&config.deny)?,
        })
    }

    /// Filter that exposes every tool
    #[must_use]
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Test whether a tool name is exposed by this filter.
    #[must_use]
    pub fn is_allowed(&self, tool: &str) -> bool {
        if !self.allow.is_empty() && !self.allow.iter().any(|p| p.matches(tool)) {
            return false;
        }
        !self.deny.iter().any(|p| p.matches(tool))
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| Error::Config(format!("Invalid tool pattern '{p}': {e}")))
        })
        .collect()
}
