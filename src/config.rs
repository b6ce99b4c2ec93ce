//! Configuration management

use std::{
    collections::{HashMap, HashSet},
    env,
    path::Path,
    sync::LazyLock,
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::naming::validate_prefix_component;
use crate::toolbox::ToolFilter;
use crate::{Error, Result};

/// `${VAR}` or `${VAR:-default}`
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid env var pattern")
});

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before expanding `${VAR}` references.
    /// Paths support ~ expansion. Later files override earlier ones.
    pub env_files: Vec<String>,
    /// Upstream HTTP server configuration
    pub server: ServerConfig,
    /// How downstream tools reach upstream clients
    pub mode: DispatchMode,
    /// Downstream session settings
    pub sessions: SessionConfig,
    /// Streaming configuration (SSE notifications)
    pub streaming: StreamingConfig,
    /// Toolboxes, in the order they are listed to clients
    pub toolboxes: Vec<ToolboxConfig>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// The result is fully expanded and validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("TOOLBOX_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in server connection parameters
    fn expand_env_vars(&mut self) {
        for toolbox in &mut self.toolboxes {
            for server in &mut toolbox.servers {
                match &mut server.transport {
                    TransportConfig::Stdio { command, cwd } => {
                        *command = expand_string(command);
                        if let Some(dir) = cwd {
                            *dir = expand_string(dir);
                        }
                    }
                    TransportConfig::Http { http_url, .. } => {
                        *http_url = expand_string(http_url);
                    }
                }
                for value in server.env.values_mut() {
                    *value = expand_string(value);
                }
                for value in server.headers.values_mut() {
                    *value = expand_string(value);
                }
            }
        }
    }

    /// Check structural invariants the toolbox engine relies on
    pub fn validate(&self) -> Result<()> {
        if self.toolboxes.is_empty() {
            return Err(Error::Config("No toolboxes configured".to_string()));
        }

        let mut toolbox_names = HashSet::new();
        for toolbox in &self.toolboxes {
            validate_prefix_component("toolbox", &toolbox.name)
                .map_err(|e| Error::Config(e.to_string()))?;
            if !toolbox_names.insert(toolbox.name.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate toolbox name: {}",
                    toolbox.name
                )));
            }
            if toolbox.servers.is_empty() {
                return Err(Error::Config(format!(
                    "Toolbox '{}' has no servers",
                    toolbox.name
                )));
            }

            let mut server_names = HashSet::new();
            for server in &toolbox.servers {
                validate_prefix_component("server", &server.name).map_err(|e| {
                    Error::Config(format!("Toolbox '{}': {e}", toolbox.name))
                })?;
                if !server_names.insert(server.name.as_str()) {
                    return Err(Error::Config(format!(
                        "Duplicate server name '{}' in toolbox '{}'",
                        server.name, toolbox.name
                    )));
                }
                server.transport.validate().map_err(|reason| {
                    Error::Config(format!(
                        "Server '{}' in toolbox '{}': {reason}",
                        server.name, toolbox.name
                    ))
                })?;
            }

            ToolFilter::from_config(&toolbox.tools).map_err(|e| {
                Error::Config(format!("Toolbox '{}': {e}", toolbox.name))
            })?;
        }

        Ok(())
    }

    /// Find a toolbox by name
    #[must_use]
    pub fn toolbox(&self, name: &str) -> Option<&ToolboxConfig> {
        self.toolboxes.iter().find(|t| t.name == name)
    }
}

/// Expand environment variables in a string
fn expand_string(value: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
}

/// Upstream HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            shutdown_timeout: Duration::from_secs(10),
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// Strategy used to expose downstream tools upstream.
///
/// Chosen once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Every tool of an open toolbox is registered under its qualified name
    Dynamic,
    /// A single `use_tool` meta-tool addresses tools explicitly
    #[default]
    Proxy,
}

impl DispatchMode {
    /// Lowercase name, as written in configuration
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dynamic => "dynamic",
            Self::Proxy => "proxy",
        }
    }
}

/// Downstream session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on establishing one downstream connection
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Upper bound on one downstream request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Maximum concurrent connects while opening a toolbox (0 = unlimited)
    pub max_concurrent_connects: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            max_concurrent_connects: 0,
        }
    }
}

/// Streaming configuration (for real-time notifications)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Notification buffer size per client
    pub buffer_size: usize,
    /// Keep-alive interval for SSE streams
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            keep_alive_interval: Duration::from_secs(15),
        }
    }
}

/// A named group of downstream servers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolboxConfig {
    /// Toolbox name (unique)
    pub name: String,
    /// Human-readable description shown by `list_toolboxes`
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Downstream servers, in connect/report order
    pub servers: Vec<ServerDefinition>,
    /// Tool allow/deny filter
    pub tools: ToolFilterConfig,
}

/// Allow/deny glob patterns applied to downstream tool names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolFilterConfig {
    /// If non-empty, only matching tools are exposed
    pub allow: Vec<String>,
    /// Matching tools are never exposed
    pub deny: Vec<String>,
}

/// One downstream MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDefinition {
    /// Server name (unique within its toolbox)
    pub name: String,
    /// Transport parameters
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Environment variables (for stdio)
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// HTTP headers (for http/sse)
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportConfig {
    /// Stdio transport (subprocess)
    Stdio {
        /// Command line to execute
        command: String,
        /// Working directory
        #[serde(default)]
        cwd: Option<String>,
    },
    /// HTTP transport
    Http {
        /// HTTP URL
        http_url: String,
        /// Use Streamable HTTP (direct POST, no SSE handshake)
        #[serde(default)]
        streamable_http: bool,
        /// Override protocol version (for servers that only support older versions)
        #[serde(default)]
        protocol_version: Option<String>,
    },
}

impl TransportConfig {
    /// Get transport type name
    #[must_use]
    pub fn transport_type(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http {
                http_url,
                streamable_http: false,
                ..
            } if http_url.ends_with("/sse") => "sse",
            Self::Http {
                streamable_http: true,
                ..
            } => "streamable-http",
            Self::Http { .. } => "http",
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Self::Stdio { command, .. } => match shlex::split(command) {
                Some(parts) if !parts.is_empty() => Ok(()),
                Some(_) => Err("empty command".to_string()),
                None => Err(format!("unparseable command: {command}")),
            },
            Self::Http { http_url, .. } => url::Url::parse(http_url)
                .map(|_| ())
                .map_err(|e| format!("invalid http_url '{http_url}': {e}")),
        }
    }
}

/// Humantime-style serde for Duration (`"30s"`, `"5m"`, `"100ms"`)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration string
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse `"30s"`, `"5m"`, `"100ms"`, or bare seconds
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" before "s": "100ms" also ends with 's'
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
