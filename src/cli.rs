//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use crate::config::DispatchMode;

/// MCP toolbox gateway - open and close groups of MCP servers on demand
#[derive(Parser, Debug)]
#[command(name = "toolbox-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TOOLBOX_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "TOOLBOX_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "TOOLBOX_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Dispatch mode (overrides the configuration file)
    #[arg(long, value_enum, env = "TOOLBOX_GATEWAY_MODE", global = true)]
    pub mode: Option<DispatchMode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "TOOLBOX_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TOOLBOX_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to the HTTP server)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve MCP over HTTP (default)
    Serve,

    /// Serve MCP over stdin/stdout
    Stdio,

    /// Load and validate the configuration, then print a toolbox summary
    Validate,

    /// Print shell completions
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: Shell,
    },
}
