//! Toolbox gateway - open and close groups of MCP servers on demand

use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use tracing::{error, info};

use toolbox_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(Command::Completions { shell }) = cli.command {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        clap_complete::generate(shell, &mut command, name, &mut std::io::stdout());
        return ExitCode::SUCCESS;
    }

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Validate) => run_validate(&config),
        Some(Command::Stdio) => finish(Gateway::new(config).run_stdio().await),
        Some(Command::Serve) | None => finish(Gateway::new(config).run().await),
        Some(Command::Completions { .. }) => ExitCode::SUCCESS,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> toolbox_gateway::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    Ok(config)
}

fn run_validate(config: &Config) -> ExitCode {
    println!(
        "Configuration valid: {} toolbox(es), mode {}",
        config.toolboxes.len(),
        config.mode.as_str()
    );
    for toolbox in &config.toolboxes {
        println!("\n{}", toolbox.name);
        if !toolbox.description.is_empty() {
            println!("   {}", toolbox.description);
        }
        for server in &toolbox.servers {
            println!(
                "   - {} ({})",
                server.name,
                server.transport.transport_type()
            );
        }
        if !toolbox.tools.allow.is_empty() {
            println!("   allow: {}", toolbox.tools.allow.join(", "));
        }
        if !toolbox.tools.deny.is_empty() {
            println!("   deny: {}", toolbox.tools.deny.join(", "));
        }
    }
    ExitCode::SUCCESS
}

fn finish(result: toolbox_gateway::Result<()>) -> ExitCode {
    match result {
        Ok(()) => {
            info!("Gateway shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Gateway error: {e}");
            ExitCode::FAILURE
        }
    }
}
