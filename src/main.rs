//! Retrieval Gateway - two-tier access control plane for retrieval tools.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use retrieval_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    server::ToolServer,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Gateway => {
            info!(
                version = env!("CARGO_PKG_VERSION"),
                port = config.server.port,
                "Starting Gateway"
            );
            let gateway = match Gateway::new(config) {
                Ok(g) => g,
                Err(e) => {
                    error!("Failed to create gateway: {e}");
                    return ExitCode::FAILURE;
                }
            };
            if let Err(e) = gateway.run().await {
                error!("Gateway error: {e}");
                return ExitCode::FAILURE;
            }
        }
        Command::ToolServer => {
            info!(
                version = env!("CARGO_PKG_VERSION"),
                port = config.server.port,
                profile = ?config.profile.profile,
                "Starting Tool Server"
            );
            let server = match ToolServer::new(config) {
                Ok(s) => s,
                Err(e) => {
                    error!("Failed to create tool server: {e}");
                    return ExitCode::FAILURE;
                }
            };
            if let Err(e) = server.run().await {
                error!("Tool Server error: {e}");
                return ExitCode::FAILURE;
            }
        }
        Command::CheckConfig => {
            if let Err(e) = config.validate() {
                error!("Configuration invalid: {e}");
                return ExitCode::FAILURE;
            }
            let flags = config.profile.stage_flags();
            println!("configuration ok");
            println!("profile: {:?}", config.profile.profile);
            println!(
                "stages: logging={} validation={} auth={} rate_limit={} metrics={} cache={}",
                flags.logging,
                flags.validation,
                flags.auth,
                flags.rate_limit,
                flags.metrics,
                flags.cache
            );
        }
    }

    ExitCode::SUCCESS
}
