//! Hoot Gateway - multi-tenant MCP client gateway.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use hoot_gateway::{cli::Cli, config::Config, gateway::Gateway, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
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

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        "Starting Hoot gateway"
    );

    if let Err(e) = Gateway::new(config).run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
