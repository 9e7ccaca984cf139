//! relayd - partynet broadcast relay daemon
//!
//! Every participant connects here; every line received is written back to
//! every connected participant.

use clap::Parser;
use relayd::config::{Config, LogFormat};
use relayd::server::Server;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let level = if config.verbose { "relayd=debug" } else { "relayd=info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(level.parse()?)
        .add_directive("partynet_net=info".parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    if let Err(e) = init_logging(&config) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    info!("relayd v{} - partynet broadcast relay", env!("CARGO_PKG_VERSION"));

    let server = Server::new(config);

    // Install signal handler
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            shutdown.cancel();
        }
    });

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
