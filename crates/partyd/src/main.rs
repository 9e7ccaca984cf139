//! partyd - partynet protocol participant daemon
//!
//! Connects to a relay or to mesh neighbors, then executes operator commands
//! arriving from the network or from stdin.

use clap::Parser;
use partyd::config::{Config, LogFormat};
use partyd::node::Node;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let level = if config.verbose { "partyd=debug" } else { "partyd=info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(level.parse()?)
        .add_directive("partynet_net=info".parse()?)
        .add_directive("partynet_core=info".parse()?);
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

    info!(
        "partyd v{} - party {} of [{}] over {:?}",
        env!("CARGO_PKG_VERSION"),
        config.id,
        config
            .parties
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        config.mode
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal.cancel();
        }
    });

    let node = match Node::connect(&config, shutdown.clone()).await {
        Ok(node) => Arc::new(node),
        Err(e) => {
            error!("Failed to join topology: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(command) = &config.command {
        if node.wait_ready().await {
            node.topology().issue_command(command).await;
        }
    }

    if config.stdin {
        let operator = node.clone();
        tokio::spawn(async move { operator.read_commands(tokio::io::stdin()).await });
    }

    if let Err(e) = node.run().await {
        error!("Node error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
