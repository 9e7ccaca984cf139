//! Configuration for relayd

use clap::{Parser, ValueEnum};
use partynet_net::DEFAULT_QUEUE_CAPACITY;
use std::net::SocketAddr;

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

/// relayd - partynet broadcast relay
#[derive(Parser, Debug, Clone)]
#[command(name = "relayd")]
#[command(about = "partynet broadcast relay daemon")]
pub struct Config {
    /// Listen address for participant connections
    #[arg(short, long, env = "RELAYD_LISTEN", default_value = "0.0.0.0:7000")]
    pub listen: SocketAddr,

    /// Capacity of each per-connection outbound queue
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Statistics log interval in seconds (0 disables)
    #[arg(long, default_value = "60")]
    pub stats_interval_secs: u64,

    /// Exit once the last participant has disconnected
    #[arg(long)]
    pub exit_when_idle: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_capacity == 0 {
            anyhow::bail!("Queue capacity must be at least 1");
        }
        Ok(())
    }
}
