//! partyd configuration

use clap::{Parser, ValueEnum};
use partynet_core::{Command, PartyId, PartyIds};
use partynet_net::DEFAULT_QUEUE_CAPACITY;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Which topology the participant joins
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// One connection to a broadcast relay
    #[default]
    Relay,
    /// Direct connections to every neighbor
    Mesh,
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

/// Address of a mesh neighbor to dial, optionally labeled with its party id
/// (`b=127.0.0.1:7001` or `127.0.0.1:7001`)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddr {
    pub party: Option<PartyId>,
    pub addr: String,
}

impl FromStr for PeerAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (party, addr) = match s.split_once('=') {
            Some((party, addr)) => {
                let party = party.parse::<PartyId>().map_err(|e| e.to_string())?;
                (Some(party), addr)
            }
            None => (None, s),
        };
        if addr.is_empty() {
            return Err(format!("missing address in {s:?}"));
        }
        Ok(Self {
            party,
            addr: addr.to_string(),
        })
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.party {
            Some(party) => write!(f, "{}={}", party, self.addr),
            None => f.write_str(&self.addr),
        }
    }
}

/// partynet protocol participant
#[derive(Parser, Debug, Clone)]
#[command(name = "partyd")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// This participant's party id
    #[arg(long, env = "PARTYD_ID")]
    pub id: PartyId,

    /// Every party of the group, this one included (comma-separated)
    #[arg(long, env = "PARTYD_PARTIES", value_delimiter = ',', required = true)]
    pub parties: Vec<PartyId>,

    /// Topology to join
    #[arg(long, value_enum, default_value_t = Mode::Relay)]
    pub mode: Mode,

    /// Relay address (relay mode)
    #[arg(long, default_value = "127.0.0.1:7000")]
    pub relay: String,

    /// Listen address for neighbor connections (mesh mode)
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Neighbors to dial (mesh mode, repeatable, `id=host:port`)
    #[arg(long = "peer")]
    pub peers: Vec<PeerAddr>,

    /// Neighbor set in slot order (mesh mode, default: every other party)
    #[arg(long, value_delimiter = ',')]
    pub neighbors: Vec<PartyId>,

    /// Contribution to sum runs (default: random per run)
    #[arg(long)]
    pub contribution: Option<i64>,

    /// Command to issue once connected, e.g. `sum:run1`
    #[arg(long)]
    pub command: Option<Command>,

    /// Read operator commands from stdin
    #[arg(long)]
    pub stdin: bool,

    /// Give up dialing after this many seconds
    #[arg(long, default_value = "60")]
    pub dial_timeout_secs: u64,

    /// Capacity of bounded inbox, command and connection queues
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl Config {
    /// Sorted party set
    pub fn party_ids(&self) -> PartyIds {
        PartyIds::new(self.parties.iter().cloned())
    }

    /// Neighbor set in slot order
    pub fn neighbor_ids(&self) -> Vec<PartyId> {
        if self.neighbors.is_empty() {
            self.party_ids().others(&self.id)
        } else {
            self.neighbors.clone()
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let parties = self.party_ids();
        if parties.len() < 2 {
            anyhow::bail!("At least two parties are required");
        }
        if parties.len() != self.parties.len() {
            anyhow::bail!("Party list contains duplicates");
        }
        if !parties.contains(&self.id) {
            anyhow::bail!("Party {} is not in the party list", self.id);
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("Queue capacity must be at least 1");
        }

        if self.mode == Mode::Mesh {
            let neighbors = self.neighbor_ids();
            for neighbor in &neighbors {
                if neighbor == &self.id {
                    anyhow::bail!("Party {} cannot be its own neighbor", self.id);
                }
                if !parties.contains(neighbor) {
                    anyhow::bail!("Neighbor {} is not in the party list", neighbor);
                }
            }
            if self.listen.is_none() && self.peers.is_empty() {
                anyhow::bail!("Mesh mode needs --listen or at least one --peer");
            }
            for peer in &self.peers {
                if let Some(party) = &peer.party {
                    if !neighbors.contains(party) {
                        anyhow::bail!("Peer {} is not a neighbor", peer);
                    }
                }
            }
        }
        Ok(())
    }
}
