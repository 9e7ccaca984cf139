//! Participant node
//!
//! Joins a topology, then executes operator commands from the topology's
//! command queue one at a time. A `sum:<session>` command runs the sum
//! protocol through the bridging loop; every party that sees the command
//! joins the same run.

use crate::config::{Config, Mode, PeerAddr};
use partynet_core::sum::{SumHandler, PROTOCOL};
use partynet_core::{Command, PartyId, PartyIds, ProtocolError, SessionId};
use partynet_net::{
    accept_loop, dial_with_backoff, run_handler, BridgeError, DialPolicy, MeshNetwork, Network,
    RelayClient, TransportError,
};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const READY_POLL: Duration = Duration::from_millis(100);

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Run failed: {0}")]
    Bridge(#[from] BridgeError),
    #[error("Command queue already taken")]
    CommandsTaken,
}

/// The topology a node is attached to
///
/// [`Network`] is not object safe, so the two concrete topologies are
/// dispatched by hand.
#[derive(Clone)]
pub enum Topology {
    Relay(Arc<RelayClient>),
    Mesh(Arc<MeshNetwork>),
}

impl Topology {
    fn take_commands(&self) -> Option<mpsc::Receiver<Command>> {
        match self {
            Self::Relay(relay) => relay.take_commands(),
            Self::Mesh(mesh) => mesh.take_commands(),
        }
    }

    /// Send a command to every party, this one included
    pub async fn issue_command(&self, command: &Command) {
        match self {
            Self::Relay(relay) => relay.issue_command(command).await,
            Self::Mesh(mesh) => mesh.issue_command(command).await,
        }
    }

    /// Fires when the topology can no longer carry messages
    fn closed(&self, id: &PartyId) -> CancellationToken {
        match self {
            Self::Relay(relay) => relay.done(id),
            Self::Mesh(mesh) => mesh.done(id),
        }
    }

    async fn run_sum(
        &self,
        id: &PartyId,
        handler: SumHandler,
        shutdown: &CancellationToken,
    ) -> Result<i64, BridgeError> {
        match self {
            Self::Relay(relay) => run_handler(id, handler, relay.clone(), shutdown).await,
            Self::Mesh(mesh) => run_handler(id, handler, mesh.clone(), shutdown).await,
        }
    }
}

/// Result of one executed command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Sum { session: String, total: i64 },
    SumFailed { session: String, reason: String },
    Peers(Vec<PartyId>),
    Quit,
}

/// One protocol participant
pub struct Node {
    id: PartyId,
    parties: PartyIds,
    contribution: Option<i64>,
    topology: Topology,
    outcomes: broadcast::Sender<Outcome>,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(
        id: PartyId,
        parties: PartyIds,
        contribution: Option<i64>,
        topology: Topology,
        shutdown: CancellationToken,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(16);
        Self {
            id,
            parties,
            contribution,
            topology,
            outcomes,
            shutdown,
        }
    }

    /// Join the configured topology
    pub async fn connect(config: &Config, shutdown: CancellationToken) -> Result<Self, NodeError> {
        let policy = DialPolicy {
            timeout: config.dial_timeout(),
            ..DialPolicy::default()
        };

        let topology = match config.mode {
            Mode::Relay => {
                let stream = dial_with_backoff(config.relay.as_str(), policy, &shutdown).await?;
                Topology::Relay(RelayClient::connect(
                    config.id.clone(),
                    stream,
                    config.queue_capacity,
                    &shutdown,
                ))
            }
            Mode::Mesh => {
                let mesh = MeshNetwork::new(
                    config.id.clone(),
                    config.neighbor_ids(),
                    config.queue_capacity,
                    &shutdown,
                );
                if let Some(addr) = config.listen {
                    let listener = TcpListener::bind(addr)
                        .await
                        .map_err(|source| NodeError::BindFailed { addr, source })?;
                    info!("Party {} listening on {}", config.id, addr);
                    let server = mesh.clone();
                    tokio::spawn(accept_loop(listener, shutdown.clone(), move |stream, _addr| {
                        let server = server.clone();
                        async move { server.handle_conn(stream, None).await }
                    }));
                }
                for peer in &config.peers {
                    let dial = dial_neighbor(mesh.clone(), peer.clone(), policy, shutdown.clone());
                    tokio::spawn(dial);
                }
                Topology::Mesh(mesh)
            }
        };

        Ok(Self::new(
            config.id.clone(),
            config.party_ids(),
            config.contribution,
            topology,
            shutdown,
        ))
    }

    pub fn id(&self) -> &PartyId {
        &self.id
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Wait until every mesh neighbor is connected. A relay gives no such
    /// signal, so this returns at once there. False on shutdown.
    pub async fn wait_ready(&self) -> bool {
        let Topology::Mesh(mesh) = &self.topology else {
            return true;
        };
        while mesh.connected().len() < mesh.neighbors().len() {
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = sleep(READY_POLL) => {}
            }
        }
        true
    }

    /// Receive the outcome of every command executed from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Outcome> {
        self.outcomes.subscribe()
    }

    /// Execute commands until shutdown, `quit`, or loss of the topology
    pub async fn run(&self) -> Result<(), NodeError> {
        let mut commands = self.topology.take_commands().ok_or(NodeError::CommandsTaken)?;
        let closed = self.topology.closed(&self.id);
        info!("Party {} ready", self.id);

        loop {
            let command = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = closed.cancelled() => {
                    warn!("Party {}: topology closed", self.id);
                    break;
                }
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            info!("Party {}: execute cmd {}", self.id, command);
            let outcome = match self.execute(&command).await {
                Ok(outcome) => outcome,
                Err(NodeError::Bridge(BridgeError::Cancelled)) => break,
                Err(e) => {
                    let Command::Sum { session } = command else {
                        return Err(e);
                    };
                    error!("Party {}: sum {} failed: {}", self.id, session, e);
                    Outcome::SumFailed {
                        session,
                        reason: e.to_string(),
                    }
                }
            };
            // No subscribers is fine
            let _ = self.outcomes.send(outcome.clone());
            if outcome == Outcome::Quit {
                self.shutdown.cancel();
                break;
            }
        }

        info!("Party {} stopped", self.id);
        Ok(())
    }

    /// Execute one command
    pub async fn execute(&self, command: &Command) -> Result<Outcome, NodeError> {
        match command {
            Command::Sum { session } => {
                let total = self.run_sum(session).await?;
                info!("Party {}: sum {} = {}", self.id, session, total);
                Ok(Outcome::Sum {
                    session: session.clone(),
                    total,
                })
            }
            Command::Peers => {
                let peers = self.peers();
                info!("Party {}: peers [{}]", self.id, join(&peers));
                Ok(Outcome::Peers(peers))
            }
            Command::Quit => {
                info!("Party {}: quit requested", self.id);
                Ok(Outcome::Quit)
            }
        }
    }

    async fn run_sum(&self, session: &str) -> Result<i64, NodeError> {
        let ssid = SessionId::derive(PROTOCOL, &self.parties, session.as_bytes());
        let contribution = self
            .contribution
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..1000));
        info!(
            "Party {}: joining sum {} ({}) with {}",
            self.id, session, ssid, contribution
        );
        let handler = SumHandler::new(ssid, self.id.clone(), &self.parties, contribution)?;
        Ok(self.topology.run_sum(&self.id, handler, &self.shutdown).await?)
    }

    /// Parties currently reachable
    fn peers(&self) -> Vec<PartyId> {
        match &self.topology {
            Topology::Mesh(mesh) => mesh.connected(),
            Topology::Relay(relay) if relay.is_closed() => Vec::new(),
            Topology::Relay(_) => self.parties.others(&self.id),
        }
    }

    /// Issue one command per line read from `reader` (operator terminal)
    pub async fn read_commands<R>(&self, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Operator input failed: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<Command>() {
                Ok(command) => self.topology.issue_command(&command).await,
                Err(e) => warn!("Ignoring operator input {:?}: {}", line, e),
            }
        }
    }
}

async fn dial_neighbor(
    mesh: Arc<MeshNetwork>,
    peer: PeerAddr,
    policy: DialPolicy,
    shutdown: CancellationToken,
) {
    match dial_with_backoff(peer.addr.as_str(), policy, &shutdown).await {
        Ok(stream) => mesh.handle_conn(stream, peer.party).await,
        Err(TransportError::Cancelled) => {}
        Err(e) => {
            error!("Party {}: giving up on {}: {}", mesh.id(), peer, e);
            shutdown.cancel();
        }
    }
}

fn join(ids: &[PartyId]) -> String {
    ids.iter().map(PartyId::as_str).collect::<Vec<_>>().join(", ")
}
