//! Broadcast relay topology
//!
//! A star: every participant holds one connection to a relay process, and the
//! relay writes every line it reads to every connected client, including the
//! one that sent it. The relay never looks inside a line. Each
//! [`RelayClient`] filters what it reads with [`Message::is_for`].

use crate::conn::{enqueue, next_line, write_loop};
use crate::framing::{encode_line, parse_line, LineCodec};
use crate::network::{Inbox, Network};
use crate::registry::{Client, ClientRegistry};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use partynet_core::{Command, Message, PartyId, WireLine};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

// =============================================================================
// CLIENT SIDE
// =============================================================================

/// A participant's connection to a relay
pub struct RelayClient {
    id: PartyId,
    outbound: mpsc::Sender<Bytes>,
    inbox: Inbox,
    commands: Mutex<Option<mpsc::Receiver<Command>>>,
    /// Cancelled when the relay connection ends
    closed: CancellationToken,
}

impl RelayClient {
    /// Attach to an established relay connection and start its reader and
    /// writer tasks
    pub fn connect<S>(
        id: PartyId,
        stream: S,
        capacity: usize,
        shutdown: &CancellationToken,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let closed = shutdown.child_token();

        tokio::spawn(write_loop(write_half, out_rx, closed.clone()));
        tokio::spawn(Self::read_loop(
            id.clone(),
            read_half,
            in_tx,
            cmd_tx,
            closed.clone(),
        ));

        info!("Party {} attached to relay", id);
        Arc::new(Self {
            id,
            outbound: out_tx,
            inbox: Inbox::new(in_rx),
            commands: Mutex::new(Some(cmd_rx)),
            closed,
        })
    }

    async fn read_loop<R>(
        id: PartyId,
        reader: R,
        inbox: mpsc::Sender<Message>,
        commands: mpsc::Sender<Command>,
        closed: CancellationToken,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut lines = FramedRead::new(reader, LineCodec::new());
        while let Some(line) = next_line(&mut lines, &closed).await {
            match parse_line(&line) {
                Ok(None) => {}
                // The relay forwards verbatim; both command forms mean "run locally"
                Ok(Some(WireLine::Command(text) | WireLine::ForwardedCommand(text))) => {
                    queue_command(&commands, &text);
                }
                Ok(Some(WireLine::Message(msg))) => {
                    if !msg.is_for(&id) {
                        trace!("Party {} skipping message from {}", id, msg.sender());
                        continue;
                    }
                    if !enqueue(&inbox, msg, &closed).await {
                        break;
                    }
                }
                Err(e) => warn!("Party {} dropped undecodable line: {}", id, e),
            }
        }
        info!("Relay connection of {} closed", id);
        closed.cancel();
    }

    /// Hand out the command queue. Returns `None` once taken.
    pub fn take_commands(&self) -> Option<mpsc::Receiver<Command>> {
        self.commands.lock().take()
    }

    /// Send an operator command through the relay to every client,
    /// this one included
    pub async fn issue_command(&self, command: &Command) {
        let line = match encode_line(&WireLine::Command(command.to_string())) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode command {}: {}", command, e);
                return;
            }
        };
        if !enqueue(&self.outbound, line, &self.closed).await {
            warn!("Relay connection closed, command {} not sent", command);
        }
    }

    pub fn id(&self) -> &PartyId {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Network for RelayClient {
    fn next(&self, id: &PartyId) -> Inbox {
        if id == &self.id {
            self.inbox.clone()
        } else {
            debug!("Relay client {} has no inbox for {}", self.id, id);
            Inbox::closed()
        }
    }

    async fn send(&self, msg: Message) {
        let line = match encode_line(&WireLine::Message(msg)) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode message: {}", e);
                return;
            }
        };
        if !enqueue(&self.outbound, line, &self.closed).await {
            debug!("Relay connection closed, message dropped");
        }
    }

    fn done(&self, _id: &PartyId) -> CancellationToken {
        self.closed.clone()
    }

    fn quit(&self, _id: &PartyId) {}
}

/// Decode command text and queue it without blocking the reader
pub(crate) fn queue_command(commands: &mpsc::Sender<Command>, text: &str) -> bool {
    let command = match text.parse::<Command>() {
        Ok(command) => command,
        Err(e) => {
            warn!("Ignoring command {:?}: {}", text, e);
            return false;
        }
    };
    match commands.try_send(command) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(command)) => {
            warn!("Command queue full, dropping {}", command);
            false
        }
        Err(mpsc::error::TrySendError::Closed(command)) => {
            debug!("No command consumer, dropping {}", command);
            false
        }
    }
}

// =============================================================================
// RELAY SIDE
// =============================================================================

/// Relay statistics
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub connections_accepted: u64,
    pub lines_relayed: u64,
    pub deliveries_failed: u64,
}

/// Address-agnostic rebroadcaster
pub struct RelayServer {
    registry: Arc<ClientRegistry>,
    fanout_tx: mpsc::Sender<Bytes>,
    capacity: usize,
    shutdown: CancellationToken,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    /// Create a relay and start its fan-out task
    pub fn new(capacity: usize, shutdown: &CancellationToken) -> Arc<Self> {
        let registry = Arc::new(ClientRegistry::new());
        let stats = Arc::new(RwLock::new(RelayStats::default()));
        let (fanout_tx, fanout_rx) = mpsc::channel(capacity);
        let shutdown = shutdown.child_token();

        tokio::spawn(Self::fan_out(
            registry.clone(),
            stats.clone(),
            fanout_rx,
            shutdown.clone(),
        ));

        Arc::new(Self {
            registry,
            fanout_tx,
            capacity,
            shutdown,
            stats,
        })
    }

    /// Single coordinator: every line goes to every registered client
    async fn fan_out(
        registry: Arc<ClientRegistry>,
        stats: Arc<RwLock<RelayStats>>,
        mut rx: mpsc::Receiver<Bytes>,
        shutdown: CancellationToken,
    ) {
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = rx.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
            };

            let clients = registry.snapshot();
            let mut failed = 0;
            for client in &clients {
                if !client.deliver(line.clone(), &shutdown).await {
                    trace!("Client {} left before delivery", client.serial);
                    failed += 1;
                }
            }

            {
                let mut stats = stats.write();
                stats.lines_relayed += 1;
                stats.deliveries_failed += failed;
            }
        }
        debug!("Relay fan-out stopped");
    }

    /// Serve one client connection until it closes
    pub async fn handle_conn<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let serial = self.registry.next_serial();
        let (tx, rx) = mpsc::channel(self.capacity);
        let conn = self.shutdown.child_token();
        let (read_half, write_half) = tokio::io::split(stream);

        tokio::spawn(write_loop(write_half, rx, conn.clone()));
        self.registry.enter(Client::new(serial, None, tx));
        self.stats.write().connections_accepted += 1;
        info!(
            "Client {} connected ({} connected)",
            serial,
            self.registry.len()
        );

        let mut lines = FramedRead::new(read_half, LineCodec::new());
        while let Some(line) = next_line(&mut lines, &conn).await {
            if line.is_empty() {
                continue;
            }
            if !enqueue(&self.fanout_tx, line, &conn).await {
                break;
            }
        }

        self.registry.leave(serial);
        conn.cancel();
        info!(
            "Client {} left ({} connected)",
            serial,
            self.registry.len()
        );
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.registry.len()
    }

    /// Cancelled once the last client has left
    pub fn done(&self) -> CancellationToken {
        self.registry.emptied()
    }

    /// Get relay statistics
    pub fn stats(&self) -> RelayStats {
        self.stats.read().clone()
    }
}
