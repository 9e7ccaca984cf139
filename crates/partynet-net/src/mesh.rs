//! Peer mesh topology
//!
//! Each participant holds direct connections to a fixed neighbor set.
//! Messages go only to the connections whose neighbor they are for. Operator
//! commands are executed locally and forwarded once to every neighbor as
//! `bcmd:` lines; forwarded commands are never forwarded again.

use crate::conn::{enqueue, next_line, write_loop};
use crate::framing::{encode_line, parse_line, LineCodec};
use crate::network::{Inbox, Network};
use crate::registry::{ClientRegistry, ClientSerial};
use crate::relay::queue_command;
use parking_lot::Mutex;
use partynet_core::{Command, Message, PartyId, WireLine};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// One participant's view of the mesh
pub struct MeshNetwork {
    id: PartyId,
    neighbors: Vec<PartyId>,
    registry: ClientRegistry,
    capacity: usize,
    inbox_tx: mpsc::Sender<Message>,
    inbox: Inbox,
    commands_tx: mpsc::Sender<Command>,
    commands: Mutex<Option<mpsc::Receiver<Command>>>,
    shutdown: CancellationToken,
}

impl MeshNetwork {
    /// Create the local end of a mesh. `neighbors` is the ordered list of
    /// parties this participant will hold connections to.
    pub fn new(
        id: PartyId,
        neighbors: Vec<PartyId>,
        capacity: usize,
        shutdown: &CancellationToken,
    ) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(capacity);
        let (commands_tx, commands_rx) = mpsc::channel(capacity);
        Arc::new(Self {
            id,
            neighbors,
            registry: ClientRegistry::new(),
            capacity,
            inbox_tx,
            inbox: Inbox::new(inbox_rx),
            commands_tx,
            commands: Mutex::new(Some(commands_rx)),
            shutdown: shutdown.child_token(),
        })
    }

    /// Serve one neighbor connection until it closes.
    ///
    /// A dialed connection (`hint` set) is bound to the dialed neighbor and
    /// dropped as a duplicate when that neighbor is already connected. An
    /// accepted connection takes the first free neighbor in configuration
    /// order, or is dropped when none is free.
    pub async fn handle_conn<S>(self: &Arc<Self>, stream: S, hint: Option<PartyId>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let serial = self.registry.next_serial();
        let (tx, rx) = mpsc::channel(self.capacity);
        let Some(party) = self
            .registry
            .enter_neighbor(serial, tx, &self.neighbors, hint.as_ref())
        else {
            match &hint {
                Some(hint) => {
                    info!("Party {}: already connected to {}, dropping dial", self.id, hint)
                }
                None => {
                    warn!("Party {}: no free neighbor slot, closing connection", self.id)
                }
            }
            return;
        };
        info!("Party {}: entering neighbor [{}]", self.id, party);

        let conn = self.shutdown.child_token();
        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(write_loop(write_half, rx, conn.clone()));

        let mut lines = FramedRead::new(read_half, LineCodec::new());
        while let Some(line) = next_line(&mut lines, &conn).await {
            match parse_line(&line) {
                Ok(None) => {}
                Ok(Some(WireLine::Command(text))) => {
                    self.on_command(serial, &text).await;
                }
                Ok(Some(WireLine::ForwardedCommand(text))) => {
                    queue_command(&self.commands_tx, &text);
                }
                Ok(Some(WireLine::Message(msg))) => {
                    if !msg.is_for(&self.id) {
                        trace!("Party {} skipping message from {}", self.id, msg.sender());
                        continue;
                    }
                    if !enqueue(&self.inbox_tx, msg, &conn).await {
                        break;
                    }
                }
                Err(e) => warn!(
                    "Party {}: dropped undecodable line from {}: {}",
                    self.id, party, e
                ),
            }
        }

        self.registry.leave(serial);
        conn.cancel();
        info!("Party {}: neighbor [{}] left", self.id, party);
    }

    /// `cmd:` read from a connection: forward to the other neighbors, then
    /// run locally
    async fn on_command(&self, origin: ClientSerial, text: &str) {
        let command = match text.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                warn!("Party {}: ignoring command {:?}: {}", self.id, text, e);
                return;
            }
        };
        self.forward_command(&command, Some(origin)).await;
        queue_command(&self.commands_tx, &command.to_string());
    }

    async fn forward_command(&self, command: &Command, skip: Option<ClientSerial>) {
        let line = match encode_line(&WireLine::ForwardedCommand(command.to_string())) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode command {}: {}", command, e);
                return;
            }
        };
        for client in self.registry.snapshot() {
            if Some(client.serial) == skip {
                continue;
            }
            if !client.deliver(line.clone(), &self.shutdown).await {
                debug!("Party {}: neighbor gone before command delivery", self.id);
            }
        }
    }

    /// Run a command locally and forward it to every neighbor
    pub async fn issue_command(&self, command: &Command) {
        self.forward_command(command, None).await;
        queue_command(&self.commands_tx, &command.to_string());
    }

    /// Hand out the command queue. Returns `None` once taken.
    pub fn take_commands(&self) -> Option<mpsc::Receiver<Command>> {
        self.commands.lock().take()
    }

    pub fn id(&self) -> &PartyId {
        &self.id
    }

    /// Configured neighbor set
    pub fn neighbors(&self) -> &[PartyId] {
        &self.neighbors
    }

    /// Neighbors with a live connection
    pub fn connected(&self) -> Vec<PartyId> {
        self.registry.parties()
    }
}

impl Network for MeshNetwork {
    fn next(&self, id: &PartyId) -> Inbox {
        if id == &self.id {
            self.inbox.clone()
        } else {
            debug!("Mesh node {} has no inbox for {}", self.id, id);
            Inbox::closed()
        }
    }

    async fn send(&self, msg: Message) {
        let targets: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|c| c.party.as_ref().is_some_and(|p| msg.is_for(p)))
            .collect();
        if targets.is_empty() {
            debug!("Party {}: no connected recipient for message", self.id);
            return;
        }

        let line = match encode_line(&WireLine::Message(msg)) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode message: {}", e);
                return;
            }
        };
        for client in targets {
            if !client.deliver(line.clone(), &self.shutdown).await {
                debug!("Party {}: neighbor gone, message dropped", self.id);
            }
        }
    }

    fn done(&self, _id: &PartyId) -> CancellationToken {
        self.shutdown.clone()
    }

    fn quit(&self, _id: &PartyId) {}
}
