//! Topology contract
//!
//! A topology delivers addressed messages between parties. The bridging loop
//! only ever talks to a topology through [`Network`].

use partynet_core::{Message, PartyId, SessionId};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default capacity of bounded per-connection and per-party queues
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Most messages an inbox keeps for sessions that are not running
pub const MAX_HELD_MESSAGES: usize = 1024;

/// Receiving end of one party's incoming queue
///
/// Cheap to clone; clones share the queue. An inbox built with
/// [`Inbox::closed`] reports end of stream immediately.
///
/// Messages that arrive for a session other than the running one are set
/// aside with [`hold`](Inbox::hold) and handed back by
/// [`take_held`](Inbox::take_held) when that session starts.
#[derive(Clone, Debug)]
pub struct Inbox {
    rx: Option<Arc<Mutex<mpsc::Receiver<Message>>>>,
    held: Arc<parking_lot::Mutex<VecDeque<Message>>>,
}

impl Inbox {
    pub fn new(rx: mpsc::Receiver<Message>) -> Self {
        Self {
            rx: Some(Arc::new(Mutex::new(rx))),
            held: Arc::default(),
        }
    }

    /// An inbox that never yields
    pub fn closed() -> Self {
        Self {
            rx: None,
            held: Arc::default(),
        }
    }

    /// Keep a message for a later session. Past the limit the oldest held
    /// message is dropped.
    pub fn hold(&self, msg: Message) {
        let mut held = self.held.lock();
        held.push_back(msg);
        if held.len() > MAX_HELD_MESSAGES {
            if let Some(dropped) = held.pop_front() {
                warn!(
                    "Held message limit reached, dropping message from {} for session {}",
                    dropped.sender(),
                    dropped.ssid()
                );
            }
        }
    }

    /// Remove and return the held messages of `ssid`, in arrival order
    pub fn take_held(&self, ssid: &SessionId) -> Vec<Message> {
        let mut held = self.held.lock();
        let (matching, rest): (Vec<_>, Vec<_>) =
            held.drain(..).partition(|msg| msg.ssid() == ssid);
        *held = VecDeque::from(rest);
        matching
    }

    /// Number of messages currently held
    pub fn held_len(&self) -> usize {
        self.held.lock().len()
    }

    /// Next message, or `None` once every sender is gone
    pub async fn recv(&self) -> Option<Message> {
        let rx = self.rx.as_ref()?;
        rx.lock().await.recv().await
    }

    /// Non-blocking receive, used by tests and draining code
    pub fn try_recv(&self) -> Option<Message> {
        let rx = self.rx.as_ref()?;
        rx.try_lock().ok()?.try_recv().ok()
    }
}

/// A strategy for delivering messages between parties
pub trait Network: Send + Sync + 'static {
    /// Incoming queue of `id`
    fn next(&self, id: &PartyId) -> Inbox;

    /// Deliver `msg` to every party it is for. May wait on full queues.
    fn send(&self, msg: Message) -> impl Future<Output = ()> + Send;

    /// Mark `id` as finished and return the completion signal
    fn done(&self, id: &PartyId) -> CancellationToken;

    /// Drop `id` from the set of known parties
    fn quit(&self, id: &PartyId);
}
