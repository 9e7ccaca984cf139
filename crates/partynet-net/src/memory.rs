//! In-process bus
//!
//! Simulates a fully connected network of parties with channels, for
//! deterministic tests of protocol code. One bus can serve consecutive runs:
//! once every party has called [`done`](Network::done), the next
//! [`next`](Network::next) call starts a fresh generation of queues.

use crate::network::{Inbox, Network};
use parking_lot::Mutex;
use partynet_core::{Message, PartyId, PartyIds};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

struct BusState {
    parties: PartyIds,
    inboxes: HashMap<PartyId, (mpsc::Sender<Message>, Inbox)>,
    /// Whether the current generation's queues exist
    running: bool,
    done: CancellationToken,
}

impl BusState {
    fn start(&mut self) {
        let n = self.parties.len();
        let capacity = (n * n).max(1);
        self.inboxes = self
            .parties
            .iter()
            .map(|id| {
                let (tx, rx) = mpsc::channel(capacity);
                (id.clone(), (tx, Inbox::new(rx)))
            })
            .collect();
        self.done = CancellationToken::new();
        self.running = true;
        debug!("Bus started for {} parties", n);
    }
}

/// In-process network between a fixed set of parties
pub struct MemoryNetwork {
    state: Mutex<BusState>,
}

impl MemoryNetwork {
    pub fn new(parties: PartyIds) -> Self {
        Self {
            state: Mutex::new(BusState {
                parties,
                inboxes: HashMap::new(),
                running: false,
                done: CancellationToken::new(),
            }),
        }
    }

    /// Parties the next generation will be created for
    pub fn parties(&self) -> PartyIds {
        self.state.lock().parties.clone()
    }
}

impl Network for MemoryNetwork {
    fn next(&self, id: &PartyId) -> Inbox {
        let mut state = self.state.lock();
        if !state.running {
            state.start();
        }
        match state.inboxes.get(id) {
            Some((_, inbox)) => inbox.clone(),
            None => Inbox::closed(),
        }
    }

    async fn send(&self, msg: Message) {
        let targets: Vec<_> = self
            .state
            .lock()
            .inboxes
            .iter()
            .filter(|(id, _)| msg.is_for(id))
            .map(|(id, (tx, _))| (id.clone(), tx.clone()))
            .collect();

        for (id, tx) in targets {
            if tx.send(msg.clone()).await.is_err() {
                trace!("Inbox of {} closed before delivery", id);
            }
        }
    }

    fn done(&self, id: &PartyId) -> CancellationToken {
        let mut state = self.state.lock();
        if state.inboxes.remove(id).is_some() && state.inboxes.is_empty() && state.running {
            state.running = false;
            state.done.cancel();
            debug!("Bus generation complete");
        }
        state.done.clone()
    }

    fn quit(&self, id: &PartyId) {
        let mut state = self.state.lock();
        state.parties = state.parties.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partynet_core::SessionId;

    fn bus(names: &[&str]) -> MemoryNetwork {
        MemoryNetwork::new(names.iter().map(|n| PartyId::from(*n)).collect())
    }

    fn msg_from(from: &str, to: Option<&[&str]>) -> Message {
        let ssid = SessionId::default();
        match to {
            None => Message::broadcast(ssid, "t", 1, from.into(), vec![1]),
            Some(to) => Message::unicast(
                ssid,
                "t",
                1,
                from.into(),
                to.iter().map(|p| PartyId::from(*p)),
                vec![2],
            ),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_but_sender() {
        let net = bus(&["a", "b", "c"]);
        let (a, b, c) = (net.next(&"a".into()), net.next(&"b".into()), net.next(&"c".into()));

        net.send(msg_from("a", None)).await;
        assert!(a.try_recv().is_none());
        assert_eq!(b.try_recv().unwrap().sender().as_str(), "a");
        assert!(c.try_recv().is_some());
        assert!(b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unicast_only_to_recipient() {
        let net = bus(&["a", "b", "c"]);
        let (b, c) = (net.next(&"b".into()), net.next(&"c".into()));

        net.send(msg_from("a", Some(&["b"]))).await;
        assert!(b.try_recv().is_some());
        assert!(c.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unknown_party_gets_closed_inbox() {
        let net = bus(&["a"]);
        assert!(net.next(&"zed".into()).recv().await.is_none());
    }

    #[tokio::test]
    async fn test_full_round_fits_without_reader() {
        // Every party sends to every other party before anyone reads
        let names = ["a", "b", "c", "d"];
        let net = bus(&names);
        let inboxes: Vec<_> = names.iter().map(|n| net.next(&(*n).into())).collect();
        for from in names {
            for to in names.iter().filter(|t| **t != from) {
                net.send(msg_from(from, Some(&[*to]))).await;
            }
            net.send(msg_from(from, None)).await;
        }
        for inbox in inboxes {
            let mut count = 0;
            while inbox.try_recv().is_some() {
                count += 1;
            }
            assert_eq!(count, 6);
        }
    }

    #[tokio::test]
    async fn test_done_signals_once_and_restarts() {
        let net = bus(&["a", "b"]);
        let a = net.next(&"a".into());
        let first = net.done(&"a".into());
        assert!(!first.is_cancelled());
        assert!(a.recv().await.is_none());

        let again = net.done(&"a".into());
        assert!(!again.is_cancelled());
        assert!(net.done(&"b".into()).is_cancelled());
        assert!(first.is_cancelled());

        // Next generation gets new queues and a new signal
        let b = net.next(&"b".into());
        let second = net.done(&"zed".into());
        assert!(!second.is_cancelled());
        net.send(msg_from("a", None)).await;
        assert!(b.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_quit_applies_to_next_generation() {
        let net = bus(&["a", "b"]);
        let b = net.next(&"b".into());
        net.quit(&"b".into());
        // Current queue stays open
        net.send(msg_from("a", None)).await;
        assert!(b.try_recv().is_some());

        net.done(&"a".into());
        net.done(&"b".into());
        assert!(net.next(&"b".into()).recv().await.is_none());
        assert_eq!(net.parties().len(), 1);
    }
}
