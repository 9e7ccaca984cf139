//! Registry of live connections
//!
//! The registry is the only structure mutated by more than one task. Every
//! mutation and every read happens under one mutex; fan-out works on a
//! [`snapshot`](ClientRegistry::snapshot) so no send ever runs while the lock
//! is held.

use bytes::Bytes;
use parking_lot::Mutex;
use partynet_core::PartyId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Serial number of one physical connection
pub type ClientSerial = u64;

/// Routing handle for one connection
///
/// The connection task owns the receiving half of `tx`; a client dropped
/// from the registry simply loses its route.
#[derive(Clone, Debug)]
pub struct Client {
    /// Connection serial
    pub serial: ClientSerial,
    /// Remote party, if the topology assigns one
    pub party: Option<PartyId>,
    /// Outbound line queue
    pub tx: mpsc::Sender<Bytes>,
}

impl Client {
    pub fn new(serial: ClientSerial, party: Option<PartyId>, tx: mpsc::Sender<Bytes>) -> Self {
        Self { serial, party, tx }
    }

    /// Queue a line, waiting for room unless `closed` fires first.
    ///
    /// False if the line was not queued.
    pub async fn deliver(&self, line: Bytes, closed: &CancellationToken) -> bool {
        tokio::select! {
            _ = closed.cancelled() => false,
            sent = self.tx.send(line) => sent.is_ok(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    clients: HashMap<ClientSerial, Client>,
    ever_entered: bool,
}

/// Registry of active clients
pub struct ClientRegistry {
    state: Mutex<RegistryState>,
    next_serial: AtomicU64,
    /// Fires the first time the registry drains after holding a client
    emptied: CancellationToken,
}

impl ClientRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            next_serial: AtomicU64::new(1),
            emptied: CancellationToken::new(),
        }
    }

    /// Allocate a serial for a new connection
    pub fn next_serial(&self) -> ClientSerial {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a client, returning any entry it replaced
    pub fn enter(&self, client: Client) -> Option<Client> {
        let mut state = self.state.lock();
        state.ever_entered = true;
        state.clients.insert(client.serial, client)
    }

    /// Register a client as one of `neighbors`.
    ///
    /// A dialed connection names its party in `hint` and is refused when that
    /// party is not a neighbor or already holds a live client. An accepted
    /// connection has no hint and takes the first unassigned neighbor in
    /// order. Returns the assigned party, or `None` (registering nothing).
    pub fn enter_neighbor(
        &self,
        serial: ClientSerial,
        tx: mpsc::Sender<Bytes>,
        neighbors: &[PartyId],
        hint: Option<&PartyId>,
    ) -> Option<PartyId> {
        let mut state = self.state.lock();
        let taken = |p: &PartyId| {
            state
                .clients
                .values()
                .any(|c| c.party.as_ref() == Some(p))
        };

        let party = match hint {
            Some(hint) if neighbors.contains(hint) && !taken(hint) => hint,
            Some(_) => return None,
            None => neighbors.iter().find(|n| !taken(*n))?,
        }
        .clone();

        state.ever_entered = true;
        state
            .clients
            .insert(serial, Client::new(serial, Some(party.clone()), tx));
        Some(party)
    }

    /// Deregister a client. Leaving twice is a no-op.
    pub fn leave(&self, serial: ClientSerial) -> Option<Client> {
        let mut state = self.state.lock();
        let removed = state.clients.remove(&serial);
        if removed.is_some() && state.clients.is_empty() && state.ever_entered {
            self.emptied.cancel();
        }
        removed
    }

    /// Copy of all clients, taken under the lock
    pub fn snapshot(&self) -> Vec<Client> {
        self.state.lock().clients.values().cloned().collect()
    }

    /// Parties currently assigned to a client
    pub fn parties(&self) -> Vec<PartyId> {
        let mut parties: Vec<_> = self
            .state
            .lock()
            .clients
            .values()
            .filter_map(|c| c.party.clone())
            .collect();
        parties.sort();
        parties
    }

    pub fn contains_party(&self, party: &PartyId) -> bool {
        self.state
            .lock()
            .clients
            .values()
            .any(|c| c.party.as_ref() == Some(party))
    }

    pub fn len(&self) -> usize {
        self.state.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().clients.is_empty()
    }

    /// Token cancelled when the registry first drains
    pub fn emptied(&self) -> CancellationToken {
        self.emptied.clone()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        mpsc::channel(4)
    }

    fn ids(names: &[&str]) -> Vec<PartyId> {
        names.iter().map(|n| PartyId::from(*n)).collect()
    }

    #[test]
    fn test_enter_and_leave_idempotent() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = channel();
        let serial = registry.next_serial();
        assert!(registry.enter(Client::new(serial, None, tx)).is_none());
        assert_eq!(registry.len(), 1);

        assert!(registry.leave(serial).is_some());
        assert!(registry.leave(serial).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_emptied_fires_once_after_last_leave() {
        let registry = ClientRegistry::new();
        let emptied = registry.emptied();
        assert!(!emptied.is_cancelled());

        let (tx, _rx) = channel();
        let a = registry.next_serial();
        let b = registry.next_serial();
        registry.enter(Client::new(a, None, tx.clone()));
        registry.enter(Client::new(b, None, tx));

        registry.leave(a);
        assert!(!emptied.is_cancelled());
        registry.leave(b);
        assert!(emptied.is_cancelled());
        // Leaving an absent client after draining does nothing
        registry.leave(b);
        assert!(emptied.is_cancelled());
    }

    #[test]
    fn test_neighbor_assignment_in_order() {
        let registry = ClientRegistry::new();
        let neighbors = ids(&["b", "c"]);
        let (tx, _rx) = channel();

        let s1 = registry.next_serial();
        let s2 = registry.next_serial();
        let s3 = registry.next_serial();
        assert_eq!(
            registry.enter_neighbor(s1, tx.clone(), &neighbors, None),
            Some("b".into())
        );
        assert_eq!(
            registry.enter_neighbor(s2, tx.clone(), &neighbors, None),
            Some("c".into())
        );
        assert_eq!(registry.enter_neighbor(s3, tx.clone(), &neighbors, None), None);
        assert_eq!(registry.len(), 2);

        // A freed slot is reused
        registry.leave(s1);
        assert_eq!(
            registry.enter_neighbor(s3, tx, &neighbors, None),
            Some("b".into())
        );
        assert_eq!(registry.parties(), ids(&["b", "c"]));
    }

    #[test]
    fn test_neighbor_hint() {
        let registry = ClientRegistry::new();
        let neighbors = ids(&["b", "c"]);
        let (tx, _rx) = channel();

        let c = PartyId::from("c");
        let s1 = registry.next_serial();
        assert_eq!(
            registry.enter_neighbor(s1, tx.clone(), &neighbors, Some(&c)),
            Some(c.clone())
        );
        // An accepted connection skips the dialed slot
        let s2 = registry.next_serial();
        assert_eq!(
            registry.enter_neighbor(s2, tx, &neighbors, None),
            Some("b".into())
        );
        assert!(registry.contains_party(&c));
    }

    #[test]
    fn test_duplicate_dial_refused() {
        let registry = ClientRegistry::new();
        let neighbors = ids(&["b", "c"]);
        let (tx, _rx) = channel();

        let b = PartyId::from("b");
        let accepted = registry.next_serial();
        assert_eq!(
            registry.enter_neighbor(accepted, tx.clone(), &neighbors, None),
            Some(b.clone())
        );

        // A dial to a party that is already connected is not relabeled
        let dialed = registry.next_serial();
        assert_eq!(
            registry.enter_neighbor(dialed, tx.clone(), &neighbors, Some(&b)),
            None
        );
        let stranger = PartyId::from("z");
        assert_eq!(
            registry.enter_neighbor(dialed, tx, &neighbors, Some(&stranger)),
            None
        );
        assert_eq!(registry.parties(), ids(&["b"]));
    }

    #[tokio::test]
    async fn test_deliver_after_receiver_dropped() {
        let (tx, rx) = channel();
        let client = Client::new(1, None, tx);
        drop(rx);
        let closed = CancellationToken::new();
        assert!(!client.deliver(Bytes::from_static(b"x"), &closed).await);
    }

    #[tokio::test]
    async fn test_deliver_to_full_queue_stops_on_cancel() {
        let (tx, _rx) = mpsc::channel(1);
        let client = Client::new(1, None, tx);
        let closed = CancellationToken::new();
        assert!(client.deliver(Bytes::from_static(b"first"), &closed).await);

        let cancel = closed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let delivered = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client.deliver(Bytes::from_static(b"second"), &closed),
        )
        .await
        .unwrap();
        assert!(!delivered);
    }
}
