//! Two-round sum protocol
//!
//! Round 1: every party broadcasts its contribution.
//! Round 2: once all contributions are in, every party sends the total it
//! computed to each other party individually.
//!
//! The run succeeds when all received totals match the local one. It carries
//! no cryptography; it exists to drive broadcast and unicast traffic through a
//! topology with a checkable outcome.

use crate::handler::{Handler, ProtocolError};
use crate::session::SessionId;
use crate::types::{Message, PartyId, PartyIds};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Protocol name carried in every message
pub const PROTOCOL: &str = "sum";

const ROUND_CONTRIBUTION: u16 = 1;
const ROUND_TOTAL: u16 = 2;

/// Handler for one party of a sum run
pub struct SumHandler {
    ssid: SessionId,
    self_id: PartyId,
    others: Vec<PartyId>,
    contribution: i64,
    out_tx: Option<mpsc::UnboundedSender<Message>>,
    out_rx: Option<mpsc::UnboundedReceiver<Message>>,
    contributions: BTreeMap<PartyId, i64>,
    totals: BTreeMap<PartyId, i64>,
    total: Option<i64>,
    outcome: Option<Result<i64, ProtocolError>>,
}

impl SumHandler {
    /// Start a run; the round 1 broadcast is queued immediately
    pub fn new(
        ssid: SessionId,
        self_id: PartyId,
        parties: &PartyIds,
        contribution: i64,
    ) -> Result<Self, ProtocolError> {
        if !parties.contains(&self_id) {
            return Err(ProtocolError::NotAParty(self_id));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let mut handler = Self {
            ssid,
            others: parties.others(&self_id),
            self_id,
            contribution,
            out_tx: Some(out_tx),
            out_rx: Some(out_rx),
            contributions: BTreeMap::new(),
            totals: BTreeMap::new(),
            total: None,
            outcome: None,
        };

        handler.emit(Message::broadcast(
            ssid,
            PROTOCOL,
            ROUND_CONTRIBUTION,
            handler.self_id.clone(),
            contribution.to_be_bytes().to_vec(),
        ));
        handler.advance();
        Ok(handler)
    }

    fn emit(&self, msg: Message) {
        if let Some(tx) = &self.out_tx {
            // The receiver lives in the bridging loop; if it is gone the run is over.
            let _ = tx.send(msg);
        }
    }

    fn finish(&mut self, outcome: Result<i64, ProtocolError>) {
        if self.outcome.is_none() {
            debug!(party = %self.self_id, ok = outcome.is_ok(), "sum run finished");
            self.outcome = Some(outcome);
        }
        // Dropping the sender closes the outgoing source once it drains.
        self.out_tx = None;
    }

    fn advance(&mut self) {
        if self.total.is_none() && self.contributions.len() == self.others.len() {
            let total = self
                .contributions
                .values()
                .try_fold(self.contribution, |acc, v| acc.checked_add(*v));
            let Some(total) = total else {
                self.finish(Err(ProtocolError::Overflow));
                return;
            };
            self.total = Some(total);
            for other in &self.others {
                self.emit(Message::unicast(
                    self.ssid,
                    PROTOCOL,
                    ROUND_TOTAL,
                    self.self_id.clone(),
                    [other.clone()],
                    total.to_be_bytes().to_vec(),
                ));
            }
        }

        if let Some(total) = self.total {
            if self.totals.len() == self.others.len() {
                let mismatched: Vec<_> = self
                    .totals
                    .iter()
                    .filter(|(_, t)| **t != total)
                    .map(|(p, t)| format!("{p}={t}"))
                    .collect();
                if mismatched.is_empty() {
                    self.finish(Ok(total));
                } else {
                    self.finish(Err(ProtocolError::Disagreement(format!(
                        "local total {total}, received {}",
                        mismatched.join(", ")
                    ))));
                }
            }
        }
    }

    fn invalid(msg: &Message, reason: impl Into<String>) -> ProtocolError {
        ProtocolError::InvalidMessage {
            from: msg.sender().clone(),
            round: msg.round(),
            reason: reason.into(),
        }
    }
}

impl Handler for SumHandler {
    type Output = i64;

    fn take_outgoing(&mut self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.out_rx.take()
    }

    fn session(&self) -> SessionId {
        self.ssid
    }

    fn accept(&mut self, msg: Message) {
        if self.outcome.is_some() {
            return;
        }
        if msg.ssid() != &self.ssid || msg.protocol() != PROTOCOL {
            debug!(
                party = %self.self_id,
                ssid = %msg.ssid(),
                "ignoring message from another session"
            );
            return;
        }
        if !self.others.contains(msg.sender()) {
            self.finish(Err(Self::invalid(&msg, "sender is not a counterpart")));
            return;
        }
        let value = match <[u8; 8]>::try_from(msg.payload()) {
            Ok(bytes) => i64::from_be_bytes(bytes),
            Err(_) => {
                self.finish(Err(Self::invalid(&msg, "payload is not 8 bytes")));
                return;
            }
        };

        let slot = match msg.round() {
            ROUND_CONTRIBUTION => &mut self.contributions,
            ROUND_TOTAL => &mut self.totals,
            _ => {
                self.finish(Err(Self::invalid(&msg, "unknown round")));
                return;
            }
        };
        if slot.contains_key(msg.sender()) {
            warn!(
                party = %self.self_id,
                from = %msg.sender(),
                round = msg.round(),
                "duplicate message ignored"
            );
            return;
        }
        slot.insert(msg.sender().clone(), value);
        self.advance();
    }

    fn result(self) -> Result<i64, ProtocolError> {
        self.outcome.unwrap_or(Err(ProtocolError::Unfinished))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parties(names: &[&str]) -> PartyIds {
        names.iter().map(|n| PartyId::from(*n)).collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Deliver every queued message to its recipients until nothing moves
    fn run_locally(contributions: &[(&str, i64)]) -> Vec<Result<i64, ProtocolError>> {
        let ids = parties(&contributions.iter().map(|(n, _)| *n).collect::<Vec<_>>());
        let ssid = SessionId::derive(PROTOCOL, &ids, b"local");
        let mut handlers: Vec<_> = contributions
            .iter()
            .map(|(n, c)| SumHandler::new(ssid, PartyId::from(*n), &ids, *c).unwrap())
            .collect();
        let mut outgoing: Vec<_> = handlers
            .iter_mut()
            .map(|h| h.take_outgoing().unwrap())
            .collect();

        loop {
            let pending: Vec<Message> = outgoing.iter_mut().flat_map(drain).collect();
            if pending.is_empty() {
                break;
            }
            for msg in pending {
                for h in handlers.iter_mut() {
                    if msg.is_for(&h.self_id) {
                        h.accept(msg.clone());
                    }
                }
            }
        }
        handlers.into_iter().map(|h| h.result()).collect()
    }

    #[test]
    fn test_three_parties_agree() {
        let results = run_locally(&[("a", 1), ("b", 2), ("c", 39)]);
        for r in results {
            assert_eq!(r.unwrap(), 42);
        }
    }

    #[test]
    fn test_single_party_finishes_immediately() {
        let results = run_locally(&[("solo", 7)]);
        assert_eq!(results.into_iter().next().unwrap().unwrap(), 7);
    }

    #[test]
    fn test_overflow_is_reported() {
        let results = run_locally(&[("a", i64::MAX), ("b", 1)]);
        assert!(results
            .into_iter()
            .all(|r| matches!(r, Err(ProtocolError::Overflow))));
    }

    #[test]
    fn test_rejects_non_party() {
        let ids = parties(&["a", "b"]);
        assert!(matches!(
            SumHandler::new(SessionId::default(), "x".into(), &ids, 0),
            Err(ProtocolError::NotAParty(_))
        ));
    }

    #[test]
    fn test_outgoing_closes_when_finished() {
        let ids = parties(&["a", "b"]);
        let ssid = SessionId::derive(PROTOCOL, &ids, b"n");
        let mut h = SumHandler::new(ssid, "a".into(), &ids, 5).unwrap();
        assert_eq!(h.session(), ssid);
        let mut rx = h.take_outgoing().unwrap();
        assert!(h.take_outgoing().is_none());

        let contribution = 6i64.to_be_bytes().to_vec();
        let total = 11i64.to_be_bytes().to_vec();
        h.accept(Message::broadcast(ssid, PROTOCOL, 1, "b".into(), contribution));
        h.accept(Message::unicast(ssid, PROTOCOL, 2, "b".into(), [PartyId::from("a")], total));

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 2);
        assert!(sent[0].is_broadcast());
        assert!(sent[1].is_for(&"b".into()));
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(h.result().unwrap(), 11);
    }

    #[test]
    fn test_foreign_session_ignored() {
        let ids = parties(&["a", "b"]);
        let ssid = SessionId::derive(PROTOCOL, &ids, b"n");
        let mut h = SumHandler::new(ssid, "a".into(), &ids, 5).unwrap();
        h.accept(Message::broadcast(SessionId::default(), PROTOCOL, 1, "b".into(), vec![0; 8]));
        assert!(h.contributions.is_empty());
        assert!(matches!(h.result(), Err(ProtocolError::Unfinished)));
    }
}
