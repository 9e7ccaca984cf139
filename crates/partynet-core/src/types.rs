//! Core types for partynet
//!
//! Party identifiers and the addressed message envelope. Every topology
//! routes on [`Message::is_for`] and nothing else.

use crate::error::{Error, Result};
use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// PARTY IDENTITY
// =============================================================================

/// Opaque identifier of one protocol participant within a run
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyId(String);

impl PartyId {
    /// Create a party id without validation
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartyId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl FromStr for PartyId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(Error::InvalidPartyId(s.to_string()));
        }
        Ok(Self::new(s))
    }
}

/// Sorted, deduplicated list of party ids
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<PartyId>")]
pub struct PartyIds(Vec<PartyId>);

impl PartyIds {
    /// Build from any collection of ids
    pub fn new(ids: impl IntoIterator<Item = PartyId>) -> Self {
        let mut ids: Vec<_> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        Self(ids)
    }

    /// Copy of this list without `id`
    pub fn remove(&self, id: &PartyId) -> Self {
        Self(self.0.iter().filter(|p| *p != id).cloned().collect())
    }

    pub fn contains(&self, id: &PartyId) -> bool {
        self.0.binary_search(id).is_ok()
    }

    /// Every party except `id`
    pub fn others(&self, id: &PartyId) -> Vec<PartyId> {
        self.remove(id).0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartyId> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[PartyId] {
        &self.0
    }
}

impl From<Vec<PartyId>> for PartyIds {
    fn from(ids: Vec<PartyId>) -> Self {
        Self::new(ids)
    }
}

impl FromIterator<PartyId> for PartyIds {
    fn from_iter<I: IntoIterator<Item = PartyId>>(iter: I) -> Self {
        Self::new(iter)
    }
}

// =============================================================================
// MESSAGE ENVELOPE
// =============================================================================

/// Addressing of a message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipients {
    /// Every party except the sender
    Broadcast,
    /// Only the listed parties
    Parties(BTreeSet<PartyId>),
}

/// Addressed unit of protocol data
///
/// Addressing is fixed at construction; fields are only exposed through
/// accessors so every topology evaluates the same predicate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    ssid: SessionId,
    protocol: String,
    round: u16,
    from: PartyId,
    to: Recipients,
    #[serde(with = "hex_payload")]
    payload: Vec<u8>,
}

impl Message {
    /// Create a message for every party but the sender
    pub fn broadcast(
        ssid: SessionId,
        protocol: impl Into<String>,
        round: u16,
        from: PartyId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            ssid,
            protocol: protocol.into(),
            round,
            from,
            to: Recipients::Broadcast,
            payload,
        }
    }

    /// Create a message for an explicit set of parties
    pub fn unicast(
        ssid: SessionId,
        protocol: impl Into<String>,
        round: u16,
        from: PartyId,
        to: impl IntoIterator<Item = PartyId>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            ssid,
            protocol: protocol.into(),
            round,
            from,
            to: Recipients::Parties(to.into_iter().collect()),
            payload,
        }
    }

    /// Whether `id` should receive this message.
    ///
    /// The sender is never a recipient of its own message.
    pub fn is_for(&self, id: &PartyId) -> bool {
        if &self.from == id {
            return false;
        }
        match &self.to {
            Recipients::Broadcast => true,
            Recipients::Parties(parties) => parties.contains(id),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self.to, Recipients::Broadcast)
    }

    pub fn ssid(&self) -> &SessionId {
        &self.ssid
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn round(&self) -> u16 {
        self.round
    }

    pub fn sender(&self) -> &PartyId {
        &self.from
    }

    pub fn to(&self) -> &Recipients {
        &self.to
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Payload bytes as a lowercase hex string
mod hex_payload {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
