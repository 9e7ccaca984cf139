//! Session identifiers for protocol runs
//!
//! All parties of one run must agree on the session id; it is derived with
//! BLAKE3 under a domain separation prefix so every implementation produces
//! identical bytes.

use crate::error::{Error, Result};
use crate::types::PartyIds;
use blake3::Hasher;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Domain prefix for session id derivation
pub const DOMAIN_SESSION: &[u8] = b"partynet-ssid-v1";

/// 32-byte session identifier, hex encoded on the wire
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; 32]);

impl SessionId {
    /// Derive the session id of a protocol run.
    ///
    /// `SessionId = BLAKE3(DOMAIN || len(protocol) || protocol || (len(id) || id)* || nonce)`
    /// with parties in sorted order.
    pub fn derive(protocol: &str, parties: &PartyIds, nonce: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(DOMAIN_SESSION);
        hasher.update(&(protocol.len() as u32).to_be_bytes());
        hasher.update(protocol.as_bytes());
        for id in parties.iter() {
            hasher.update(&(id.as_str().len() as u32).to_be_bytes());
            hasher.update(id.as_str().as_bytes());
        }
        hasher.update(nonce);
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
