//! Line-oriented wire encoding (shared by relay and mesh topologies)
//!
//! Each `\n`-terminated line on a connection is exactly one of:
//! - `cmd:<text>`: an operator command
//! - `bcmd:<text>`: a command forwarded by a peer
//! - anything else: a JSON encoded [`Message`]
//!
//! Lines handed to and returned from this module never include the terminator.

use crate::error::Result;
use crate::types::Message;
use std::fmt;

/// Prefix of an operator command line
pub const CMD_PREFIX: &str = "cmd:";
/// Prefix of a forwarded command line
pub const BCMD_PREFIX: &str = "bcmd:";

/// One decoded wire line
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireLine {
    /// `cmd:<text>`
    Command(String),
    /// `bcmd:<text>`
    ForwardedCommand(String),
    /// Protocol message
    Message(Message),
}

impl WireLine {
    /// Classify and decode a line.
    ///
    /// Command text is kept verbatim; only message lines can fail to decode.
    pub fn parse(line: &str) -> Result<Self> {
        if let Some(text) = line.strip_prefix(CMD_PREFIX) {
            return Ok(Self::Command(text.to_string()));
        }
        if let Some(text) = line.strip_prefix(BCMD_PREFIX) {
            return Ok(Self::ForwardedCommand(text.to_string()));
        }
        Ok(Self::Message(Message::from_line(line)?))
    }

    /// Encode without the line terminator
    pub fn encode(&self) -> Result<String> {
        match self {
            Self::Command(text) => Ok(format!("{CMD_PREFIX}{text}")),
            Self::ForwardedCommand(text) => Ok(format!("{BCMD_PREFIX}{text}")),
            Self::Message(msg) => msg.to_line(),
        }
    }
}

impl Message {
    /// Serialize to a single JSON line
    pub fn to_line(&self) -> Result<String> {
        // serde_json escapes control characters, so the output never holds '\n'
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from a JSON line
    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

impl fmt::Display for WireLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(text) => write!(f, "{CMD_PREFIX}{text}"),
            Self::ForwardedCommand(text) => write!(f, "{BCMD_PREFIX}{text}"),
            Self::Message(msg) => f.write_str(&msg.to_line().map_err(|_| fmt::Error)?),
        }
    }
}
