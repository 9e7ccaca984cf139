//! Error types for partynet

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// partynet error types
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed JSON message line
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Malformed hex field
    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Party identifier is empty or contains whitespace
    #[error("invalid party id: {0:?}")]
    InvalidPartyId(String),

    /// Command text names no known command
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    /// Known command with a malformed argument
    #[error("invalid command {command}: {reason}")]
    InvalidCommand { command: String, reason: String },
}
