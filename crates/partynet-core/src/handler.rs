//! Protocol handler contract
//!
//! A handler is one participant's protocol state machine. The network layer
//! only drains its outgoing messages, feeds it incoming ones and finally asks
//! for the result.

use crate::session::SessionId;
use crate::types::{Message, PartyId};
use thiserror::Error;
use tokio::sync::mpsc;

/// Protocol-level failures surfaced to the caller of a run
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("party {0} is not part of the session")]
    NotAParty(PartyId),
    #[error("invalid message from {from} in round {round}: {reason}")]
    InvalidMessage {
        from: PartyId,
        round: u16,
        reason: String,
    },
    #[error("parties disagree on the result: {0}")]
    Disagreement(String),
    #[error("arithmetic overflow")]
    Overflow,
    #[error("outgoing message source already taken")]
    OutgoingTaken,
    #[error("protocol did not finish")]
    Unfinished,
}

/// One participant's protocol execution
pub trait Handler: Send {
    /// Final output of a successful run
    type Output: Send;

    /// Hand out the outgoing message source.
    ///
    /// The source yields messages until the protocol finishes or fails, then
    /// closes. Returns `None` once taken.
    fn take_outgoing(&mut self) -> Option<mpsc::UnboundedReceiver<Message>>;

    /// Session this run belongs to. Messages for other sessions are not fed
    /// to [`accept`](Handler::accept).
    fn session(&self) -> SessionId;

    /// Feed one incoming message
    fn accept(&mut self, msg: Message);

    /// Result of the run, valid once the outgoing source has closed
    fn result(self) -> Result<Self::Output, ProtocolError>;
}
