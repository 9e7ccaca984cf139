//! partynet core library
//!
//! This crate provides the types shared by every partynet topology and by
//! the protocol layer that runs on top of them.
//!
//! # Modules
//!
//! - [`types`]: Party identifiers, recipients and the message envelope
//! - [`wire`]: Line-oriented wire encoding (`cmd:`, `bcmd:`, JSON messages)
//! - [`command`]: Operator commands carried on the command channel
//! - [`session`]: Session id derivation for protocol runs
//! - [`handler`]: The contract a protocol handler implements
//! - [`sum`]: A two-round toy protocol used to exercise the network layer
//! - [`error`]: Error types

pub mod command;
pub mod error;
pub mod handler;
pub mod session;
pub mod sum;
pub mod types;
pub mod wire;

pub use command::Command;
pub use error::{Error, Result};
pub use handler::{Handler, ProtocolError};
pub use session::SessionId;
pub use types::*;
pub use wire::WireLine;
