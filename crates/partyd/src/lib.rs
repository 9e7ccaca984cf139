//! partyd - partynet protocol participant
//!
//! This daemon provides:
//! - Joining a broadcast relay or a peer mesh
//! - An operator command processor (`sum:<session>`, `peers`, `quit`)
//! - Protocol runs through the bridging loop

pub mod config;
pub mod node;

pub use config::{Config, LogFormat, Mode, PeerAddr};
pub use node::{Node, NodeError, Outcome, Topology};
