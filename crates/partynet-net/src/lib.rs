//! Message routing for partynet
//!
//! This crate provides:
//! - Newline-delimited line framing
//! - The topology contract and three topologies: an in-process bus, a
//!   broadcast relay and a peer mesh
//! - TCP dialing with backoff
//! - The bridging loop that runs a protocol handler over a topology

pub mod bridge;
mod conn;
pub mod framing;
pub mod memory;
pub mod mesh;
pub mod network;
pub mod registry;
pub mod relay;
pub mod transport;

pub use bridge::{run_handler, BridgeError};
pub use framing::{FrameError, LineCodec, MAX_LINE_SIZE};
pub use memory::MemoryNetwork;
pub use mesh::MeshNetwork;
pub use network::{Inbox, Network, DEFAULT_QUEUE_CAPACITY};
pub use registry::{Client, ClientRegistry, ClientSerial};
pub use relay::{RelayClient, RelayServer, RelayStats};
pub use transport::{accept_loop, dial_with_backoff, DialPolicy, TransportError};
