//! relayd - partynet broadcast relay daemon
//!
//! Accepts participant connections and writes every line it reads to every
//! connected participant, the sender included.

pub mod config;
pub mod server;

pub use config::{Config, LogFormat};
pub use server::Server;
