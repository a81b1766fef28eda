//! Transport Module
//!
//! Connection-oriented sessions over a single UDP socket, with reliable
//! delivery delegated to a KCP engine.

pub mod connection;
pub mod engine;
pub mod lifecycle;
pub mod packet;
pub mod server;
pub mod udp;

// Re-exports for convenience
pub use connection::{CloseReason, Connection, ConnectionStats};
pub use engine::{KcpEngine, ReliabilityEngine};
pub use lifecycle::{Endpoint, LinkState};
pub use packet::Link;
pub use server::Server;
