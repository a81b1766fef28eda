//! kcpnet Core Library
//! Connection-oriented, reliable sessions multiplexed over one UDP socket

pub mod checksum;
pub mod config;
pub mod error;
pub mod facade;
pub mod protocol;
pub mod transport;

pub use config::TransportOptions;
pub use error::{Result, TransportError};
pub use facade::KcpTransport;
pub use protocol::ControlMessage;
pub use transport::{Connection, Endpoint, LinkState, Server};

/// Initialize logging
pub fn init() {
    // A host application may already have installed a subscriber; treat
    // "already set" as a no-op.
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    );

    tracing::info!("kcpnet core initialized (logger ready)");
}
