//! Error types for the transport layer.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to callers of the transport.
///
/// Background loops never return these; they log and close the affected
/// connection instead.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid bind address: {0:?}")]
    InvalidBindAddress(String),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Handshake timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Server rejected connection: too many users")]
    ServerFull,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send backlog full ({pending} packets pending)")]
    SendBacklogFull { pending: usize },

    #[error("Reliability engine error: {0}")]
    Engine(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
