//! Transport Configuration
//!
//! Options shared by the server and every connection it creates.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TransportError};

/// Default listen port
pub const DEFAULT_PORT: u16 = 7777;

/// Scheme used when advertising the server URI
pub const SCHEME: &str = "kcp";

/// Options for the server and its connections.
///
/// Immutable once constructed; wrap in `Arc` and share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// UDP port the server binds
    pub port: u16,
    /// Address the server binds; `::` binds dual-stack
    pub bind_address: String,
    /// Maximum simultaneously admitted peers
    pub max_connections: usize,
    /// Client handshake timeout in seconds (clamped to at least 1)
    pub connect_timeout_secs: u64,
    /// Window without inbound traffic after which a connection is closed
    pub idle_timeout_ms: u64,
    /// Reassembled messages buffered per connection before the engine
    /// holds the rest back
    pub inbound_queue_capacity: usize,
    /// Engine packets pending before `send` reports backpressure
    pub send_backlog_limit: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            port: DEFAULT_PORT,
            bind_address: "::".to_string(),
            max_connections: 4,
            connect_timeout_secs: 30,
            idle_timeout_ms: 15_000,
            inbound_queue_capacity: 1024,
            send_backlog_limit: 4096,
        }
    }
}

impl TransportOptions {
    /// Parse options from JSON text. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let options: TransportOptions =
            serde_json::from_str(text).map_err(|e| TransportError::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_ip()?;
        if self.max_connections == 0 {
            return Err(TransportError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.inbound_queue_capacity == 0 {
            return Err(TransportError::Config(
                "inbound_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.send_backlog_limit == 0 {
            return Err(TransportError::Config(
                "send_backlog_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Parsed bind address
    pub fn bind_ip(&self) -> Result<IpAddr> {
        self.bind_address
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|_| TransportError::InvalidBindAddress(self.bind_address.clone()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Render `kcp://host:port` for the given port
    pub fn uri(&self, port: u16) -> String {
        match self.bind_ip() {
            Ok(IpAddr::V6(ip)) => format!("{}://[{}]:{}", SCHEME, ip, port),
            _ => format!("{}://{}:{}", SCHEME, self.bind_address, port),
        }
    }
}
