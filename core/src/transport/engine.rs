//! Reliability Engine
//!
//! The ARQ engine that provides ordered, retransmitted delivery is an
//! external collaborator. Connections only talk to it through
//! [`ReliabilityEngine`]; [`KcpEngine`] binds it to the `kcp` crate.

use std::fmt;

use super::packet::FramedOutput;
use crate::checksum::HEADER_LEN;
use crate::error::{Result, TransportError};

/// Conversation id shared by both ends of every connection
pub const CONVERSATION_ID: u32 = 0;

/// Maximum framed datagram size (checksum header included)
pub const MTU: usize = 1200;

/// Internal engine update interval in no-delay mode (ms)
const UPDATE_INTERVAL_MS: i32 = 10;

/// Send/receive window in packets
const WINDOW_SIZE: u16 = 128;

/// Narrow surface a connection drives.
pub trait ReliabilityEngine: Send {
    /// Queue application data for reliable delivery
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Feed one received wire packet (checksum header already stripped)
    fn input(&mut self, packet: &[u8]) -> Result<()>;

    /// Size of the next fully reassembled message, if one is ready
    fn peek_size(&self) -> Option<usize>;

    /// Extract the next reassembled message into `buf`
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Periodic maintenance at engine time `now_ms`
    fn update(&mut self, now_ms: u32) -> Result<()>;

    /// Milliseconds until the engine next needs `update`
    fn check(&self, now_ms: u32) -> u32;

    /// Force emission of pending output
    fn flush(&mut self) -> Result<()>;

    /// Packets queued or in flight awaiting acknowledgment
    fn pending_sends(&self) -> usize;
}

/// KCP-backed engine emitting checksum-framed datagrams.
pub struct KcpEngine {
    kcp: kcp::Kcp<FramedOutput>,
}

impl KcpEngine {
    /// Build an engine tuned for low latency: no artificial send delay,
    /// fast resend after 2 skipped acks, no congestion window.
    pub fn new(output: FramedOutput) -> Result<Self> {
        let mut kcp = kcp::Kcp::new(CONVERSATION_ID, output);
        kcp.set_nodelay(true, UPDATE_INTERVAL_MS, 2, true);
        kcp.set_wndsize(WINDOW_SIZE, WINDOW_SIZE);
        kcp.set_mtu(MTU - HEADER_LEN).map_err(engine_error)?;
        Ok(KcpEngine { kcp })
    }
}

impl fmt::Debug for KcpEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KcpEngine")
            .field("pending_sends", &self.kcp.wait_snd())
            .finish()
    }
}

impl ReliabilityEngine for KcpEngine {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.kcp.send(data).map(|_| ()).map_err(engine_error)
    }

    fn input(&mut self, packet: &[u8]) -> Result<()> {
        self.kcp.input(packet).map(|_| ()).map_err(engine_error)
    }

    fn peek_size(&self) -> Option<usize> {
        self.kcp.peeksize().ok()
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.kcp.recv(buf).map_err(engine_error)
    }

    fn update(&mut self, now_ms: u32) -> Result<()> {
        self.kcp.update(now_ms).map_err(engine_error)
    }

    fn check(&self, now_ms: u32) -> u32 {
        self.kcp.check(now_ms)
    }

    fn flush(&mut self) -> Result<()> {
        self.kcp.flush().map_err(engine_error)
    }

    fn pending_sends(&self) -> usize {
        self.kcp.wait_snd()
    }
}

fn engine_error(e: kcp::Error) -> TransportError {
    TransportError::Engine(format!("{:?}", e))
}
