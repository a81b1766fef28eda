//! Datagram Output
//!
//! Where a connection's datagrams go, and the framing applied to every
//! packet the reliability engine emits.

use socket2::{SockAddr, SockRef};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::UdpSocket;

use crate::checksum;

/// Socket a connection transmits on.
///
/// A link never keeps its socket alive: the task that reads the socket
/// (server demux or client read loop) holds the only strong reference, so
/// the socket closes when that task ends.
#[derive(Debug, Clone)]
pub enum Link {
    /// Server socket shared with every other server-side connection.
    Shared {
        socket: Weak<UdpSocket>,
        peer: SocketAddr,
    },
    /// Socket connected to a single remote, owned by the connection.
    Dedicated(Weak<UdpSocket>),
}

impl Link {
    /// Non-blocking send of one datagram.
    ///
    /// Goes straight to the OS socket, so a freshly bound socket can send
    /// before the runtime has polled it for writability.
    pub fn try_send(&self, datagram: &[u8]) -> io::Result<usize> {
        let socket = self.upgrade()?;
        let raw = SockRef::from(&*socket);
        match self {
            Link::Shared { peer, .. } => raw.send_to(datagram, &SockAddr::from(*peer)),
            Link::Dedicated(_) => raw.send(datagram),
        }
    }

    pub fn owns_socket(&self) -> bool {
        matches!(self, Link::Dedicated(_))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.upgrade()?.local_addr()
    }

    fn upgrade(&self) -> io::Result<Arc<UdpSocket>> {
        let socket = match self {
            Link::Shared { socket, .. } => socket,
            Link::Dedicated(socket) => socket,
        };
        socket
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket closed"))
    }
}

/// Per-connection datagram counters
#[derive(Debug, Default)]
pub struct TrafficCounters {
    pub datagrams_in: AtomicU64,
    pub datagrams_out: AtomicU64,
    pub dropped_out: AtomicU64,
    pub checksum_failures: AtomicU64,
}

/// Engine output sink: prefixes each packet with its checksum header and
/// transmits it on the link.
#[derive(Debug)]
pub struct FramedOutput {
    link: Link,
    counters: Arc<TrafficCounters>,
}

impl FramedOutput {
    pub fn new(link: Link, counters: Arc<TrafficCounters>) -> Self {
        FramedOutput { link, counters }
    }
}

impl Write for FramedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let datagram = checksum::frame(buf);
        match self.link.try_send(&datagram) {
            Ok(_) => {
                self.counters.datagrams_out.fetch_add(1, Ordering::Relaxed);
            }
            // Socket buffer full: the engine retransmits unacked segments.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.counters.dropped_out.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Send buffer full, dropping {} byte packet", buf.len());
            }
            Err(e) => return Err(e),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
