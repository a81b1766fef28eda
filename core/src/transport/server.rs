//! Server
//!
//! Owns the listening socket, admits peers through the Connect handshake
//! and routes every datagram to the connection registered for its sender.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use super::connection::{CloseReason, Connection};
use super::lifecycle::{Endpoint, Lifecycle, LinkState};
use super::udp::{self, MAX_DATAGRAM};
use crate::config::TransportOptions;
use crate::error::Result;
use crate::protocol::ControlMessage;

/// Admitted connections waiting for [`Server::accept`].
///
/// Closed connections are pruned on every push and skipped on pop, so the
/// queue never holds more than the live connections in the map.
#[derive(Default)]
struct AcceptQueue {
    pending: Mutex<VecDeque<Connection>>,
    ready: Notify,
}

impl AcceptQueue {
    fn push(&self, conn: Connection) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.retain(|queued| queued.state() != LinkState::Closed);
            pending.push_back(conn);
        }
        self.ready.notify_one();
    }

    fn pop(&self) -> Option<Connection> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(conn) = pending.pop_front() {
            if conn.state() != LinkState::Closed {
                return Some(conn);
            }
        }
        None
    }
}

struct ServerShared {
    local_addr: SocketAddr,
    options: Arc<TransportOptions>,
    lifecycle: Lifecycle,
    accepted: AcceptQueue,
    connection_count: AtomicUsize,
}

/// Listening side of the transport.
///
/// The demux task owns the socket. Dropping the server stops that task,
/// which closes the socket and every connection it admitted;
/// [`Server::disconnect`] does the same and waits for it.
pub struct Server {
    shared: Arc<ServerShared>,
    demux: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Bind the socket described by `options` and start demultiplexing.
    pub fn listen(options: Arc<TransportOptions>) -> Result<Self> {
        let socket = Arc::new(udp::bind_server(&options)?);
        let demux = Demux::new(socket, options)?;
        tracing::info!("Listening on {}", demux.shared.local_addr);

        let shared = demux.shared.clone();
        let handle = tokio::spawn(demux.run());

        Ok(Server {
            shared,
            demux: Mutex::new(Some(handle)),
        })
    }

    /// Next admitted connection that is still open.
    ///
    /// Waits while the queue is empty and the server is running; returns
    /// `None` once the server is torn down.
    pub async fn accept(&self) -> Option<Connection> {
        let token = self.shared.lifecycle.token();
        loop {
            if let Some(conn) = self.shared.accepted.pop() {
                return Some(conn);
            }
            if token.is_cancelled() {
                return None;
            }
            tokio::select! {
                _ = self.shared.accepted.ready.notified() => {}
                _ = token.cancelled() => {}
            }
        }
    }

    /// Number of admitted, live connections
    pub fn connection_count(&self) -> usize {
        self.shared.connection_count.load(Ordering::Acquire)
    }

    /// Stop the demux loop and close every admitted connection.
    pub async fn disconnect(&self) {
        if !self.shared.lifecycle.begin_disconnect() {
            return;
        }
        self.shared.lifecycle.close();

        let handle = self
            .demux
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("Demux task ended abnormally: {}", e);
            }
        }
        tracing::info!("Server stopped");
    }
}

impl Endpoint for Server {
    fn options(&self) -> &TransportOptions {
        &self.shared.options
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.shared.local_addr)
    }

    fn state(&self) -> LinkState {
        self.shared.lifecycle.state()
    }

    fn disconnect(&self) -> impl Future<Output = ()> + Send {
        Server::disconnect(self)
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.shared.local_addr)
            .field("state", &self.shared.lifecycle.state())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.lifecycle.close();
    }
}

enum Event {
    Datagram(io::Result<(usize, SocketAddr)>),
    Retired(SocketAddr),
}

/// State owned by the demux task. The connection map has no other writer,
/// and connections only hold weak references to the socket.
struct Demux {
    shared: Arc<ServerShared>,
    socket: Arc<UdpSocket>,
    connections: HashMap<SocketAddr, Connection>,
    retire_tx: mpsc::UnboundedSender<SocketAddr>,
    retire_rx: mpsc::UnboundedReceiver<SocketAddr>,
}

impl Demux {
    fn new(socket: Arc<UdpSocket>, options: Arc<TransportOptions>) -> io::Result<Self> {
        let (retire_tx, retire_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ServerShared {
            local_addr: socket.local_addr()?,
            options,
            lifecycle: Lifecycle::new(),
            accepted: AcceptQueue::default(),
            connection_count: AtomicUsize::new(0),
        });
        Ok(Demux {
            shared,
            socket,
            connections: HashMap::new(),
            retire_tx,
            retire_rx,
        })
    }

    async fn run(mut self) {
        let token = self.shared.lifecycle.token().clone();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                Some(addr) = self.retire_rx.recv() => Event::Retired(addr),
                result = self.socket.recv_from(&mut buf) => Event::Datagram(result),
            };

            match event {
                Event::Retired(addr) => self.retire(addr),
                Event::Datagram(Ok((len, from))) => self.handle_datagram(&buf[..len], from).await,
                // A peer's ICMP unreachable can surface here on some platforms.
                Event::Datagram(Err(e))
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    tracing::trace!("Ignoring transient socket error: {}", e);
                }
                Event::Datagram(Err(e)) => {
                    tracing::warn!("Server socket failed: {}", e);
                    break;
                }
            }
        }

        self.shared.lifecycle.close();
        self.close_all();
    }

    async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        match ControlMessage::parse(datagram) {
            Some(ControlMessage::Connect) => self.admit(from).await,
            Some(ControlMessage::Disconnect) => {
                if let Some(conn) = self.connections.remove(&from) {
                    tracing::debug!("Peer {} disconnected", from);
                    conn.close(CloseReason::Remote);
                    self.publish_count();
                }
            }
            _ => match self.connections.get(&from) {
                Some(conn) => conn.ingest(datagram),
                None => tracing::trace!(
                    "Dropping {} byte datagram from unknown peer {}",
                    datagram.len(),
                    from
                ),
            },
        }
    }

    async fn admit(&mut self, from: SocketAddr) {
        match self.connections.get(&from).map(Connection::state) {
            Some(LinkState::Closed) => {
                // Closed but its retire event is still queued.
                self.connections.remove(&from);
            }
            Some(_) => {
                // Our AcceptConnection was lost and the peer retried.
                self.reply(ControlMessage::AcceptConnection, from).await;
                return;
            }
            None => {}
        }
        if self.connections.len() >= self.shared.options.max_connections {
            tracing::debug!("Rejecting {}: {} connections", from, self.connections.len());
            self.reply(ControlMessage::TooManyUsers, from).await;
            return;
        }

        let conn = match Connection::accept(
            Arc::downgrade(&self.socket),
            from,
            self.shared.options.clone(),
            self.retire_tx.clone(),
        ) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Failed to create connection for {}: {}", from, e);
                return;
            }
        };
        self.connections.insert(from, conn.clone());
        self.shared.accepted.push(conn);
        self.publish_count();

        tracing::info!("Accepted connection from {}", from);
        self.reply(ControlMessage::AcceptConnection, from).await;
    }

    /// Drop the map entry of a connection that closed itself.
    fn retire(&mut self, addr: SocketAddr) {
        let closed = self
            .connections
            .get(&addr)
            .is_some_and(|conn| conn.state() == LinkState::Closed);
        if closed {
            self.connections.remove(&addr);
            self.publish_count();
            tracing::debug!("Removed closed connection {}", addr);
        }
    }

    fn close_all(&mut self) {
        for (_, conn) in self.connections.drain() {
            conn.close(CloseReason::ServerShutdown);
        }
        self.publish_count();
    }

    fn publish_count(&self) {
        self.shared
            .connection_count
            .store(self.connections.len(), Ordering::Release);
    }

    async fn reply(&self, message: ControlMessage, to: SocketAddr) {
        if let Err(e) = self.socket.send_to(&message.as_bytes(), to).await {
            tracing::warn!("Failed to send {:?} to {}: {}", message, to, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_options() -> Arc<TransportOptions> {
        Arc::new(TransportOptions {
            port: 0,
            bind_address: "127.0.0.1".to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_listen_binds_ephemeral_port() {
        let server = Server::listen(loopback_options()).expect("Failed to listen");
        assert!(server.local_addr().unwrap().port() > 0);
        assert_eq!(server.state(), LinkState::Active);
        assert_eq!(server.connection_count(), 0);
        server.disconnect().await;
    }

    #[tokio::test]
    async fn test_accept_returns_none_after_disconnect() {
        let server = Server::listen(loopback_options()).unwrap();
        server.disconnect().await;
        assert_eq!(server.state(), LinkState::Closed);
        assert!(server.accept().await.is_none());
    }

    async fn demux_with_capacity(max_connections: usize) -> Demux {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let options = TransportOptions {
            max_connections,
            ..(*loopback_options()).clone()
        };
        Demux::new(socket, Arc::new(options)).unwrap()
    }

    #[tokio::test]
    async fn test_connect_replaces_closed_entry() {
        let mut demux = demux_with_capacity(1).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let from = peer.local_addr().unwrap();

        demux.admit(from).await;
        let stale = demux.shared.accepted.pop().expect("Peer not admitted");
        stale.close(CloseReason::IdleTimeout);

        // Connect arrives before the retire event is handled.
        demux.admit(from).await;
        let fresh = demux.shared.accepted.pop().expect("Peer not readmitted");
        assert_eq!(fresh.state(), LinkState::Active);
        assert_eq!(demux.connections.len(), 1);

        // The stale retire event leaves the new entry alone.
        let retired = demux.retire_rx.recv().await.unwrap();
        demux.retire(retired);
        assert_eq!(demux.connections.len(), 1);
        assert_eq!(demux.shared.connection_count.load(Ordering::Acquire), 1);

        let mut replies = Vec::new();
        let mut buf = [0u8; 16];
        for _ in 0..3 {
            let len = peer.recv(&mut buf).await.unwrap();
            replies.push(buf[..len].to_vec());
        }
        assert_eq!(replies, vec![vec![2u8], vec![3u8], vec![2u8]]);
        fresh.close(CloseReason::ServerShutdown);
    }

    #[tokio::test]
    async fn test_accept_queue_skips_closed_connections() {
        let mut demux = demux_with_capacity(2).await;
        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        demux.admit(first.local_addr().unwrap()).await;
        demux
            .handle_datagram(
                &ControlMessage::Disconnect.as_bytes(),
                first.local_addr().unwrap(),
            )
            .await;
        demux.admit(second.local_addr().unwrap()).await;

        let queued = demux.shared.accepted.pop().expect("Live connection missing");
        assert_eq!(queued.remote_addr(), second.local_addr().unwrap());
        assert!(demux.shared.accepted.pop().is_none());
        demux.close_all();
    }

    #[tokio::test]
    async fn test_unknown_peer_data_is_dropped() {
        let server = Server::listen(loopback_options()).unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"not a peer yet", server.local_addr().unwrap())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(server.connection_count(), 0);
        server.disconnect().await;
    }
}
