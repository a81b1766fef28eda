//! Connection
//!
//! One peer's session over UDP. A connection frames engine output with a
//! checksum header, feeds verified inbound segments to its reliability
//! engine, and queues reassembled messages for [`Connection::recv`].
//!
//! Server-side connections share the server socket and are fed by the
//! server's demux loop. Client-side connections own a connected socket and
//! run their own read loop. Both run a tick loop that drives the engine and
//! the idle watchdog.

use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use super::engine::{KcpEngine, ReliabilityEngine};
use super::lifecycle::{Endpoint, Lifecycle, LinkState};
use super::packet::{FramedOutput, Link, TrafficCounters};
use super::udp::{self, MAX_DATAGRAM};
use crate::checksum;
use crate::config::TransportOptions;
use crate::error::{Result, TransportError};
use crate::protocol::ControlMessage;

/// Bounds on the delay between engine updates
const MIN_TICK: Duration = Duration::from_millis(10);
const MAX_TICK: Duration = Duration::from_millis(100);

/// Connect byte resend interval while handshaking
const HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Time given to flushed output before the connection stops its loops
const DISCONNECT_GRACE: Duration = Duration::from_millis(100);

/// Why a connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Local,
    Remote,
    IdleTimeout,
    SocketFailure,
    HandshakeTimeout,
    Rejected,
    ServerShutdown,
}

impl CloseReason {
    fn notifies_peer(self) -> bool {
        matches!(
            self,
            CloseReason::IdleTimeout | CloseReason::HandshakeTimeout | CloseReason::ServerShutdown
        )
    }
}

/// Snapshot of a connection's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub ticks: u64,
    pub datagrams_in: u64,
    pub datagrams_out: u64,
    pub messages_received: u64,
    pub checksum_failures: u64,
}

type HandshakeSignal = oneshot::Sender<Result<()>>;

struct Shared {
    remote: SocketAddr,
    link: Link,
    options: Arc<TransportOptions>,
    engine: Mutex<Box<dyn ReliabilityEngine>>,
    /// Engine clock origin
    epoch: Instant,
    /// Engine time (ms) of the last accepted data segment
    last_received: AtomicU64,
    established: AtomicBool,
    counters: Arc<TrafficCounters>,
    ticks: AtomicU64,
    messages_received: AtomicU64,
    inbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    handshake: Mutex<Option<HandshakeSignal>>,
    lifecycle: Lifecycle,
    /// Server-side only: tells the demux loop this address is gone
    retire: Option<mpsc::UnboundedSender<SocketAddr>>,
}

/// Handle to a connection. Clones refer to the same session.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    fn new(
        link: Link,
        remote: SocketAddr,
        options: Arc<TransportOptions>,
        retire: Option<mpsc::UnboundedSender<SocketAddr>>,
    ) -> Result<Self> {
        let counters = Arc::new(TrafficCounters::default());
        let engine = KcpEngine::new(FramedOutput::new(link.clone(), counters.clone()))?;
        let (inbound_tx, inbound_rx) = mpsc::channel(options.inbound_queue_capacity.max(1));

        Ok(Connection {
            shared: Arc::new(Shared {
                remote,
                link,
                options,
                engine: Mutex::new(Box::new(engine)),
                epoch: Instant::now(),
                last_received: AtomicU64::new(0),
                established: AtomicBool::new(false),
                counters,
                ticks: AtomicU64::new(0),
                messages_received: AtomicU64::new(0),
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                handshake: Mutex::new(None),
                lifecycle: Lifecycle::new(),
                retire,
            }),
        })
    }

    /// Server-side connection on the shared server socket. Established
    /// immediately; the server's demux loop feeds it.
    pub(crate) fn accept(
        socket: Weak<UdpSocket>,
        remote: SocketAddr,
        options: Arc<TransportOptions>,
        retire: mpsc::UnboundedSender<SocketAddr>,
    ) -> Result<Self> {
        let link = Link::Shared {
            socket,
            peer: remote,
        };
        let conn = Self::new(link, remote, options, Some(retire))?;
        conn.shared.established.store(true, Ordering::Release);
        tokio::spawn(tick_loop(conn.shared.clone()));
        Ok(conn)
    }

    /// Open a client connection to `host:port` and complete the handshake.
    ///
    /// Fails with [`TransportError::ConnectTimeout`] if no AcceptConnection
    /// arrives within the configured timeout, and with
    /// [`TransportError::ServerFull`] if the server answers TooManyUsers.
    pub async fn connect(host: &str, port: u16, options: Arc<TransportOptions>) -> Result<Self> {
        let not_found = || TransportError::HostNotFound(format!("{}:{}", host, port));
        let remote = tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| not_found())?
            .next()
            .ok_or_else(not_found)?;

        // The read loop holds the only strong reference.
        let socket = Arc::new(udp::connect_client(remote).await?);
        let link = Link::Dedicated(Arc::downgrade(&socket));
        let conn = Self::new(link, remote, options, None)?;

        let (signal, outcome) = oneshot::channel();
        *conn.shared.handshake() = Some(signal);
        tokio::spawn(read_loop(conn.shared.clone(), socket));
        tokio::spawn(tick_loop(conn.shared.clone()));

        let timeout = conn.shared.options.connect_timeout();
        tracing::debug!("Connecting to {} (timeout {:?})", remote, timeout);

        match tokio::time::timeout(timeout, conn.shared.handshake_with(outcome)).await {
            Ok(Ok(())) => {
                tracing::info!("Connected to {}", remote);
                Ok(conn)
            }
            Ok(Err(e)) => {
                tracing::debug!("Handshake with {} failed: {}", remote, e);
                conn.shared.shutdown(CloseReason::Rejected);
                Err(e)
            }
            Err(_) => {
                tracing::debug!("Handshake with {} timed out", remote);
                conn.shared.shutdown(CloseReason::HandshakeTimeout);
                Err(TransportError::ConnectTimeout(timeout))
            }
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote
    }

    pub fn is_established(&self) -> bool {
        self.shared.established.load(Ordering::Acquire)
    }

    /// Whether this connection owns its socket (client side)
    pub fn owns_socket(&self) -> bool {
        self.shared.link.owns_socket()
    }

    pub fn stats(&self) -> ConnectionStats {
        let shared = &self.shared;
        ConnectionStats {
            ticks: shared.ticks.load(Ordering::Relaxed),
            datagrams_in: shared.counters.datagrams_in.load(Ordering::Relaxed),
            datagrams_out: shared.counters.datagrams_out.load(Ordering::Relaxed),
            messages_received: shared.messages_received.load(Ordering::Relaxed),
            checksum_failures: shared.counters.checksum_failures.load(Ordering::Relaxed),
        }
    }

    /// Hand `payload` to the engine. Returns once queued; delivery,
    /// ordering and retransmission belong to the engine.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        if !self.shared.lifecycle.is_active() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut engine = self.shared.engine();
        let pending = engine.pending_sends();
        if pending >= self.shared.options.send_backlog_limit {
            return Err(TransportError::SendBacklogFull { pending });
        }
        engine.send(payload)
    }

    /// Next reassembled message, in engine delivery order.
    ///
    /// Returns `None` once the connection is closed and every queued message
    /// has been handed out.
    pub async fn recv(&self) -> Option<Bytes> {
        let mut inbound = self.shared.inbound_rx.lock().await;
        tokio::select! {
            biased;
            message = inbound.recv() => {
                // Space freed: pull anything the engine was holding back.
                self.shared.drain();
                return message;
            }
            _ = self.shared.lifecycle.token().cancelled() => {}
        }
        inbound.try_recv().ok()
    }

    /// Like [`recv`](Self::recv) but copies the message into `destination`.
    /// Returns false when no message will ever arrive again.
    pub async fn recv_into(&self, destination: &mut Vec<u8>) -> bool {
        match self.recv().await {
            Some(message) => {
                destination.clear();
                destination.extend_from_slice(&message);
                true
            }
            None => false,
        }
    }

    /// Feed one datagram from the peer (demux or read loop)
    pub(crate) fn ingest(&self, datagram: &[u8]) {
        self.shared.ingest(datagram);
    }

    /// Close without notifying the server; used by the server itself.
    pub(crate) fn close(&self, reason: CloseReason) {
        self.shared.shutdown(reason);
    }

    /// Graceful local close: flush engine output, tell the peer, give the
    /// output a moment, then stop both loops.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        if !shared.lifecycle.begin_disconnect() {
            return;
        }
        tracing::debug!("Disconnecting from {}", shared.remote);

        let flushed = shared.engine().flush();
        if let Err(e) = flushed {
            tracing::trace!("Flush before disconnect failed: {}", e);
        }
        if let Err(e) = shared.link.try_send(&ControlMessage::Disconnect.as_bytes()) {
            tracing::debug!("Failed to send Disconnect to {}: {}", shared.remote, e);
        }

        tokio::time::sleep(DISCONNECT_GRACE).await;
        shared.shutdown(CloseReason::Local);
    }
}

impl Endpoint for Connection {
    fn options(&self) -> &TransportOptions {
        &self.shared.options
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.link.local_addr()
    }

    fn state(&self) -> LinkState {
        self.shared.lifecycle.state()
    }

    fn disconnect(&self) -> impl Future<Output = ()> + Send {
        Connection::disconnect(self)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.shared.remote)
            .field("state", &self.shared.lifecycle.state())
            .field("owns_socket", &self.shared.link.owns_socket())
            .finish()
    }
}

impl Shared {
    fn engine(&self) -> MutexGuard<'_, Box<dyn ReliabilityEngine>> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handshake(&self) -> MutexGuard<'_, Option<HandshakeSignal>> {
        self.handshake.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn is_handshaking(&self) -> bool {
        self.handshake().is_some()
    }

    /// Resend Connect until the handshake signal resolves.
    async fn handshake_with(&self, mut outcome: oneshot::Receiver<Result<()>>) -> Result<()> {
        loop {
            if let Err(e) = self.link.try_send(&ControlMessage::Connect.as_bytes()) {
                tracing::trace!("Connect to {} not sent: {}", self.remote, e);
            }
            tokio::select! {
                result = &mut outcome => {
                    return result.unwrap_or(Err(TransportError::ConnectionClosed));
                }
                _ = tokio::time::sleep(HANDSHAKE_RETRY_INTERVAL) => {}
            }
        }
    }

    fn ingest(&self, datagram: &[u8]) {
        if self.lifecycle.state() == LinkState::Closed {
            return;
        }
        self.counters.datagrams_in.fetch_add(1, Ordering::Relaxed);

        match ControlMessage::parse(datagram) {
            Some(ControlMessage::Disconnect) => {
                tracing::debug!("Peer {} disconnected", self.remote);
                self.shutdown(CloseReason::Remote);
            }
            Some(ControlMessage::AcceptConnection) => self.complete_handshake(Ok(())),
            Some(ControlMessage::TooManyUsers) if self.is_handshaking() => {
                tracing::info!("Server {} is full", self.remote);
                self.complete_handshake(Err(TransportError::ServerFull));
            }
            _ => self.input_segment(datagram),
        }
    }

    fn complete_handshake(&self, result: Result<()>) {
        let Some(signal) = self.handshake().take() else {
            return;
        };
        if result.is_ok() {
            self.last_received.store(self.now_ms(), Ordering::Release);
            self.established.store(true, Ordering::Release);
        }
        let _ = signal.send(result);
    }

    fn input_segment(&self, datagram: &[u8]) {
        let Some(segment) = checksum::verify(datagram) else {
            self.counters
                .checksum_failures
                .fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                "Dropping {} byte datagram from {}: bad checksum",
                datagram.len(),
                self.remote
            );
            return;
        };

        let accepted = self.engine().input(segment);
        match accepted {
            Ok(()) => {
                self.last_received.store(self.now_ms(), Ordering::Release);
                self.drain();
            }
            Err(e) => tracing::trace!("Engine rejected segment from {}: {}", self.remote, e),
        }
    }

    /// Move reassembled messages from the engine to the inbound queue.
    /// Stops while the queue is full, leaving the rest in the engine.
    fn drain(&self) {
        let mut engine = self.engine();
        while let Some(size) = engine.peek_size() {
            let Ok(permit) = self.inbound_tx.try_reserve() else {
                break;
            };
            let mut message = vec![0u8; size];
            match engine.recv(&mut message) {
                Ok(len) => {
                    message.truncate(len);
                    self.messages_received.fetch_add(1, Ordering::Relaxed);
                    permit.send(Bytes::from(message));
                }
                Err(e) => {
                    tracing::warn!("Failed to extract message from {}: {}", self.remote, e);
                    break;
                }
            }
        }
    }

    /// Single teardown path. Idempotent; safe from any task.
    fn shutdown(&self, reason: CloseReason) {
        if !self.lifecycle.close() {
            return;
        }
        if reason.notifies_peer() {
            let _ = self.link.try_send(&ControlMessage::Disconnect.as_bytes());
        }
        // Wakes a pending handshake with ConnectionClosed.
        drop(self.handshake().take());
        if reason != CloseReason::ServerShutdown {
            if let Some(retire) = &self.retire {
                let _ = retire.send(self.remote);
            }
        }
        tracing::info!("Connection to {} closed ({:?})", self.remote, reason);
    }
}

/// Drive the engine at the cadence it asks for and enforce the idle window.
async fn tick_loop(shared: Arc<Shared>) {
    let token = shared.lifecycle.token().clone();
    let idle_timeout = shared.options.idle_timeout_ms;

    loop {
        let now = shared.now_ms();
        if shared.established.load(Ordering::Acquire) {
            let idle = now.saturating_sub(shared.last_received.load(Ordering::Acquire));
            if idle > idle_timeout {
                tracing::info!("Connection to {} idle for {} ms", shared.remote, idle);
                shared.shutdown(CloseReason::IdleTimeout);
                break;
            }
        }

        let next = {
            let mut engine = shared.engine();
            engine
                .update(now as u32)
                .map(|()| engine.check(now as u32))
        };
        let next = match next {
            Ok(next) => next,
            Err(e) => {
                tracing::debug!("Engine update for {} failed: {}", shared.remote, e);
                shared.shutdown(CloseReason::SocketFailure);
                break;
            }
        };
        shared.ticks.fetch_add(1, Ordering::Relaxed);
        shared.drain();

        let delay = Duration::from_millis(next as u64).clamp(MIN_TICK, MAX_TICK);
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::trace!("Tick loop for {} stopped", shared.remote);
}

/// Read datagrams from a dedicated socket until cancelled or the socket fails.
async fn read_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let token = shared.lifecycle.token().clone();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = socket.recv(&mut buf) => result,
        };
        match result {
            Ok(len) => shared.ingest(&buf[..len]),
            // Nothing listening yet surfaces as ECONNREFUSED; keep waiting
            // for the handshake timeout.
            Err(e) if !shared.established.load(Ordering::Acquire) => {
                tracing::trace!("Socket error while handshaking with {}: {}", shared.remote, e);
            }
            Err(e) => {
                tracing::debug!("Socket error on connection to {}: {}", shared.remote, e);
                shared.shutdown(CloseReason::SocketFailure);
                break;
            }
        }
    }
    tracing::trace!("Read loop for {} stopped", shared.remote);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        conn: Connection,
        server: Arc<UdpSocket>,
        peer: UdpSocket,
        retired: mpsc::UnboundedReceiver<SocketAddr>,
    }

    async fn accepted(options: TransportOptions) -> Harness {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (retire, retired) = mpsc::unbounded_channel();
        let conn = Connection::accept(
            Arc::downgrade(&server),
            peer.local_addr().unwrap(),
            Arc::new(options),
            retire,
        )
        .unwrap();
        Harness {
            conn,
            server,
            peer,
            retired,
        }
    }

    async fn recv_within(socket: &UdpSocket, buf: &mut [u8]) -> Option<usize> {
        tokio::time::timeout(Duration::from_millis(200), socket.recv(buf))
            .await
            .ok()
            .map(|result| result.unwrap())
    }

    #[tokio::test]
    async fn test_disconnect_byte_closes_and_retires() {
        let mut h = accepted(TransportOptions::default()).await;
        assert!(h.conn.is_established());
        assert!(!h.conn.owns_socket());

        h.conn.ingest(&ControlMessage::Disconnect.as_bytes());

        assert_eq!(h.conn.state(), LinkState::Closed);
        assert_eq!(h.retired.recv().await, Some(h.peer.local_addr().unwrap()));
        assert!(h.conn.recv().await.is_none());
        assert!(matches!(
            h.conn.send(b"late"),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_bad_checksum_is_dropped() {
        let h = accepted(TransportOptions::default()).await;
        let mut framed = checksum::frame(&[0u8; 32]).to_vec();
        framed[0] ^= 0x01;

        h.conn.ingest(&framed);
        h.conn.ingest(&[7, 7]);

        let stats = h.conn.stats();
        assert_eq!(stats.checksum_failures, 2);
        assert_eq!(stats.messages_received, 0);
        assert_eq!(h.conn.state(), LinkState::Active);
    }

    #[tokio::test]
    async fn test_idle_connection_stops_ticking() {
        let mut h = accepted(TransportOptions {
            idle_timeout_ms: 100,
            ..Default::default()
        })
        .await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(h.conn.state(), LinkState::Closed);
        assert_eq!(h.retired.recv().await, Some(h.peer.local_addr().unwrap()));

        let ticks = h.conn.stats().ticks;
        assert!(ticks > 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.conn.stats().ticks, ticks);

        // Idle close tells the peer.
        let mut buf = [0u8; 16];
        let len = recv_within(&h.peer, &mut buf)
            .await
            .expect("Disconnect byte not sent");
        assert_eq!(&buf[..len], &ControlMessage::Disconnect.as_bytes());
    }

    #[tokio::test]
    async fn test_send_backlog_limit() {
        let h = accepted(TransportOptions {
            send_backlog_limit: 2,
            ..Default::default()
        })
        .await;

        tokio_test::assert_ok!(h.conn.send(b"one"));
        tokio_test::assert_ok!(h.conn.send(b"two"));
        assert!(matches!(
            h.conn.send(b"three"),
            Err(TransportError::SendBacklogFull { pending: 2 })
        ));
    }

    #[tokio::test]
    async fn test_graceful_disconnect_sends_control_byte() {
        let mut h = accepted(TransportOptions::default()).await;
        h.conn.disconnect().await;

        assert_eq!(h.conn.state(), LinkState::Closed);
        assert_eq!(h.retired.recv().await, Some(h.peer.local_addr().unwrap()));

        let mut buf = [0u8; 16];
        let len = recv_within(&h.peer, &mut buf)
            .await
            .expect("Disconnect byte not sent");
        assert_eq!(&buf[..len], &ControlMessage::Disconnect.as_bytes());

        // Second call is a no-op.
        h.conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_full_inbound_queue_holds_messages_in_engine() {
        let h = accepted(TransportOptions {
            inbound_queue_capacity: 1,
            ..Default::default()
        })
        .await;

        // A second engine on the peer socket plays the remote end; its
        // output lands on the server socket and is fed in by hand.
        let peer_out = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mut remote = KcpEngine::new(FramedOutput::new(
            Link::Shared {
                socket: Arc::downgrade(&peer_out),
                peer: h.server.local_addr().unwrap(),
            },
            Arc::new(TrafficCounters::default()),
        ))
        .unwrap();
        for i in 0..5u8 {
            remote.send(&[i; 4]).unwrap();
        }
        remote.update(0).unwrap();
        remote.flush().unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        while let Some(len) = recv_within(&h.server, &mut buf).await {
            h.conn.ingest(&buf[..len]);
        }

        // Only one message fits the queue; the rest wait in the engine.
        assert_eq!(h.conn.stats().messages_received, 1);

        for i in 0..5u8 {
            let message = h.conn.recv().await.expect("Message lost");
            assert_eq!(&message[..], &[i; 4]);
        }
        assert_eq!(h.conn.stats().messages_received, 5);
        assert_eq!(h.conn.state(), LinkState::Active);
    }

    #[tokio::test]
    async fn test_closed_server_socket_fails_connection() {
        let h = accepted(TransportOptions::default()).await;
        assert!(h.conn.local_addr().is_ok());

        drop(h.server);
        h.conn.send(b"after close").unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.conn.state(), LinkState::Closed);
        assert!(h.conn.local_addr().is_err());
    }
}
