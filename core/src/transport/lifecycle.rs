//! Lifecycle shared by the server and connections.
//!
//! Both run background loops that observe a [`CancellationToken`] at every
//! suspension point, and both tear down through the same one-way state
//! machine: Active -> Disconnecting -> Closed.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio_util::sync::CancellationToken;

use crate::config::TransportOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Active,
    Disconnecting,
    Closed,
}

const ACTIVE: u8 = 0;
const DISCONNECTING: u8 = 1;
const CLOSED: u8 = 2;

/// Teardown state plus the cancellation token handed to background loops.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    token: CancellationToken,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Lifecycle {
            state: AtomicU8::new(ACTIVE),
            token: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => LinkState::Active,
            DISCONNECTING => LinkState::Disconnecting,
            _ => LinkState::Closed,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == LinkState::Active
    }

    /// Active -> Disconnecting. Returns false if teardown already started.
    pub fn begin_disconnect(&self) -> bool {
        self.state
            .compare_exchange(ACTIVE, DISCONNECTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to Closed and cancel the token.
    ///
    /// Returns true only for the caller that performed the transition.
    pub fn close(&self) -> bool {
        let previous = self.state.swap(CLOSED, Ordering::AcqRel);
        self.token.cancel();
        previous != CLOSED
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Contract shared by [`Server`](super::Server) and
/// [`Connection`](super::Connection).
pub trait Endpoint {
    fn options(&self) -> &TransportOptions;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn state(&self) -> LinkState;

    /// Tear down the endpoint and stop its background loops
    fn disconnect(&self) -> impl Future<Output = ()> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LinkState::Active);
        assert!(!lifecycle.token().is_cancelled());

        assert!(lifecycle.begin_disconnect());
        assert!(!lifecycle.begin_disconnect());
        assert_eq!(lifecycle.state(), LinkState::Disconnecting);

        assert!(lifecycle.close());
        assert_eq!(lifecycle.state(), LinkState::Closed);
        assert!(lifecycle.token().is_cancelled());
    }

    #[test]
    fn test_close_is_idempotent() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.close());
        assert!(!lifecycle.close());
        assert!(!lifecycle.begin_disconnect());
    }
}
