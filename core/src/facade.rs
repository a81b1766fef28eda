//! Transport Facade
//!
//! The session-level boundary: listen/accept on the server side,
//! connect on the client side, and one teardown for both.

use std::sync::Arc;

use crate::config::TransportOptions;
use crate::error::{Result, TransportError};
use crate::transport::{Connection, Endpoint, Server};

/// KCP-over-UDP transport as seen by the layer above.
#[derive(Debug, Default)]
pub struct KcpTransport {
    options: Arc<TransportOptions>,
    server: Option<Server>,
    client: Option<Connection>,
}

impl KcpTransport {
    pub fn new(options: TransportOptions) -> Self {
        KcpTransport {
            options: Arc::new(options),
            server: None,
            client: None,
        }
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Bind the server socket. Bind failures are returned, not retried.
    pub fn listen(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Ok(());
        }
        self.options.validate()?;
        self.server = Some(Server::listen(self.options.clone())?);
        Ok(())
    }

    /// Wait for the next admitted connection. `None` once the server is
    /// gone (or was never started).
    pub async fn accept(&self) -> Option<Connection> {
        match &self.server {
            Some(server) => server.accept().await,
            None => None,
        }
    }

    /// Connect to a server and wait for the handshake to complete.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<Connection> {
        if let Some(previous) = self.client.take() {
            previous.disconnect().await;
        }
        let conn = Connection::connect(host, port, self.options.clone()).await?;
        self.client = Some(conn.clone());
        Ok(conn)
    }

    /// Active client connection, if any
    pub fn client(&self) -> Option<&Connection> {
        self.client.as_ref()
    }

    pub fn server(&self) -> Option<&Server> {
        self.server.as_ref()
    }

    /// Tear down the server and the client connection.
    pub async fn disconnect(&mut self) {
        if let Some(server) = self.server.take() {
            Endpoint::disconnect(&server).await;
        }
        if let Some(client) = self.client.take() {
            Endpoint::disconnect(&client).await;
        }
    }

    /// `kcp://bind_address:port`, using the bound port once listening.
    pub fn server_uri(&self) -> String {
        let port = self
            .server
            .as_ref()
            .and_then(|server| server.local_addr().ok())
            .map(|addr| addr.port())
            .unwrap_or(self.options.port);
        self.options.uri(port)
    }

    /// Send a message on the client connection.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        self.client
            .as_ref()
            .ok_or(TransportError::ConnectionClosed)?
            .send(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> TransportOptions {
        TransportOptions {
            port: 0,
            bind_address: "127.0.0.1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_uri_before_listen() {
        let transport = KcpTransport::new(TransportOptions::default());
        assert_eq!(transport.server_uri(), "kcp://[::]:7777");
    }

    #[tokio::test]
    async fn test_uri_reports_bound_port() {
        let mut transport = KcpTransport::new(loopback());
        transport.listen().unwrap();
        let port = transport.server().unwrap().local_addr().unwrap().port();
        assert_eq!(transport.server_uri(), format!("kcp://127.0.0.1:{}", port));
        transport.disconnect().await;
        assert!(transport.server().is_none());
    }

    #[tokio::test]
    async fn test_accept_without_server() {
        let transport = KcpTransport::new(loopback());
        assert!(transport.accept().await.is_none());
        assert!(matches!(
            transport.send(b"x"),
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_listen_rejects_invalid_options() {
        let mut transport = KcpTransport::new(TransportOptions {
            max_connections: 0,
            ..loopback()
        });
        assert!(matches!(transport.listen(), Err(TransportError::Config(_))));
    }
}
