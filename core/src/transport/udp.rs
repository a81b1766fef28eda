use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::config::TransportOptions;
use crate::error::{Result, TransportError};

/// Largest datagram the transport reads
pub const MAX_DATAGRAM: usize = 65_535;

/// Bind the server socket described by `options`.
///
/// An IPv6 bind address is bound dual-stack (`IPV6_V6ONLY` off) so IPv4
/// peers reach the same socket as IPv4-mapped addresses.
pub fn bind_server(options: &TransportOptions) -> Result<UdpSocket> {
    let addr = SocketAddr::new(options.bind_ip()?, options.port);
    bind_socket(addr, true).map_err(|source| TransportError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// Bind an ephemeral socket and connect it to `remote`.
pub async fn connect_client(remote: SocketAddr) -> io::Result<UdpSocket> {
    let local = match remote {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let socket = bind_socket(local, false)?;
    socket.connect(remote).await?;
    Ok(socket)
}

fn bind_socket(addr: SocketAddr, dual_stack: bool) -> io::Result<UdpSocket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(!dual_stack)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}
