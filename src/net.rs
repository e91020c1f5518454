//! Socket creation and port allocation.
//!
//! Uses socket2 for the options tokio does not expose directly (address
//! reuse, broadcast) and converts to tokio sockets afterwards.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;

use socket2::{Domain, SockAddr, Socket, Type};
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info};

use crate::protocol::Protocol;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("no {transport} port available in {start}..={end}")]
    NoPortAvailable {
        start: u16,
        end: u16,
        transport: Protocol,
    },
}

/// Return the first port in `range` that a probe socket of `transport` can
/// bind on all interfaces. The probe is closed before returning, so the port
/// is free again (and could in principle be taken by someone else before the
/// caller binds it).
pub fn find_available_port(
    range: RangeInclusive<u16>,
    transport: Protocol,
) -> Result<u16, PortError> {
    let (start, end) = (*range.start(), *range.end());

    for port in range {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let bound = match transport {
            Protocol::Tcp => std::net::TcpListener::bind(addr).map(drop),
            Protocol::Udp => std::net::UdpSocket::bind(addr).map(drop),
        };
        match bound {
            Ok(()) => {
                debug!("{} port {} available", transport, port);
                return Ok(port);
            }
            Err(e) => debug!("{} port {} unavailable: {}", transport, port, e),
        }
    }

    Err(PortError::NoPortAvailable {
        start,
        end,
        transport,
    })
}

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

/// Create a TCP listener on `addr`
pub async fn create_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(socket2::Protocol::TCP))?;

    // Allow quick restarts while old connections sit in TIME_WAIT
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(128)?;

    // Convert to non-blocking for tokio
    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener)?;

    info!("TCP listening on {}", addr);
    Ok(listener)
}

/// Create a UDP socket bound to `addr`.
///
/// `reuse` enables SO_REUSEADDR, which lets several clients on one host share
/// the discovery port. Data sockets leave it off so two servers can never
/// end up splitting one port's traffic.
pub async fn create_udp_socket(addr: SocketAddr, reuse: bool) -> io::Result<UdpSocket> {
    let socket = Socket::new(domain_for(&addr), Type::DGRAM, Some(socket2::Protocol::UDP))?;
    if reuse {
        socket.set_reuse_address(true)?;
    }
    socket.bind(&SockAddr::from(addr))?;

    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    let udp = UdpSocket::from_std(std_socket)?;

    debug!("UDP socket bound to {}", addr);
    Ok(udp)
}

/// Create a UDP socket on an ephemeral port matching the address family of
/// `remote`
pub async fn create_udp_socket_for_remote(remote: SocketAddr) -> io::Result<UdpSocket> {
    let bind_addr = if remote.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0)
    };
    create_udp_socket(bind_addr, false).await
}

/// Create an ephemeral IPv4 UDP socket allowed to send to broadcast addresses
pub async fn create_broadcast_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_broadcast(true)?;
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    socket.bind(&SockAddr::from(bind_addr))?;

    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Convert IPv4-mapped IPv6 to IPv4 if applicable
pub fn normalize_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => {
            if let Some(v4) = v6.ip().to_ipv4_mapped() {
                SocketAddr::new(IpAddr::V4(v4), v6.port())
            } else {
                addr
            }
        }
        _ => addr,
    }
}
