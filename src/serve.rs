//! Server mode implementation
//!
//! Announces itself with periodic broadcast offers and serves TCP and UDP
//! transfer requests, each in its own task.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, error, info, warn};

use crate::net;
use crate::protocol::{CHUNK_SIZE, Protocol, ProtocolConfig};
use crate::tcp;
use crate::udp::{self, Pacing};

/// Large enough for any request datagram; longer ones are truncated and
/// then rejected by the decoder
const REQUEST_BUFFER_SIZE: usize = CHUNK_SIZE;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub protocol: ProtocolConfig,
    /// Local address for the data listener and socket
    pub bind_addr: IpAddr,
    /// Destination of offer broadcasts
    pub broadcast_addr: IpAddr,
    pub broadcast_interval: Duration,
    /// Ports scanned for the TCP listener and the UDP socket
    pub port_range: RangeInclusive<u16>,
    pub pacing: Pacing,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            broadcast_interval: Duration::from_secs(1),
            // Skip the privileged range
            port_range: 1025..=65535,
            pacing: Pacing::default(),
        }
    }
}

pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    socket: UdpSocket,
    tcp_port: u16,
    udp_port: u16,
}

impl Server {
    /// Allocate ports and bind the TCP listener and UDP socket.
    ///
    /// Fails if the port range is exhausted for either transport.
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Self> {
        let udp_port = net::find_available_port(config.port_range.clone(), Protocol::Udp)?;
        let tcp_port = net::find_available_port(config.port_range.clone(), Protocol::Tcp)?;

        let listener = net::create_tcp_listener(SocketAddr::new(config.bind_addr, tcp_port)).await?;
        let socket =
            net::create_udp_socket(SocketAddr::new(config.bind_addr, udp_port), false).await?;

        info!(
            "Server started on {} (TCP port {}, UDP port {})",
            config.bind_addr, tcp_port, udp_port
        );

        Ok(Self {
            config,
            listener,
            socket,
            tcp_port,
            udp_port,
        })
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    /// Start broadcasting and serve requests until the task is dropped
    pub async fn run(self) -> anyhow::Result<()> {
        let broadcast_target =
            SocketAddr::new(self.config.broadcast_addr, self.config.protocol.discovery_port);
        tokio::spawn(broadcast_offers(
            broadcast_target,
            self.config.protocol,
            self.udp_port,
            self.tcp_port,
            self.config.broadcast_interval,
        ));

        let protocol = self.config.protocol;
        let pacing = self.config.pacing;
        let tcp_chunk = protocol.tcp_chunk_size();
        let mut buffer = vec![0u8; REQUEST_BUFFER_SIZE];

        loop {
            // Poll both sockets together so a flood on one transport never
            // starves the other
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("TCP connection from {}", peer);
                            tokio::spawn(async move {
                                if let Err(e) = tcp::serve_file(stream, tcp_chunk).await {
                                    warn!("TCP handler for {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => warn!("TCP accept error: {}", e),
                    }
                }
                received = self.socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((n, peer)) => {
                            let datagram = buffer[..n].to_vec();
                            tokio::spawn(async move {
                                if let Err(e) = udp::serve_request(datagram, peer, protocol, pacing).await {
                                    warn!("UDP handler for {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => warn!("UDP receive error: {}", e),
                    }
                }
            }
        }
    }
}

/// Send an offer to `target` every `interval`. A socket error stops the
/// broadcaster but leaves the server running.
async fn broadcast_offers(
    target: SocketAddr,
    protocol: ProtocolConfig,
    udp_port: u16,
    tcp_port: u16,
    interval: Duration,
) {
    let socket = match net::create_broadcast_socket().await {
        Ok(socket) => socket,
        Err(e) => {
            error!("Failed to create broadcast socket: {}", e);
            return;
        }
    };

    let offer = protocol.codec().encode_offer(udp_port, tcp_port);
    let mut ticker = tokio::time::interval(interval);
    info!("Broadcasting offers to {}", target);

    loop {
        ticker.tick().await;
        if let Err(e) = socket.send_to(&offer, target).await {
            error!("Offer broadcast to {} failed, broadcaster stopping: {}", target, e);
            return;
        }
        debug!("Offer sent to {}", target);
    }
}
