//! Client mode implementation
//!
//! Waits for a server offer, runs the configured TCP and UDP transfers
//! against it in parallel, reports, and goes back to listening.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::net;
use crate::protocol::{OFFER_LEN, ProtocolConfig};
use crate::stats::{RoundReport, TransferReport};
use crate::tcp;
use crate::udp;

/// Datagrams on the discovery port are tiny; anything longer than this is
/// cut short and rejected as an offer anyway
const DISCOVERY_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub protocol: ProtocolConfig,
    /// Bytes requested by every transfer
    pub file_size: u64,
    pub tcp_connections: u32,
    pub udp_connections: u32,
    /// A UDP transfer ends when no segment arrives for this long
    pub udp_idle_timeout: Duration,
    /// Stop after this many rounds; `None` runs until the process is killed
    pub rounds: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            file_size: 1024 * 1024,
            tcp_connections: 1,
            udp_connections: 1,
            udp_idle_timeout: udp::DEFAULT_IDLE_TIMEOUT,
            rounds: None,
        }
    }
}

/// A server as announced by one of its offers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerOffer {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl ServerOffer {
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }
}

impl std::fmt::Display for ServerOffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (TCP {}, UDP {})", self.ip, self.tcp_port, self.udp_port)
    }
}

pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Discover, measure, report, repeat.
    ///
    /// Each finished round is sent on `reports`. Returns after
    /// `config.rounds` rounds, or when the receiving side goes away.
    pub async fn run(&self, reports: mpsc::Sender<RoundReport>) -> anyhow::Result<()> {
        let mut round: u64 = 0;

        loop {
            if let Some(max) = self.config.rounds
                && round >= max
            {
                return Ok(());
            }
            round += 1;

            info!("Client started, listening for offer requests...");
            let offer = self.discover().await?;

            let report = self.run_round(round, offer).await;
            info!(
                "Round {} complete: {} transfers against {}",
                round,
                report.transfers.len(),
                offer
            );

            if reports.send(report).await.is_err() {
                debug!("Report receiver dropped, stopping");
                return Ok(());
            }
        }
    }

    /// Block until a valid offer arrives on the discovery port
    pub async fn discover(&self) -> anyhow::Result<ServerOffer> {
        let bind_addr = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.config.protocol.discovery_port,
        );
        let socket = net::create_udp_socket(bind_addr, true).await?;
        let codec = self.config.protocol.codec();
        let mut buffer = [0u8; DISCOVERY_BUFFER_SIZE];

        loop {
            let (n, from) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Error while waiting for offers: {}", e);
                    continue;
                }
            };

            match codec.decode_offer(&buffer[..n]) {
                Ok(offer) => {
                    let from = net::normalize_addr(from);
                    let server = ServerOffer {
                        ip: from.ip(),
                        udp_port: offer.udp_port,
                        tcp_port: offer.tcp_port,
                    };
                    info!("Received offer from {}", server);
                    return Ok(server);
                }
                Err(e) => {
                    // Anything else on the port is noise: log it and keep listening
                    if n != OFFER_LEN {
                        debug!("Ignoring {}-byte datagram from {}: {}", n, from, e);
                    } else {
                        warn!("Invalid offer from {}: {}", from, e);
                    }
                }
            }
        }
    }

    /// Run every configured transfer against `offer` concurrently and wait
    /// for all of them
    pub async fn run_round(&self, round: u64, offer: ServerOffer) -> RoundReport {
        let start = Instant::now();
        let file_size = self.config.file_size;
        let protocol = self.config.protocol;
        let mut handles: Vec<JoinHandle<TransferReport>> = Vec::new();

        for index in 1..=self.config.tcp_connections {
            let addr = offer.tcp_addr();
            let chunk = protocol.tcp_chunk_size();
            handles.push(tokio::spawn(async move {
                tcp::measure(addr, file_size, index, chunk).await
            }));
        }

        for index in 1..=self.config.udp_connections {
            let addr = offer.udp_addr();
            let idle = self.config.udp_idle_timeout;
            handles.push(tokio::spawn(async move {
                udp::measure(addr, file_size, index, &protocol, idle).await
            }));
        }

        let mut transfers = Vec::with_capacity(handles.len());
        for result in futures::future::join_all(handles).await {
            match result {
                Ok(report) => transfers.push(report),
                Err(e) => error!("Transfer task failed: {}", e),
            }
        }

        RoundReport {
            round,
            server: offer.ip,
            tcp_port: offer.tcp_port,
            udp_port: offer.udp_port,
            elapsed_secs: start.elapsed().as_secs_f64(),
            transfers,
        }
    }
}
