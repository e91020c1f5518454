//! UDP segment transfer with burst pacing
//!
//! The client sends a single Request; the server answers with
//! `ceil(size / chunk)` payload segments, pausing briefly after every burst.
//! Nothing is acknowledged or retransmitted, so the receiver counts what
//! arrives and stops once it has everything or the stream goes quiet.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::net;
use crate::protocol::{Codec, PAYLOAD_HEADER_LEN, Protocol, ProtocolConfig};
use crate::stats::{SegmentCounts, TransferReport};

/// Receive buffer; comfortably larger than header + one chunk
const RECV_BUFFER_SIZE: usize = 4096;

/// Quiet period that ends a UDP transfer. It is counted in the elapsed time
/// of any transfer that lost segments, so keep it short.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(50);

/// Burst pacing for the sending side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    /// Segments sent back-to-back before pausing
    pub burst_size: u64,
    pub burst_delay: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            burst_size: 64,
            burst_delay: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpSendStats {
    pub segments_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
}

/// Receiver-side dedup of segment indices
#[derive(Debug)]
pub struct SegmentTracker {
    total: u64,
    seen: HashSet<u64>,
    bytes: u64,
    duplicates: u64,
}

impl SegmentTracker {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            seen: HashSet::new(),
            bytes: 0,
            duplicates: 0,
        }
    }

    /// Record an arrival. Returns false for a duplicate, which contributes
    /// nothing.
    pub fn record(&mut self, segment_index: u64, data_len: usize) -> bool {
        if self.seen.insert(segment_index) {
            self.bytes += data_len as u64;
            true
        } else {
            self.duplicates += 1;
            false
        }
    }

    pub fn is_complete(&self) -> bool {
        self.seen.len() as u64 >= self.total
    }

    pub fn unique(&self) -> u64 {
        self.seen.len() as u64
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn counts(&self) -> SegmentCounts {
        SegmentCounts {
            total: self.total,
            received: self.unique(),
        }
    }
}

/// Handle one request datagram: decode it and stream the segments back to
/// `peer` from a fresh socket. Undecodable requests are dropped.
pub async fn serve_request(
    datagram: Vec<u8>,
    peer: SocketAddr,
    protocol: ProtocolConfig,
    pacing: Pacing,
) -> anyhow::Result<Option<UdpSendStats>> {
    let codec = protocol.codec();
    let request = match codec.decode_request(&datagram) {
        Ok(request) => request,
        Err(e) => {
            debug!("Discarding datagram from {}: {}", peer, e);
            return Ok(None);
        }
    };
    if request.file_size == 0 {
        debug!("Discarding zero-size request from {}", peer);
        return Ok(None);
    }

    let socket = net::create_udp_socket_for_remote(peer).await?;
    debug!(
        "UDP request from {} for {} bytes",
        peer, request.file_size
    );

    let stats = send_segments(&socket, peer, request.file_size, &protocol, pacing).await;
    debug!(
        "UDP transfer to {} complete: {} segments, {} bytes, {} send errors",
        peer, stats.segments_sent, stats.bytes_sent, stats.send_errors
    );
    Ok(Some(stats))
}

/// Send every segment of a `file_size`-byte transfer in index order
pub async fn send_segments(
    socket: &UdpSocket,
    peer: SocketAddr,
    file_size: u64,
    protocol: &ProtocolConfig,
    pacing: Pacing,
) -> UdpSendStats {
    let codec = protocol.codec();
    let chunk = protocol.chunk_size as u64;
    let total = protocol.total_segments(file_size);
    let burst = pacing.burst_size.max(1);

    let mut packet = vec![0u8; PAYLOAD_HEADER_LEN + protocol.chunk_size];
    let mut stats = UdpSendStats {
        segments_sent: 0,
        bytes_sent: 0,
        send_errors: 0,
    };

    for index in 0..total {
        let data_len = (file_size - index * chunk).min(chunk) as usize;
        codec.write_payload_header(&mut packet, total, index);

        match socket
            .send_to(&packet[..PAYLOAD_HEADER_LEN + data_len], peer)
            .await
        {
            Ok(_) => {
                stats.segments_sent += 1;
                stats.bytes_sent += data_len as u64;
            }
            Err(e) => {
                // Best-effort: the receiver's success rate shows the gap
                warn!("UDP send of segment {} to {} failed: {}", index, peer, e);
                stats.send_errors += 1;
            }
        }

        if (index + 1) % burst == 0 && index + 1 < total {
            tokio::time::sleep(pacing.burst_delay).await;
        }
    }

    stats
}

/// Receive segments until all `tracker` expects have arrived or nothing
/// shows up for `idle_timeout`
pub async fn receive_segments(
    socket: &UdpSocket,
    codec: &Codec,
    tracker: &mut SegmentTracker,
    idle_timeout: Duration,
    index: u32,
) -> Option<String> {
    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

    while !tracker.is_complete() {
        let received = tokio::time::timeout(idle_timeout, socket.recv_from(&mut buffer)).await;
        let n = match received {
            Ok(Ok((n, _addr))) => n,
            Ok(Err(e)) => {
                warn!("UDP #{}: receive error: {}", index, e);
                return Some(e.to_string());
            }
            Err(_) => {
                debug!(
                    "UDP #{}: idle for {:?}, stopping with {}/{} segments",
                    index,
                    idle_timeout,
                    tracker.unique(),
                    tracker.counts().total
                );
                break;
            }
        };

        match codec.decode_payload(&buffer[..n]) {
            Ok((header, data_len)) => {
                tracker.record(header.segment_index, data_len);
            }
            Err(e) => {
                debug!("UDP #{}: discarding datagram: {}", index, e);
            }
        }
    }

    None
}

/// Run one UDP measurement against `server`.
///
/// Never fails: socket errors are recorded on the report along with
/// whatever segments arrived before them.
pub async fn measure(
    server: SocketAddr,
    file_size: u64,
    index: u32,
    protocol: &ProtocolConfig,
    idle_timeout: Duration,
) -> TransferReport {
    let codec = protocol.codec();

    let socket = match net::create_udp_socket_for_remote(server).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("UDP #{}: failed to bind socket: {}", index, e);
            return TransferReport::failed(Protocol::Udp, index, file_size, e.to_string());
        }
    };

    if let Err(e) = socket
        .send_to(&codec.encode_request(file_size), server)
        .await
    {
        warn!("UDP #{}: failed to send request to {}: {}", index, server, e);
        return TransferReport::failed(Protocol::Udp, index, file_size, e.to_string());
    }
    debug!("UDP #{} requested {} bytes from {}", index, file_size, server);

    let start = Instant::now();
    let mut tracker = SegmentTracker::new(protocol.total_segments(file_size));
    let error = receive_segments(&socket, &codec, &mut tracker, idle_timeout, index).await;

    if tracker.duplicates() > 0 {
        debug!("UDP #{}: ignored {} duplicate segments", index, tracker.duplicates());
    }

    let report = TransferReport::new(
        Protocol::Udp,
        index,
        file_size,
        tracker.bytes(),
        start.elapsed(),
    )
    .with_segments(tracker.counts());
    match error {
        Some(e) => report.with_error(e),
        None => report,
    }
}
