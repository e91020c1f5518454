//! Per-transfer measurement results

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::Protocol;

/// Segment accounting for a UDP transfer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentCounts {
    pub total: u64,
    pub received: u64,
}

impl SegmentCounts {
    /// Percentage of segments that arrived at least once
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.received as f64 / self.total as f64) * 100.0
    }
}

/// Outcome of one measurement task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReport {
    pub protocol: Protocol,
    /// 1-based task number within its protocol
    pub index: u32,
    pub requested_bytes: u64,
    pub bytes_received: u64,
    pub elapsed_secs: f64,
    pub throughput_bps: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<SegmentCounts>,
    /// Set when the transfer ended on an I/O error; the byte count is still
    /// what was actually observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferReport {
    pub fn new(
        protocol: Protocol,
        index: u32,
        requested_bytes: u64,
        bytes_received: u64,
        elapsed: Duration,
    ) -> Self {
        Self {
            protocol,
            index,
            requested_bytes,
            bytes_received,
            elapsed_secs: elapsed.as_secs_f64(),
            throughput_bps: bits_per_second(bytes_received, elapsed),
            segments: None,
            error: None,
        }
    }

    /// A task that could not even start its transfer
    pub fn failed(protocol: Protocol, index: u32, requested_bytes: u64, error: String) -> Self {
        let mut report = Self::new(protocol, index, requested_bytes, 0, Duration::ZERO);
        report.error = Some(error);
        report
    }

    pub fn with_segments(mut self, segments: SegmentCounts) -> Self {
        self.segments = Some(segments);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn success_rate(&self) -> Option<f64> {
        self.segments.map(|s| s.success_rate())
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_received >= self.requested_bytes
    }
}

/// All transfers run against one server offer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundReport {
    pub round: u64,
    pub server: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub elapsed_secs: f64,
    pub transfers: Vec<TransferReport>,
}

impl RoundReport {
    pub fn total_bytes(&self) -> u64 {
        self.transfers.iter().map(|t| t.bytes_received).sum()
    }

    /// Aggregate rate over the wall-clock length of the round
    pub fn throughput_bps(&self) -> f64 {
        bits_per_second(
            self.total_bytes(),
            Duration::from_secs_f64(self.elapsed_secs.max(0.0)),
        )
    }

    pub fn by_protocol(&self, protocol: Protocol) -> impl Iterator<Item = &TransferReport> {
        self.transfers.iter().filter(move |t| t.protocol == protocol)
    }
}

pub fn bits_per_second(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 * 8.0) / secs
    } else {
        0.0
    }
}

pub fn bytes_to_human(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn bps_to_human(bps: f64) -> String {
    if bps >= 1e9 {
        format!("{:.2} Gbps", bps / 1e9)
    } else if bps >= 1e6 {
        format!("{:.1} Mbps", bps / 1e6)
    } else if bps >= 1e3 {
        format!("{:.1} Kbps", bps / 1e3)
    } else {
        format!("{:.1} bps", bps)
    }
}
