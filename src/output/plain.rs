//! Plain text output

use crate::protocol::Protocol;
use crate::stats::{RoundReport, TransferReport, bps_to_human, bytes_to_human};

/// One summary line per transfer
pub fn transfer_line(transfer: &TransferReport) -> String {
    let mut line = format!(
        "{} transfer #{} finished, total time: {:.2} seconds, total speed: {}",
        transfer.protocol,
        transfer.index,
        transfer.elapsed_secs,
        bps_to_human(transfer.throughput_bps)
    );

    if let Some(rate) = transfer.success_rate() {
        line.push_str(&format!(", segments received: {:.1}%", rate));
    }

    if transfer.protocol == Protocol::Tcp && !transfer.is_complete() {
        line.push_str(&format!(
            " (partial: {} of {})",
            bytes_to_human(transfer.bytes_received),
            bytes_to_human(transfer.requested_bytes)
        ));
    }

    if let Some(ref error) = transfer.error {
        line.push_str(&format!(" [error: {}]", error));
    }

    line
}

pub fn output_plain(report: &RoundReport) -> String {
    let mut output = String::new();

    for transfer in &report.transfers {
        output.push_str(&transfer_line(transfer));
        output.push('\n');
    }

    output.push_str("─".repeat(60).as_str());
    output.push('\n');
    output.push_str(&format!(
        "  Round {}: {} transfers from {} in {:.2}s\n",
        report.round,
        report.transfers.len(),
        report.server,
        report.elapsed_secs
    ));
    output.push_str(&format!(
        "  Transfer:    {}\n",
        bytes_to_human(report.total_bytes())
    ));
    output.push_str(&format!(
        "  Throughput:  {}\n",
        bps_to_human(report.throughput_bps())
    ));
    output.push_str("─".repeat(60).as_str());
    output.push('\n');

    output
}
