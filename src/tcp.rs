//! TCP bulk transfer
//!
//! The client opens a connection, writes the requested size as a decimal
//! line, and the server streams back exactly that many filler bytes before
//! closing.

use std::net::SocketAddr;
use std::time::Instant;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::protocol::Protocol;
use crate::stats::TransferReport;

/// Longest size line accepted; a u64 needs at most 20 digits
const MAX_LINE_LENGTH: usize = 64;

/// Read the client's size line and stream `size` filler bytes back.
///
/// Returns the number of bytes written. An unparsable line closes the
/// connection without sending anything.
pub async fn serve_file(stream: TcpStream, chunk_size: usize) -> anyhow::Result<u64> {
    let peer = stream.peer_addr()?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let size = match read_size_line(&mut reader).await {
        Ok(size) => size,
        Err(e) => {
            warn!("Rejecting TCP request from {}: {}", peer, e);
            let _ = writer.shutdown().await;
            return Ok(0);
        }
    };
    debug!("TCP request from {} for {} bytes", peer, size);

    let buffer = vec![0u8; chunk_size];
    let mut sent: u64 = 0;

    while sent < size {
        let n = (size - sent).min(chunk_size as u64) as usize;
        if let Err(e) = writer.write_all(&buffer[..n]).await {
            // No retry: the client reports whatever made it across
            warn!("TCP send to {} failed after {} bytes: {}", peer, sent, e);
            return Ok(sent);
        }
        sent += n as u64;
    }

    let _ = writer.shutdown().await;
    debug!("TCP transfer to {} complete: {} bytes", peer, sent);
    Ok(sent)
}

/// Read one newline-terminated decimal size, bounded by [`MAX_LINE_LENGTH`]
pub async fn read_size_line<R>(reader: &mut R) -> anyhow::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader
        .take(MAX_LINE_LENGTH as u64)
        .read_until(b'\n', &mut line)
        .await?;

    if n == 0 {
        return Err(anyhow::anyhow!("connection closed before size line"));
    }
    if line.last() != Some(&b'\n') {
        return Err(anyhow::anyhow!("size line missing newline"));
    }

    let text = std::str::from_utf8(&line)?.trim();
    let size: u64 = text
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid size {:?}: {}", text, e))?;
    if size == 0 {
        return Err(anyhow::anyhow!("requested size must be positive"));
    }
    Ok(size)
}

/// Run one TCP measurement against `server`.
///
/// Never fails: connection and read errors end up on the report next to the
/// bytes that did arrive.
pub async fn measure(
    server: SocketAddr,
    file_size: u64,
    index: u32,
    chunk_size: usize,
) -> TransferReport {
    let mut stream = match TcpStream::connect(server).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("TCP #{}: failed to connect to {}: {}", index, server, e);
            return TransferReport::failed(Protocol::Tcp, index, file_size, e.to_string());
        }
    };
    debug!("TCP #{} connected to {}", index, server);

    if let Err(e) = stream
        .write_all(format!("{}\n", file_size).as_bytes())
        .await
    {
        warn!("TCP #{}: failed to send size line: {}", index, e);
        return TransferReport::failed(Protocol::Tcp, index, file_size, e.to_string());
    }

    let start = Instant::now();
    let mut buffer = vec![0u8; chunk_size];
    let mut received: u64 = 0;
    let mut error = None;

    while received < file_size {
        let want = (file_size - received).min(chunk_size as u64) as usize;
        match stream.read(&mut buffer[..want]).await {
            Ok(0) => {
                debug!(
                    "TCP #{}: server closed after {} of {} bytes",
                    index, received, file_size
                );
                break;
            }
            Ok(n) => received += n as u64,
            Err(e) => {
                warn!("TCP #{}: receive error after {} bytes: {}", index, received, e);
                error = Some(e.to_string());
                break;
            }
        }
    }

    let report = TransferReport::new(Protocol::Tcp, index, file_size, received, start.elapsed());
    match error {
        Some(e) => report.with_error(e),
        None => report,
    }
}
