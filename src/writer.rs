//! Batched frame writes.
//!
//! Eligible frames are written with scatter/gather I/O so a whole batch
//! (forward request plus body chunks) usually leaves in one syscall.
//!
//! ```text
//! FrameQueues ─► poll ─► [OutboundFrame; N] ─► write_vectored ─► transport
//! ```

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// A frame ready to be written to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Encoded header; empty for fully encoded control packets.
    pub header: Bytes,
    /// Payload bytes.
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Create a new outbound frame.
    #[inline]
    pub fn new(header: Bytes, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        self.header.len() + self.payload.len()
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
///
/// Partial writes are resumed from the exact byte offset. Returns the total
/// number of bytes written.
pub async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    if total_size == 0 {
        return Ok(0);
    }

    let mut total_written = 0;
    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(total_written)
}

/// Build IoSlice array for remaining data after partial write.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for part in batch.iter().flat_map(|f| [&f.header, &f.payload]) {
        let end = offset + part.len();
        if !part.is_empty() && skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&part[start..]));
        }
        offset = end;
    }

    slices
}
