//! Framed-channel contract and the read-side frame assembler.
//!
//! A protocol plugs into a generic framed-channel engine through
//! [`FramedProtocol`]: the engine hands it raw bytes to classify, then
//! delivers each header together with its frame data. [`FrameReceiver`] is
//! that engine read side. It collects the declared frame bytes of each
//! header into a pooled buffer, however the bytes are split across reads.
//!
//! ```text
//! bytes ─► parse_frame ─► header ─┬─ frame_length == 0 ─► create_channel(header, None)
//!                                 └─ collect N bytes ───► create_channel(header, Some(buf))
//! ```

use std::fmt;

use bytes::{Buf, BufMut};

use crate::error::Result;
use crate::pool::{BufferPool, PooledBuffer};
use crate::protocol::FrameHeader;

/// A classified frame header.
pub trait FrameHeaderData {
    /// Number of frame-data bytes that follow the header on the wire.
    fn frame_length(&self) -> usize;
}

impl FrameHeaderData for FrameHeader {
    fn frame_length(&self) -> usize {
        FrameHeader::frame_length(self)
    }
}

/// Callbacks a protocol implements for the framed-channel engine.
pub trait FramedProtocol {
    /// Frame header produced by [`parse_frame`](Self::parse_frame).
    type Header: FrameHeaderData;
    /// Inbound stream type.
    type Source;

    /// Consume bytes until one frame header is complete.
    fn parse_frame<B: Buf>(&mut self, data: &mut B) -> Result<Option<Self::Header>>;

    /// Route a header and its frame data.
    ///
    /// Returns the source stream the frame belongs to, if any.
    fn create_channel(
        &mut self,
        header: Self::Header,
        frame_data: Option<PooledBuffer>,
    ) -> Result<Option<&mut Self::Source>>;

    /// Whether no further frames will be sent.
    fn is_last_frame_sent(&self) -> bool;

    /// Whether no further frames will be received.
    fn is_last_frame_received(&self) -> bool;

    /// The inbound direction failed.
    fn handle_broken_source_channel(&mut self, err: std::io::Error);

    /// The outbound direction failed.
    fn handle_broken_sink_channel(&mut self, err: std::io::Error);

    /// Close every open sub-stream.
    fn close_sub_channels(&mut self);
}

/// Collects frame data for headers whose data spans reads.
pub struct FrameReceiver<H> {
    partial: Option<(H, PooledBuffer)>,
}

impl<H: FrameHeaderData> FrameReceiver<H> {
    /// Create a receiver between frames.
    pub fn new() -> Self {
        Self { partial: None }
    }

    /// Feed inbound bytes through `protocol`.
    ///
    /// Returns how many frames were delivered. Bytes of an incomplete frame
    /// are kept in a pooled buffer until the next call.
    pub fn receive<P, B>(&mut self, protocol: &mut P, pool: &BufferPool, data: &mut B) -> Result<usize>
    where
        P: FramedProtocol<Header = H>,
        B: Buf,
    {
        let mut delivered = 0;
        loop {
            if let Some((header, mut buf)) = self.partial.take() {
                let missing = header.frame_length() - buf.len();
                let n = missing.min(data.remaining());
                buf.put((&mut *data).take(n));
                if n < missing {
                    self.partial = Some((header, buf));
                    return Ok(delivered);
                }
                protocol.create_channel(header, Some(buf))?;
                delivered += 1;
                continue;
            }

            let Some(header) = protocol.parse_frame(data)? else {
                return Ok(delivered);
            };
            let length = header.frame_length();
            if length == 0 {
                protocol.create_channel(header, None)?;
                delivered += 1;
            } else {
                let mut buf = pool.allocate();
                buf.reserve(length);
                self.partial = Some((header, buf));
            }
        }
    }

    /// Whether no frame data is being collected.
    pub fn is_idle(&self) -> bool {
        self.partial.is_none()
    }

    /// Drop any partially collected frame, releasing its buffer.
    pub fn clear(&mut self) {
        self.partial = None;
    }
}

impl<H: FrameHeaderData> Default for FrameReceiver<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> fmt::Debug for FrameReceiver<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReceiver")
            .field("collected", &self.partial.as_ref().map(|(_, buf)| buf.len()))
            .finish()
    }
}
