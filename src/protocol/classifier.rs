//! Incremental classifier turning backend bytes into frame headers.
//!
//! Bytes may arrive split at any position. The classifier keeps a small
//! scratch buffer and a state machine:
//! - `Envelope`: need the 4-byte magic + length
//! - `Prefix`: need the packet type byte
//! - `ChunkLength`: body chunk, need its 2-byte length
//! - `Fields`: control packet, need the rest of the packet
//! - `Skip`: unknown packet type, discard its bytes
//!
//! For a body chunk only the header is consumed; the chunk bytes and the
//! trailing NUL are left in the caller's buffer as frame data.

use bytes::{Buf, BytesMut};
use tracing::debug;

use super::frame::FrameHeader;
use super::wire_format::{
    get_bool, get_header_name, get_int, get_string, prefix, PacketHeader, PACKET_HEADER_SIZE,
    RESPONSE_MAGIC,
};
use crate::error::{MhStreamError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Envelope,
    Prefix { remaining: usize },
    ChunkLength { remaining: usize },
    Fields { prefix: u8, remaining: usize },
    Skip { remaining: usize },
}

/// Stateful classifier for backend → client packets.
#[derive(Debug)]
pub struct FrameClassifier {
    state: State,
    scratch: BytesMut,
}

impl FrameClassifier {
    /// Create a classifier waiting for a packet envelope.
    pub fn new() -> Self {
        Self {
            state: State::Envelope,
            scratch: BytesMut::with_capacity(PACKET_HEADER_SIZE),
        }
    }

    /// Consume bytes until one frame header is complete.
    ///
    /// Returns `Ok(None)` when more bytes are needed. After a header is
    /// returned the classifier is ready for the next packet.
    ///
    /// # Errors
    ///
    /// Bad magic, truncated fields, or a chunk length disagreeing with the
    /// packet length.
    pub fn parse<B: Buf>(&mut self, data: &mut B) -> Result<Option<FrameHeader>> {
        loop {
            match self.state {
                State::Envelope => {
                    if !self.fill(data, PACKET_HEADER_SIZE) {
                        return Ok(None);
                    }
                    let header = PacketHeader::decode(&self.scratch).ok_or_else(|| {
                        MhStreamError::Protocol("Incomplete packet envelope".to_string())
                    })?;
                    header.validate(RESPONSE_MAGIC)?;
                    self.scratch.clear();
                    self.state = State::Prefix {
                        remaining: usize::from(header.length),
                    };
                }

                State::Prefix { remaining } => {
                    if !data.has_remaining() {
                        return Ok(None);
                    }
                    let packet_type = data.get_u8();
                    let remaining = remaining - 1;
                    self.state = match packet_type {
                        prefix::SEND_BODY_CHUNK => {
                            if remaining < 2 {
                                return Err(MhStreamError::Protocol(
                                    "Body chunk packet without length".to_string(),
                                ));
                            }
                            State::ChunkLength { remaining }
                        }
                        prefix::SEND_HEADERS | prefix::END_RESPONSE | prefix::GET_BODY_CHUNK => {
                            State::Fields {
                                prefix: packet_type,
                                remaining,
                            }
                        }
                        other => {
                            debug!("Ignoring unknown frame type {}", other);
                            State::Skip { remaining }
                        }
                    };
                }

                State::ChunkLength { remaining } => {
                    if !self.fill(data, 2) {
                        return Ok(None);
                    }
                    let length = usize::from(u16::from_be_bytes([self.scratch[0], self.scratch[1]]));
                    // Chunk bytes plus the NUL must fill the rest of the packet.
                    if remaining - 2 != length + 1 {
                        return Err(MhStreamError::Protocol(format!(
                            "Body chunk length {} does not match packet length {}",
                            length,
                            remaining + 1
                        )));
                    }
                    self.reset();
                    return Ok(Some(FrameHeader::SendBodyChunk { length }));
                }

                State::Fields { prefix, remaining } => {
                    if !self.fill(data, remaining) {
                        return Ok(None);
                    }
                    let mut fields = self.scratch.split().freeze();
                    self.reset();
                    return decode_fields(prefix, &mut fields).map(Some);
                }

                State::Skip { remaining } => {
                    let n = remaining.min(data.remaining());
                    data.advance(n);
                    if n < remaining {
                        self.state = State::Skip {
                            remaining: remaining - n,
                        };
                        return Ok(None);
                    }
                    self.reset();
                }
            }
        }
    }

    /// Drop any partial packet and wait for a new envelope.
    pub fn reset(&mut self) {
        self.state = State::Envelope;
        self.scratch.clear();
    }

    /// Whether the classifier sits between packets.
    pub fn is_idle(&self) -> bool {
        self.state == State::Envelope && self.scratch.is_empty()
    }

    /// Copy bytes into scratch until it holds `target` bytes.
    fn fill<B: Buf>(&mut self, data: &mut B, target: usize) -> bool {
        while self.scratch.len() < target && data.has_remaining() {
            let chunk = data.chunk();
            let n = (target - self.scratch.len()).min(chunk.len());
            self.scratch.extend_from_slice(&chunk[..n]);
            data.advance(n);
        }
        self.scratch.len() >= target
    }
}

impl Default for FrameClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_fields<B: Buf>(packet_type: u8, fields: &mut B) -> Result<FrameHeader> {
    match packet_type {
        prefix::SEND_HEADERS => {
            let status = get_int(fields)?;
            let reason = get_string(fields)?;
            let count = get_int(fields)?;
            let mut headers = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                let name = get_header_name(fields)?;
                let value = get_string(fields)?;
                headers.push((name, value));
            }
            Ok(FrameHeader::SendHeaders {
                status,
                reason,
                headers,
            })
        }
        prefix::GET_BODY_CHUNK => Ok(FrameHeader::RequestBodyChunk {
            length: usize::from(get_int(fields)?),
        }),
        prefix::END_RESPONSE => Ok(FrameHeader::EndResponse {
            persistent: get_bool(fields)?,
        }),
        other => Err(MhStreamError::Protocol(format!(
            "No field decoder for frame type {other}"
        ))),
    }
}
