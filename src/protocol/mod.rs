//! Protocol module - wire fields, packet envelopes and frame classification.
//!
//! This module implements the binary client protocol:
//! - primitive field codec and packet constants
//! - typed frame headers and the forward-request packet
//! - incremental classifier for backend packets

mod classifier;
mod frame;
pub mod wire_format;

pub use classifier::FrameClassifier;
pub use frame::{encode_forward_request, ExchangeContext, FrameHeader, RequestHead};
pub use wire_format::{
    body_chunk_header, prefix, response_packet, PacketHeader, MAX_BODY_CHUNK, MAX_PACKET_SIZE,
    PACKET_HEADER_SIZE, REQUEST_MAGIC, RESPONSE_MAGIC,
};
