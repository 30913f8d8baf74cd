//! Wire format encoding and decoding.
//!
//! Every packet is wrapped in a 4-byte envelope:
//! ```text
//! ┌──────────┬──────────┬──────────────────────────┐
//! │ Magic    │ Length   │ Payload                  │
//! │ 2 bytes  │ uint16 BE│ Length bytes, prefix[0]  │
//! └──────────┴──────────┴──────────────────────────┘
//! ```
//!
//! Backend → client packets use magic `"AB"`, client → backend packets use
//! `0x12 0x34`. The first payload byte is the packet type prefix.
//!
//! Primitive fields inside a payload:
//! - int: 2 bytes, Big Endian
//! - string: int length, raw bytes, trailing NUL (`0xFFFF` length = null)
//! - byte / bool: 1 byte

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MhStreamError, Result};

/// Envelope size in bytes (magic + length).
pub const PACKET_HEADER_SIZE: usize = 4;

/// Largest packet, envelope included.
pub const MAX_PACKET_SIZE: usize = 8192;

/// Largest body payload in one client → backend data packet.
///
/// Envelope (4) plus the chunk length field (2) come off the packet size.
pub const MAX_BODY_CHUNK: usize = MAX_PACKET_SIZE - 6;

/// Magic for packets sent by the backend.
pub const RESPONSE_MAGIC: [u8; 2] = *b"AB";

/// Magic for packets sent to the backend.
pub const REQUEST_MAGIC: [u8; 2] = [0x12, 0x34];

/// String length marking a null string.
pub const NULL_STRING_LENGTH: u16 = 0xFFFF;

/// Attribute terminator in a forward-request packet.
pub const ATTRIBUTES_END: u8 = 0xFF;

/// Attribute code carrying the query string of the request URI.
pub const ATTRIBUTE_QUERY_STRING: u8 = 0x05;

/// Attribute code carrying a method name with no assigned method code.
pub const ATTRIBUTE_STORED_METHOD: u8 = 0x0E;

/// Method code used when the method name travels as an attribute.
pub const METHOD_STORED: u8 = 0xFF;

/// Packet type prefixes.
pub mod prefix {
    /// Client → backend: request line, headers and attributes.
    pub const FORWARD_REQUEST: u8 = 2;
    /// Backend → client: one chunk of response body.
    pub const SEND_BODY_CHUNK: u8 = 3;
    /// Backend → client: status line and response headers.
    pub const SEND_HEADERS: u8 = 4;
    /// Backend → client: response finished, carries the reuse flag.
    pub const END_RESPONSE: u8 = 5;
    /// Backend → client: asks for more request body (credit grant).
    pub const GET_BODY_CHUNK: u8 = 6;
}

/// Decoded packet envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Two magic bytes identifying the direction.
    pub magic: [u8; 2],
    /// Payload length in bytes.
    pub length: u16,
}

impl PacketHeader {
    /// Create a new envelope.
    pub fn new(magic: [u8; 2], length: u16) -> Self {
        Self { magic, length }
    }

    /// Encode the envelope to bytes (Big Endian length).
    pub fn encode(&self) -> [u8; PACKET_HEADER_SIZE] {
        let len = self.length.to_be_bytes();
        [self.magic[0], self.magic[1], len[0], len[1]]
    }

    /// Decode an envelope; `None` if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < PACKET_HEADER_SIZE {
            return None;
        }
        Some(Self {
            magic: [buf[0], buf[1]],
            length: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }

    /// Check the magic and that the packet fits the size limit.
    pub fn validate(&self, expected_magic: [u8; 2]) -> Result<()> {
        if self.magic != expected_magic {
            return Err(MhStreamError::Protocol(format!(
                "Invalid packet magic {:02x}{:02x}",
                self.magic[0], self.magic[1]
            )));
        }
        if usize::from(self.length) + PACKET_HEADER_SIZE > MAX_PACKET_SIZE {
            return Err(MhStreamError::Protocol(format!(
                "Packet size {} exceeds maximum {}",
                self.length, MAX_PACKET_SIZE
            )));
        }
        if self.length == 0 {
            return Err(MhStreamError::Protocol("Empty packet".to_string()));
        }
        Ok(())
    }
}

/// Write a single byte.
#[inline]
pub fn put_byte<B: BufMut>(buf: &mut B, value: u8) {
    buf.put_u8(value);
}

/// Write a boolean as one byte.
#[inline]
pub fn put_bool<B: BufMut>(buf: &mut B, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Write a 2-byte Big Endian integer.
#[inline]
pub fn put_int<B: BufMut>(buf: &mut B, value: u16) {
    buf.put_u16(value);
}

/// Write a length-prefixed, NUL-terminated string.
///
/// Strings longer than 65534 bytes are a caller error.
pub fn put_string<B: BufMut>(buf: &mut B, value: &str) {
    debug_assert!(value.len() < usize::from(NULL_STRING_LENGTH));
    put_int(buf, value.len() as u16);
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

fn truncated(field: &str) -> MhStreamError {
    MhStreamError::Protocol(format!("Truncated {field} field"))
}

/// Read a single byte.
pub fn get_byte<B: Buf>(buf: &mut B) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated("byte"));
    }
    Ok(buf.get_u8())
}

/// Read a boolean byte (any non-zero value is true).
pub fn get_bool<B: Buf>(buf: &mut B) -> Result<bool> {
    Ok(get_byte(buf)? != 0)
}

/// Read a 2-byte Big Endian integer.
pub fn get_int<B: Buf>(buf: &mut B) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(truncated("int"));
    }
    Ok(buf.get_u16())
}

/// Read a length-prefixed, NUL-terminated string.
///
/// A null string decodes as empty.
pub fn get_string<B: Buf>(buf: &mut B) -> Result<String> {
    let length = get_int(buf)?;
    if length == NULL_STRING_LENGTH {
        return Ok(String::new());
    }
    read_string_body(buf, usize::from(length))
}

fn read_string_body<B: Buf>(buf: &mut B, length: usize) -> Result<String> {
    // Payload plus NUL terminator.
    if buf.remaining() < length + 1 {
        return Err(truncated("string"));
    }
    let raw = buf.copy_to_bytes(length);
    buf.advance(1);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Response header names sent as `0xA0xx` codes.
const RESPONSE_HEADER_NAMES: [&str; 11] = [
    "Content-Type",
    "Content-Language",
    "Content-Length",
    "Date",
    "Last-Modified",
    "Location",
    "Set-Cookie",
    "Set-Cookie2",
    "Servlet-Engine",
    "Status",
    "WWW-Authenticate",
];

/// Request header names that may be sent as `0xA0xx` codes.
const REQUEST_HEADER_NAMES: [&str; 14] = [
    "accept",
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "authorization",
    "connection",
    "content-type",
    "content-length",
    "cookie",
    "cookie2",
    "host",
    "pragma",
    "referer",
    "user-agent",
];

/// Method codes, index + 1 is the code.
const METHODS: [&str; 27] = [
    "OPTIONS",
    "GET",
    "HEAD",
    "POST",
    "PUT",
    "DELETE",
    "TRACE",
    "PROPFIND",
    "PROPPATCH",
    "MKCOL",
    "COPY",
    "MOVE",
    "LOCK",
    "UNLOCK",
    "ACL",
    "REPORT",
    "VERSION-CONTROL",
    "CHECKIN",
    "CHECKOUT",
    "UNCHECKOUT",
    "SEARCH",
    "MKWORKSPACE",
    "UPDATE",
    "LABEL",
    "MERGE",
    "BASELINE-CONTROL",
    "MKACTIVITY",
];

/// Look up a coded response header name.
pub fn response_header_name(code: u16) -> Option<&'static str> {
    if code & 0xFF00 != 0xA000 {
        return None;
    }
    let index = usize::from(code & 0x00FF);
    index
        .checked_sub(1)
        .and_then(|i| RESPONSE_HEADER_NAMES.get(i))
        .copied()
}

/// Code for a request header name, if it has one (case-insensitive).
pub fn request_header_code(name: &str) -> Option<u16> {
    REQUEST_HEADER_NAMES
        .iter()
        .position(|known| known.eq_ignore_ascii_case(name))
        .map(|i| 0xA000 | (i as u16 + 1))
}

/// Code for an HTTP method, if it has one.
pub fn method_code(method: &str) -> Option<u8> {
    METHODS
        .iter()
        .position(|known| *known == method)
        .map(|i| i as u8 + 1)
}

/// Write a request header name, coded when possible.
pub fn put_header_name<B: BufMut>(buf: &mut B, name: &str) {
    match request_header_code(name) {
        Some(code) => put_int(buf, code),
        None => put_string(buf, name),
    }
}

/// Read a response header name, which is either a code or a string.
pub fn get_header_name<B: Buf>(buf: &mut B) -> Result<String> {
    let value = get_int(buf)?;
    if value & 0xFF00 == 0xA000 {
        return response_header_name(value)
            .map(str::to_string)
            .ok_or_else(|| {
                MhStreamError::Protocol(format!("Unknown response header code {value:#06x}"))
            });
    }
    if value == NULL_STRING_LENGTH {
        return Ok(String::new());
    }
    read_string_body(buf, usize::from(value))
}

/// Wrap a payload into a packet with the given magic.
pub fn wrap_packet(magic: [u8; 2], payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() + PACKET_HEADER_SIZE <= MAX_PACKET_SIZE);
    let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + payload.len());
    buf.put_slice(&PacketHeader::new(magic, payload.len() as u16).encode());
    buf.put_slice(payload);
    buf.freeze()
}

/// Wrap a payload into a backend → client packet.
pub fn response_packet(payload: &[u8]) -> Bytes {
    wrap_packet(RESPONSE_MAGIC, payload)
}

/// Envelope and chunk length preceding a request body chunk.
///
/// An empty chunk encodes as the bare 4-byte end-of-body packet.
pub fn body_chunk_header(chunk_len: usize) -> Bytes {
    debug_assert!(chunk_len <= MAX_BODY_CHUNK);
    if chunk_len == 0 {
        return Bytes::copy_from_slice(&PacketHeader::new(REQUEST_MAGIC, 0).encode());
    }
    let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + 2);
    buf.put_slice(&PacketHeader::new(REQUEST_MAGIC, chunk_len as u16 + 2).encode());
    put_int(&mut buf, chunk_len as u16);
    buf.freeze()
}
