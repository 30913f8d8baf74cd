//! Typed frame headers and the forward-request packet.
//!
//! Inbound packets are classified into a [`FrameHeader`] carrying only the
//! fields each packet type needs. Outbound requests start with a single
//! forward-request packet built by [`encode_forward_request`].
//!
//! # Example
//!
//! ```
//! use mh_stream::protocol::{encode_forward_request, ExchangeContext, RequestHead};
//!
//! let head = RequestHead::new("POST", "/tq/run?x=1").header("Content-Length", "4");
//! let packet = encode_forward_request(&head, &ExchangeContext::default()).unwrap();
//!
//! assert_eq!(&packet[..2], &[0x12, 0x34]);
//! assert_eq!(packet[4], 2); // forward-request prefix
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{
    method_code, prefix, put_bool, put_byte, put_header_name, put_int, put_string,
    PacketHeader, ATTRIBUTES_END, ATTRIBUTE_QUERY_STRING, ATTRIBUTE_STORED_METHOD,
    MAX_PACKET_SIZE, METHOD_STORED, PACKET_HEADER_SIZE, REQUEST_MAGIC,
};
use crate::error::{MhStreamError, Result};

/// A classified inbound frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameHeader {
    /// Status line and headers opening a response.
    SendHeaders {
        status: u16,
        reason: String,
        headers: Vec<(String, String)>,
    },
    /// The backend grants credit for `length` more request body bytes.
    RequestBodyChunk { length: usize },
    /// A response body chunk of `length` bytes follows (plus a NUL).
    SendBodyChunk { length: usize },
    /// The response is complete; `persistent` tells if the connection may be reused.
    EndResponse { persistent: bool },
}

impl FrameHeader {
    /// Number of frame-data bytes following the decoded header.
    ///
    /// Only body chunks carry data: the chunk plus its trailing NUL.
    pub fn frame_length(&self) -> usize {
        match self {
            FrameHeader::SendBodyChunk { length } => length + 1,
            _ => 0,
        }
    }

    /// Whether this frame belongs to the response already in progress.
    pub fn associates_source(&self) -> bool {
        matches!(
            self,
            FrameHeader::SendBodyChunk { .. } | FrameHeader::EndResponse { .. }
        )
    }
}

/// Request line and headers of an outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request URI, optionally with a `?query` suffix.
    pub path: String,
    pub protocol: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Create a request head speaking `HTTP/1.1` with no headers.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            protocol: "HTTP/1.1".to_string(),
            headers: Vec::new(),
        }
    }

    /// Set the protocol string.
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Append a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Connection-level facts forwarded with each request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeContext {
    pub remote_addr: String,
    pub remote_host: String,
    pub server_name: String,
    pub server_port: u16,
    pub is_ssl: bool,
    /// Extra request attributes as `(code, value)` pairs.
    pub attributes: Vec<(u8, String)>,
}

impl Default for ExchangeContext {
    fn default() -> Self {
        Self {
            remote_addr: "127.0.0.1".to_string(),
            remote_host: "localhost".to_string(),
            server_name: "localhost".to_string(),
            server_port: 80,
            is_ssl: false,
            attributes: Vec::new(),
        }
    }
}

/// Build the forward-request packet opening an exchange.
///
/// Fails if the encoded packet does not fit the maximum packet size.
pub fn encode_forward_request(head: &RequestHead, context: &ExchangeContext) -> Result<Bytes> {
    let (uri, query) = match head.path.split_once('?') {
        Some((uri, query)) => (uri, Some(query)),
        None => (head.path.as_str(), None),
    };
    let stored_method = method_code(&head.method).is_none();

    let mut body = BytesMut::with_capacity(256);
    put_byte(&mut body, prefix::FORWARD_REQUEST);
    put_byte(&mut body, method_code(&head.method).unwrap_or(METHOD_STORED));
    put_string(&mut body, &head.protocol);
    put_string(&mut body, uri);
    put_string(&mut body, &context.remote_addr);
    put_string(&mut body, &context.remote_host);
    put_string(&mut body, &context.server_name);
    put_int(&mut body, context.server_port);
    put_bool(&mut body, context.is_ssl);

    put_int(&mut body, head.headers.len() as u16);
    for (name, value) in &head.headers {
        put_header_name(&mut body, name);
        put_string(&mut body, value);
    }

    if let Some(query) = query {
        put_byte(&mut body, ATTRIBUTE_QUERY_STRING);
        put_string(&mut body, query);
    }
    if stored_method {
        put_byte(&mut body, ATTRIBUTE_STORED_METHOD);
        put_string(&mut body, &head.method);
    }
    for (code, value) in &context.attributes {
        put_byte(&mut body, *code);
        put_string(&mut body, value);
    }
    put_byte(&mut body, ATTRIBUTES_END);

    if body.len() + PACKET_HEADER_SIZE > MAX_PACKET_SIZE {
        return Err(MhStreamError::Protocol(format!(
            "Forward request of {} bytes exceeds maximum packet size {}",
            body.len() + PACKET_HEADER_SIZE,
            MAX_PACKET_SIZE
        )));
    }

    let mut packet = BytesMut::with_capacity(PACKET_HEADER_SIZE + body.len());
    packet.put_slice(&PacketHeader::new(REQUEST_MAGIC, body.len() as u16).encode());
    packet.put_slice(&body);
    Ok(packet.freeze())
}
