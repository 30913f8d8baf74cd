//! Length-prefixed request framer.
//!
//! A request is a 9-byte decimal ASCII length header followed by the body:
//!
//! ```text
//! ┌───────────┬──────────────────────────────────────────┐
//! │ "000000013"│ <TQ-FUNCTION>name<...                   │
//! │ 9 bytes   │ payload                                   │
//! └───────────┴──────────────────────────────────────────┘
//! ```
//!
//! The parser walks [`ParsePhase`] strictly forward and may be fed any
//! number of partial reads. It never consumes a byte of the next request,
//! so the parsed request is the same however the input is split.
//!
//! A short payload may open a function name without closing it, as in
//! `"000000013<TQ-FUNCTION>foo<"`. The name then runs past the declared
//! payload up to its `<` terminator, and those bytes belong to this request.
//!
//! # Example
//!
//! ```
//! use mh_stream::server::{ParseState, RequestParser};
//!
//! let parser = RequestParser::new();
//! let mut state = ParseState::new(1024);
//! let mut input: &[u8] = b"000000013<TQ-FUNCTION>foo<";
//! parser.parse(&mut input, &mut state).unwrap();
//!
//! let request = state.take_request().unwrap();
//! assert_eq!(request.path, "/tq/foo");
//! assert!(input.is_empty());
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::{MhStreamError, Result};

/// Size of the decimal length header.
pub const LENGTH_HEADER_SIZE: usize = 9;

/// Marker preceding the function name in the body.
pub const FUNCTION_START_TAG: &str = "<TQ-FUNCTION>";

/// Byte terminating the function name.
pub const FUNCTION_END_DELIMITER: u8 = b'<';

/// Function name used when the body carries none.
pub const FUNCTION_NAME_NOT_SPECIFIED: &str = "__TQ_FUNCTION_NAME_NOT_SPECIFIED__";

const FIRST_SCAN_WINDOW: usize = 200;
const NEXT_SCAN_WINDOW: usize = 100;

/// Phases of a single request parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParsePhase {
    Start,
    ReadLengthHeader,
    ReadBody,
    /// The payload opened a function name that ends after it.
    ReadFunctionName,
    ConstructRequest,
    Complete,
}

/// A fully parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: &'static str,
    pub scheme: &'static str,
    pub protocol: &'static str,
    /// `/tq/{function_name}`.
    pub path: String,
    pub function_name: String,
    /// Declared payload length.
    pub content_length: usize,
    pub headers: Vec<(String, String)>,
    /// The declared payload bytes.
    pub body: Bytes,
}

/// Scratch state of one request parse.
#[derive(Debug)]
pub struct ParseState {
    phase: ParsePhase,
    length_header: [u8; LENGTH_HEADER_SIZE],
    header_filled: usize,
    payload_length: usize,
    scratch: BytesMut,
    function_name: Option<String>,
    capacity: usize,
}

impl ParseState {
    /// Create a state whose scratch buffer holds at most `max_entity_size` bytes.
    pub fn new(max_entity_size: usize) -> Self {
        Self {
            phase: ParsePhase::Start,
            length_header: [0; LENGTH_HEADER_SIZE],
            header_filled: 0,
            payload_length: 0,
            scratch: BytesMut::new(),
            function_name: None,
            capacity: max_entity_size,
        }
    }

    /// Clear everything before the next request.
    pub fn reset(&mut self) {
        self.phase = ParsePhase::Start;
        self.header_filled = 0;
        self.payload_length = 0;
        self.scratch.clear();
        self.function_name = None;
    }

    /// Current phase.
    pub fn phase(&self) -> ParsePhase {
        self.phase
    }

    /// Whether a full request has been parsed.
    pub fn is_complete(&self) -> bool {
        self.phase == ParsePhase::Complete
    }

    /// Whether no byte of the next request has been seen.
    pub fn is_empty(&self) -> bool {
        self.phase == ParsePhase::Start
    }

    /// Payload length declared by the length header.
    pub fn payload_length(&self) -> usize {
        self.payload_length
    }

    /// Bytes of this request buffered after the length header.
    pub fn offset(&self) -> usize {
        self.scratch.len()
    }

    /// Function name discovered so far.
    pub fn function_name(&self) -> Option<&str> {
        self.function_name.as_deref()
    }

    /// Request path derived from the discovered name.
    pub fn request_path(&self) -> Option<String> {
        self.function_name.as_deref().map(request_path)
    }

    /// Take the completed request and reset for the next one.
    pub fn take_request(&mut self) -> Option<ParsedRequest> {
        if !self.is_complete() {
            return None;
        }
        let body = self.scratch.split_to(self.payload_length).freeze();
        let function_name = self
            .function_name
            .take()
            .unwrap_or_else(|| FUNCTION_NAME_NOT_SPECIFIED.to_string());

        let request = ParsedRequest {
            method: "POST",
            scheme: "http",
            protocol: "HTTP/1.1",
            path: request_path(&function_name),
            function_name,
            content_length: self.payload_length,
            headers: vec![
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("Accept".to_string(), "application/xml".to_string()),
            ],
            body,
        };
        self.reset();
        Some(request)
    }
}

fn request_path(function_name: &str) -> String {
    format!("/tq/{function_name}")
}

/// Stateless driver advancing a [`ParseState`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestParser;

impl RequestParser {
    pub fn new() -> Self {
        Self
    }

    /// Consume bytes from `buf`, advancing `state` as far as possible.
    ///
    /// Only bytes of the current request are consumed; everything after it
    /// stays in `buf`.
    ///
    /// # Errors
    ///
    /// - `InvalidLengthHeader` if the header is not decimal digits
    /// - `PayloadTooLarge` if the declared length exceeds the scratch capacity
    pub fn parse<B: Buf>(&self, buf: &mut B, state: &mut ParseState) -> Result<()> {
        loop {
            match state.phase {
                ParsePhase::Start => {
                    if !buf.has_remaining() {
                        return Ok(());
                    }
                    state.phase = ParsePhase::ReadLengthHeader;
                }

                ParsePhase::ReadLengthHeader => {
                    let n = (LENGTH_HEADER_SIZE - state.header_filled).min(buf.remaining());
                    buf.copy_to_slice(&mut state.length_header[state.header_filled..][..n]);
                    state.header_filled += n;
                    if state.header_filled < LENGTH_HEADER_SIZE {
                        return Ok(());
                    }

                    let length = parse_length_header(&state.length_header)?;
                    if length > state.capacity {
                        return Err(MhStreamError::PayloadTooLarge {
                            length,
                            max: state.capacity,
                        });
                    }
                    debug!("Request declares {} payload bytes", length);
                    state.payload_length = length;
                    state.phase = ParsePhase::ReadBody;
                }

                ParsePhase::ReadBody => {
                    let n = (state.payload_length - state.scratch.len()).min(buf.remaining());
                    if n > 0 {
                        state.scratch.put((&mut *buf).take(n));
                        state.function_name =
                            Some(find_function_name(&state.scratch, state.payload_length));
                    }
                    if state.scratch.len() < state.payload_length {
                        return Ok(());
                    }
                    state.phase = if name_continues_past_payload(&state.scratch) {
                        ParsePhase::ReadFunctionName
                    } else {
                        ParsePhase::ConstructRequest
                    };
                }

                ParsePhase::ReadFunctionName => {
                    let room = state.capacity - state.scratch.len();
                    if room == 0 {
                        debug!("Function name runs past the maximum entity size");
                        state.phase = ParsePhase::ConstructRequest;
                        continue;
                    }
                    if !buf.has_remaining() {
                        return Ok(());
                    }

                    let chunk = buf.chunk();
                    let limit = chunk.len().min(room);
                    let (n, terminated) = match chunk[..limit]
                        .iter()
                        .position(|&b| b == FUNCTION_END_DELIMITER)
                    {
                        Some(i) => (i + 1, true),
                        None => (limit, false),
                    };
                    state.scratch.extend_from_slice(&chunk[..n]);
                    buf.advance(n);
                    if terminated {
                        state.phase = ParsePhase::ConstructRequest;
                    }
                }

                ParsePhase::ConstructRequest => {
                    let name = find_function_name(&state.scratch, state.payload_length);
                    debug!("Request for function {}", name);
                    state.function_name = Some(name);
                    state.phase = ParsePhase::Complete;
                }

                ParsePhase::Complete => return Ok(()),
            }
        }
    }
}

fn parse_length_header(header: &[u8; LENGTH_HEADER_SIZE]) -> Result<usize> {
    if !header.iter().all(u8::is_ascii_digit) {
        return Err(MhStreamError::InvalidLengthHeader(format!(
            "Header not numeric: {:?}",
            String::from_utf8_lossy(header)
        )));
    }
    Ok(header
        .iter()
        .fold(0usize, |acc, d| acc * 10 + usize::from(d - b'0')))
}

/// Whether a scanned payload opens the start tag but holds no terminator after it.
fn name_continues_past_payload(payload: &[u8]) -> bool {
    let tag = FUNCTION_START_TAG.as_bytes();
    if payload.len() >= 2 * tag.len() {
        return false;
    }
    find(payload, tag)
        .is_some_and(|i| !payload[i + tag.len()..].contains(&FUNCTION_END_DELIMITER))
}

/// Find the function name in the bytes of one request.
///
/// Only scanned when the payload is shorter than twice the start tag;
/// larger payloads use the unspecified name.
pub fn find_function_name(body: &[u8], payload_length: usize) -> String {
    let tag = FUNCTION_START_TAG.as_bytes();
    if payload_length >= 2 * tag.len() {
        return FUNCTION_NAME_NOT_SPECIFIED.to_string();
    }

    let mut end = 0;
    let mut window = FIRST_SCAN_WINDOW;
    let mut name_start = None;
    let mut scanned = 0;
    while end < body.len() {
        // A tag may straddle the previous window edge.
        let from = end.saturating_sub(tag.len() - 1);
        end = (end + window).min(body.len());
        window = NEXT_SCAN_WINDOW;

        if name_start.is_none() {
            name_start = find(&body[from..end], tag).map(|i| from + i + tag.len());
            scanned = name_start.unwrap_or(end);
        }
        let Some(start) = name_start else {
            continue;
        };
        if let Some(len) = body[scanned..end]
            .iter()
            .position(|&b| b == FUNCTION_END_DELIMITER)
        {
            let stop = scanned + len;
            return String::from_utf8_lossy(&body[start..stop]).into_owned();
        }
        scanned = end;
    }
    FUNCTION_NAME_NOT_SPECIFIED.to_string()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
