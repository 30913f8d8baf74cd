//! Server side of the length-prefixed request protocol.
//!
//! - [`RequestParser`] / [`ParseState`]: incremental framer for one request
//! - [`ServerConnection`]: async read loop with pooled buffers and leftover handling

mod connection;
mod parser;

pub use connection::ServerConnection;
pub use parser::{
    find_function_name, ParsePhase, ParseState, ParsedRequest, RequestParser,
    FUNCTION_END_DELIMITER, FUNCTION_NAME_NOT_SPECIFIED, FUNCTION_START_TAG, LENGTH_HEADER_SIZE,
};
