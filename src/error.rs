//! Error types for mh-stream.

use thiserror::Error;

/// Main error type for all protocol operations.
#[derive(Debug, Error)]
pub enum MhStreamError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol violation (bad magic, truncated field, unexpected frame, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The 9-byte length header of a length-prefixed request is not numeric.
    #[error("Invalid length header: {0}")]
    InvalidLengthHeader(String),

    /// Declared payload does not fit the configured maximum entity size.
    #[error("Invalid length header: payload of {length} bytes exceeds maximum {max}")]
    PayloadTooLarge { length: usize, max: usize },

    /// More bytes were read for a single request than allowed.
    #[error("Request too large: read {read} bytes, maximum {max}")]
    RequestTooLarge { read: usize, max: usize },

    /// A request was issued while the previous exchange is still open.
    #[error("Exchange already in progress")]
    ExchangeInProgress,

    /// A stream operation was attempted with no exchange in flight.
    #[error("No active exchange")]
    NoActiveExchange,

    /// The connection is closed or no longer accepts new work.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl MhStreamError {
    /// Whether this error must tear down the connection.
    ///
    /// Only the synchronous lifecycle rejections leave the connection usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            MhStreamError::ExchangeInProgress | MhStreamError::NoActiveExchange
        )
    }
}

/// Result type alias using MhStreamError.
pub type Result<T> = std::result::Result<T, MhStreamError>;
