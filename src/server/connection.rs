//! Server connection speaking the length-prefixed request protocol.
//!
//! Reads are made into pooled buffers. The parser stops at the end of each
//! request, so whatever is left of a read buffer stays with the connection
//! as its extra bytes and is consumed first by the next request. Back-to-back
//! requests in one read are neither lost nor counted twice.

use bytes::Buf;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, warn};

use crate::config::ServerConfig;
use crate::error::{MhStreamError, Result};
use crate::pool::{BufferPool, PooledBuffer};

use super::parser::{ParseState, ParsedRequest, RequestParser};

/// One accepted connection.
#[derive(Debug)]
pub struct ServerConnection<T> {
    io: T,
    config: ServerConfig,
    pool: BufferPool,
    parser: RequestParser,
    state: ParseState,
    extra_bytes: Option<PooledBuffer>,
    /// Bytes consumed for the request being parsed.
    read: usize,
    in_exchange: bool,
    open: bool,
}

impl<T: AsyncRead + Unpin> ServerConnection<T> {
    /// Wrap a transport with its own buffer pool.
    pub fn new(io: T, config: ServerConfig) -> Self {
        let pool = BufferPool::new(config.buffer_size, config.pool_capacity);
        Self::with_pool(io, config, pool)
    }

    /// Wrap a transport drawing read buffers from `pool`.
    pub fn with_pool(io: T, config: ServerConfig, pool: BufferPool) -> Self {
        Self {
            io,
            state: ParseState::new(config.max_entity_size),
            config,
            pool,
            parser: RequestParser::new(),
            extra_bytes: None,
            read: 0,
            in_exchange: false,
            open: true,
        }
    }

    /// Read until one request is parsed.
    ///
    /// Returns `Ok(None)` if the peer closed before sending any byte of a
    /// new request. Any error closes the connection.
    ///
    /// # Errors
    ///
    /// - `ExchangeInProgress` if the previous request was not completed
    /// - `RequestTooLarge` if more than `max_request_size` bytes were read
    /// - `Protocol` if the peer closed mid-request
    /// - framing errors from the parser
    pub async fn read_request(&mut self) -> Result<Option<ParsedRequest>> {
        if !self.open {
            return Err(MhStreamError::ConnectionClosed);
        }
        if self.in_exchange {
            return Err(MhStreamError::ExchangeInProgress);
        }

        loop {
            let mut buf = match self.extra_bytes.take() {
                Some(extra) => extra,
                None => match self.fill().await? {
                    Some(buf) => buf,
                    None => return Ok(None),
                },
            };

            let before = buf.remaining();
            if let Err(e) = self.parser.parse(&mut *buf, &mut self.state) {
                warn!("Closing connection after bad request: {}", e);
                self.close();
                return Err(e);
            }
            self.read += before - buf.remaining();
            if self.read > self.config.max_request_size {
                error!(
                    "Request of {} bytes exceeds maximum {}",
                    self.read, self.config.max_request_size
                );
                self.close();
                return Err(MhStreamError::RequestTooLarge {
                    read: self.read,
                    max: self.config.max_request_size,
                });
            }

            if buf.has_remaining() {
                self.extra_bytes = Some(buf);
            }

            if let Some(request) = self.state.take_request() {
                debug!("Parsed request for {}", request.path);
                self.read = 0;
                self.in_exchange = true;
                return Ok(Some(request));
            }

            if self.extra_bytes.is_some() {
                self.close();
                return Err(MhStreamError::Protocol(
                    "Parser stalled with unread bytes".to_string(),
                ));
            }
        }
    }

    /// Finish the current exchange.
    ///
    /// A persistent exchange readies the connection for the next request;
    /// otherwise the connection closes.
    pub fn exchange_complete(&mut self, persistent: bool) {
        self.in_exchange = false;
        if persistent {
            self.state.reset();
            self.read = 0;
        } else {
            self.close();
        }
    }

    /// Whether the connection accepts further requests.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Close the connection, releasing held buffers.
    pub fn close(&mut self) {
        if self.open {
            debug!("Closing server connection");
        }
        self.open = false;
        self.in_exchange = false;
        self.extra_bytes = None;
        self.state.reset();
    }

    /// Number of leftover bytes kept for the next request.
    pub fn extra_bytes_len(&self) -> usize {
        self.extra_bytes.as_ref().map_or(0, |b| b.len())
    }

    /// The pool read buffers come from.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Mutable access to the transport, e.g. to write a response.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.io
    }

    /// Unwrap the transport.
    pub fn into_inner(self) -> T {
        self.io
    }

    /// Read once into a fresh pooled buffer.
    ///
    /// `None` means a clean EOF between requests.
    async fn fill(&mut self) -> Result<Option<PooledBuffer>> {
        let mut buf = self.pool.allocate();
        buf.reserve(self.pool.buffer_size());

        let n = match self.io.read_buf(&mut *buf).await {
            Ok(n) => n,
            Err(e) => {
                error!("Read failed: {}", e);
                self.close();
                return Err(e.into());
            }
        };

        if n == 0 {
            let idle = self.state.is_empty();
            self.close();
            if idle {
                debug!("Peer closed connection between requests");
                return Ok(None);
            }
            return Err(MhStreamError::Protocol(
                "Connection closed mid-request".to_string(),
            ));
        }
        Ok(Some(buf))
    }
}
