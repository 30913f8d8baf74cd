//! # mh-stream
//!
//! Frame-protocol core for mh-stream connections.
//!
//! This crate carries two independent protocols:
//!
//! - **Client channel** ([`channel`]): AJP-style packets between a client
//!   and a backend. One request/response exchange at a time, request body
//!   chunks gated by backend-granted credit, connection reuse decided by
//!   the end-of-response frame.
//! - **Request framing** ([`server`]): a 9-byte decimal length header
//!   followed by the payload, parsed incrementally from pooled read buffers.
//!
//! ## Architecture
//!
//! ```text
//!   bytes in ─► FrameClassifier ─► FrameReceiver ─► ClientChannel ─► ResponseSource
//!                                                        │
//!   bytes out ◄─ write_batch ◄─ FrameQueues ◄── RequestSink (FlowWindow credit)
//! ```
//!
//! Receive buffers come from a shared [`BufferPool`]; every buffer handed
//! to a stream is returned when the stream drains or closes.
//!
//! ## Example
//!
//! ```
//! use mh_stream::{ChannelConfig, ClientChannel};
//! use mh_stream::protocol::{ExchangeContext, RequestHead};
//!
//! let mut channel = ClientChannel::new(ChannelConfig::default());
//! let sink = channel
//!     .send_request(&RequestHead::new("POST", "/tq/run"), &ExchangeContext::default(), None)
//!     .unwrap();
//! sink.write(b"body").unwrap();
//! sink.close();
//!
//! // Forward request, body chunk and end-of-body marker.
//! assert_eq!(channel.poll_frames().len(), 3);
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod flow;
pub mod framed;
pub mod pool;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod stream;
pub mod writer;

pub use channel::{ChannelEvent, ClientChannel, Persistence};
pub use config::{ChannelConfig, ServerConfig};
pub use error::{MhStreamError, Result};
pub use pool::{BufferPool, PooledBuffer};
pub use server::{ParsedRequest, ServerConnection};
pub use stream::{FinishListener, RequestSink, ResponseSource};
