//! Client channel: one request/response exchange at a time over a
//! persistent connection.
//!
//! The channel is sans-IO at its core. Inbound bytes go in through
//! [`ClientChannel::on_read`], outbound frames come out of
//! [`ClientChannel::poll_frames`], and what happened is reported through
//! [`ClientChannel::poll_event`]. [`ClientChannel::read_from`] and
//! [`ClientChannel::flush`] drive the same calls over tokio I/O.
//!
//! # Lifecycle
//!
//! ```text
//!            send_request
//!   Idle ───────────────► Active{sink, source}
//!    ▲                     │              │
//!    │          sink done  │              │ source done
//!    │                     ▼              ▼
//!    ├──── AwaitingResponse{source}   Discarding{sink}
//!    │      (source done)                 │ (sink done)
//!    └────────────────────────────────────┘
//! ```
//!
//! A non-persistent end-of-response or peer EOF moves the connection from
//! `Persistent` to `NonPersistent` for good; no new request is accepted.
//!
//! # Example
//!
//! ```
//! use mh_stream::channel::{ChannelEvent, ClientChannel};
//! use mh_stream::config::ChannelConfig;
//! use mh_stream::protocol::{response_packet, ExchangeContext, RequestHead};
//!
//! let mut channel = ClientChannel::new(ChannelConfig::default());
//! channel
//!     .send_request(&RequestHead::new("GET", "/ping"), &ExchangeContext::default(), None)
//!     .unwrap()
//!     .close();
//! let frames = channel.poll_frames();
//! assert_eq!(frames.len(), 1);
//!
//! channel.on_read(&response_packet(&[4, 0, 200, 0, 2, b'O', b'K', 0, 0, 0])).unwrap();
//! channel.on_read(&response_packet(&[5, 1])).unwrap();
//! assert_eq!(channel.poll_event(), Some(ChannelEvent::RequestComplete));
//! assert_eq!(channel.poll_event(), Some(ChannelEvent::ResponseStarted { status: 200 }));
//! ```

use std::collections::VecDeque;
use std::io;

use bytes::Buf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, error, warn};

use crate::config::ChannelConfig;
use crate::error::{MhStreamError, Result};
use crate::framed::{FrameReceiver, FramedProtocol};
use crate::pool::{BufferPool, PooledBuffer};
use crate::protocol::{
    encode_forward_request, ExchangeContext, FrameClassifier, FrameHeader, RequestHead,
};
use crate::scheduler::{FrameQueues, SinkFrame};
use crate::stream::{FinishListener, RequestSink, ResponseSource};
use crate::writer::{write_batch, OutboundFrame};

/// Something observable that happened on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Response headers arrived.
    ResponseStarted { status: u16 },
    /// A body chunk of `length` bytes is ready to read.
    Data { length: usize },
    /// The end-of-response frame arrived.
    ResponseFinished { persistent: bool },
    /// The backend asked for `length` more request body bytes.
    CreditGranted { length: usize },
    /// The request side finished.
    RequestComplete,
    /// Both sides finished; a new request may be sent.
    ExchangeComplete,
    /// The channel closed.
    Closed,
}

/// Whether the connection may carry further exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    Persistent,
    /// Terminal: the last frame was sent and received.
    NonPersistent,
}

#[derive(Debug, Default)]
enum ExchangeState {
    #[default]
    Idle,
    Active {
        sink: RequestSink,
        source: Option<ResponseSource>,
    },
    /// Request side done; the response may not have started yet.
    AwaitingResponse { source: Option<ResponseSource> },
    /// Response done before the request body; writes are swallowed.
    Discarding { sink: RequestSink },
}

impl ExchangeState {
    fn sink_mut(&mut self) -> Option<&mut RequestSink> {
        match self {
            ExchangeState::Active { sink, .. } | ExchangeState::Discarding { sink } => Some(sink),
            _ => None,
        }
    }

    fn source(&self) -> Option<&ResponseSource> {
        match self {
            ExchangeState::Active { source, .. } | ExchangeState::AwaitingResponse { source } => {
                source.as_ref()
            }
            _ => None,
        }
    }

    fn source_mut(&mut self) -> Option<&mut ResponseSource> {
        match self {
            ExchangeState::Active { source, .. } | ExchangeState::AwaitingResponse { source } => {
                source.as_mut()
            }
            _ => None,
        }
    }
}

/// Client side of the multiplexed frame protocol.
#[derive(Debug)]
pub struct ClientChannel {
    config: ChannelConfig,
    pool: BufferPool,
    classifier: FrameClassifier,
    receiver: FrameReceiver<FrameHeader>,
    queues: FrameQueues,
    state: ExchangeState,
    persistence: Persistence,
    transport_open: bool,
    events: VecDeque<ChannelEvent>,
}

impl ClientChannel {
    /// Create a channel with its own buffer pool.
    pub fn new(config: ChannelConfig) -> Self {
        let pool = BufferPool::new(config.buffer_size, config.pool_capacity);
        Self::with_pool(config, pool)
    }

    /// Create a channel drawing receive buffers from `pool`.
    pub fn with_pool(config: ChannelConfig, pool: BufferPool) -> Self {
        Self {
            config,
            pool,
            classifier: FrameClassifier::new(),
            receiver: FrameReceiver::new(),
            queues: FrameQueues::new(),
            state: ExchangeState::Idle,
            persistence: Persistence::Persistent,
            transport_open: true,
            events: VecDeque::new(),
        }
    }

    /// Start a new exchange and return its sink for body writes.
    ///
    /// # Errors
    ///
    /// - `ConnectionClosed` if the channel no longer accepts requests
    /// - `ExchangeInProgress` if the previous sink or source is still open
    pub fn send_request(
        &mut self,
        head: &RequestHead,
        context: &ExchangeContext,
        on_finish: Option<FinishListener>,
    ) -> Result<&mut RequestSink> {
        if !self.is_open() {
            return Err(MhStreamError::ConnectionClosed);
        }
        if !matches!(self.state, ExchangeState::Idle) {
            return Err(MhStreamError::ExchangeInProgress);
        }

        let packet = encode_forward_request(head, context)?;
        debug!("Sending request {} {}", head.method, head.path);

        let sink = RequestSink::new(
            packet,
            self.config.initial_body_credit,
            self.config.max_body_chunk,
            on_finish,
        );
        self.state = ExchangeState::Active { sink, source: None };
        self.state.sink_mut().ok_or(MhStreamError::NoActiveExchange)
    }

    /// Sink of the current exchange, while the request side is open.
    pub fn sink_mut(&mut self) -> Option<&mut RequestSink> {
        self.state.sink_mut()
    }

    /// Source of the current exchange, once response headers arrived.
    pub fn source(&self) -> Option<&ResponseSource> {
        self.state.source()
    }

    /// Write request body bytes to the current sink.
    pub fn write_body(&mut self, data: &[u8]) -> Result<usize> {
        self.state
            .sink_mut()
            .ok_or(MhStreamError::NoActiveExchange)?
            .write(data)
    }

    /// Close the request body of the current sink.
    pub fn close_body(&mut self) -> Result<()> {
        self.state
            .sink_mut()
            .ok_or(MhStreamError::NoActiveExchange)?
            .close();
        Ok(())
    }

    /// Feed bytes read from the transport.
    ///
    /// Returns how many frames were delivered. A protocol error closes the
    /// channel before it is returned.
    pub fn on_read(&mut self, data: &[u8]) -> Result<usize> {
        if !self.transport_open {
            return Err(MhStreamError::ConnectionClosed);
        }
        let mut data = data;
        let pool = self.pool.clone();
        let mut receiver = std::mem::take(&mut self.receiver);
        let result = receiver.receive(self, &pool, &mut data);
        self.receiver = receiver;

        if let Err(e) = &result {
            warn!("Closing channel after protocol error: {}", e);
            self.close();
        }
        result
    }

    /// Take every frame that may be written now.
    pub fn poll_frames(&mut self) -> Vec<OutboundFrame> {
        if !self.transport_open {
            return Vec::new();
        }
        if let Some(sink) = self.state.sink_mut() {
            for frame in sink.take_frames() {
                self.queues.push(frame);
            }
        }

        let mut frames = Vec::with_capacity(self.queues.pending_len());
        while let Some(frame) = self.queues.pop_eligible() {
            frames.push(frame.into_outbound());
        }
        self.check_sink_done();
        frames
    }

    /// Read response body bytes into `dst`.
    ///
    /// Returns 0 when nothing is buffered or no response is open.
    pub fn read_response(&mut self, dst: &mut [u8]) -> usize {
        let Some(source) = self.state.source_mut() else {
            return 0;
        };
        let n = source.read(dst);
        self.check_source_done();
        n
    }

    /// Next pending event.
    pub fn poll_event(&mut self) -> Option<ChannelEvent> {
        self.events.pop_front()
    }

    /// Write all eligible frames to `writer`.
    ///
    /// A write failure breaks the channel.
    pub async fn flush<W>(&mut self, writer: &mut W) -> Result<usize>
    where
        W: AsyncWrite + Unpin,
    {
        let frames = self.poll_frames();
        if frames.is_empty() {
            return Ok(0);
        }
        match write_batch(writer, &frames).await {
            Ok(n) => Ok(n),
            Err(e) => {
                let returned = io::Error::new(e.kind(), e.to_string());
                self.handle_broken_sink_channel(e);
                Err(returned.into())
            }
        }
    }

    /// Read once from `reader` and process the bytes.
    ///
    /// Returns the number of bytes read; 0 means the peer closed.
    pub async fn read_from<R>(&mut self, reader: &mut R) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        if !self.transport_open {
            return Err(MhStreamError::ConnectionClosed);
        }
        let mut buf = self.pool.allocate();
        buf.reserve(self.pool.buffer_size());

        match reader.read_buf(&mut *buf).await {
            Ok(0) => {
                self.last_data_read();
                Ok(0)
            }
            Ok(n) => {
                self.on_read(&buf[..n])?;
                Ok(n)
            }
            Err(e) => {
                let returned = io::Error::new(e.kind(), e.to_string());
                self.handle_broken_source_channel(e);
                Err(returned.into())
            }
        }
    }

    /// Whether the channel accepts new requests.
    pub fn is_open(&self) -> bool {
        self.transport_open && self.persistence == Persistence::Persistent
    }

    /// Current persistence state.
    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    /// Whether no exchange is in flight.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, ExchangeState::Idle)
    }

    /// The pool receive buffers come from.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// The peer closed its side.
    ///
    /// A response that already finished stays readable; anything still
    /// open is closed.
    pub fn last_data_read(&mut self) {
        debug!("Peer closed the connection");
        self.persistence = Persistence::NonPersistent;
        let response_complete = matches!(
            &self.state,
            ExchangeState::AwaitingResponse { source: Some(source) } if source.is_finished()
        );
        if response_complete {
            self.shutdown_transport();
        } else {
            self.close();
        }
    }

    /// Close the channel and every open stream.
    pub fn close(&mut self) {
        self.close_sub_channels();
        self.shutdown_transport();
    }

    fn shutdown_transport(&mut self) {
        self.queues.clear();
        self.classifier.reset();
        self.receiver.clear();
        if self.transport_open {
            debug!("Client channel closed");
            self.transport_open = false;
            self.events.push_back(ChannelEvent::Closed);
        }
    }

    fn check_sink_done(&mut self) {
        let done = match &self.state {
            ExchangeState::Active { sink, .. } | ExchangeState::Discarding { sink } => {
                sink.is_closed() && !sink.has_frames() && self.queues.is_empty()
            }
            _ => false,
        };
        if done {
            self.sink_done();
        }
    }

    fn check_source_done(&mut self) {
        if self.state.source().is_some_and(ResponseSource::is_drained) {
            self.source_done();
        }
    }

    fn sink_done(&mut self) {
        self.state = match std::mem::take(&mut self.state) {
            ExchangeState::Active { mut sink, source } => {
                sink.finish();
                self.events.push_back(ChannelEvent::RequestComplete);
                ExchangeState::AwaitingResponse { source }
            }
            ExchangeState::Discarding { mut sink } => {
                sink.finish();
                self.events.push_back(ChannelEvent::RequestComplete);
                self.events.push_back(ChannelEvent::ExchangeComplete);
                ExchangeState::Idle
            }
            other => other,
        };
    }

    fn source_done(&mut self) {
        self.state = match std::mem::take(&mut self.state) {
            ExchangeState::Active { mut sink, .. } => {
                debug!("Response finished before request body, discarding");
                sink.start_discard();
                self.queues.drop_where(SinkFrame::is_body);
                ExchangeState::Discarding { sink }
            }
            ExchangeState::AwaitingResponse { .. } => {
                self.events.push_back(ChannelEvent::ExchangeComplete);
                ExchangeState::Idle
            }
            other => other,
        };
        self.check_sink_done();
    }
}

impl FramedProtocol for ClientChannel {
    type Header = FrameHeader;
    type Source = ResponseSource;

    fn parse_frame<B: Buf>(&mut self, data: &mut B) -> Result<Option<FrameHeader>> {
        let header = self.classifier.parse(data)?;
        if let Some(FrameHeader::EndResponse { persistent: false }) = &header {
            debug!("Backend ended response without reuse");
            self.persistence = Persistence::NonPersistent;
        }
        Ok(header)
    }

    fn create_channel(
        &mut self,
        header: FrameHeader,
        frame_data: Option<PooledBuffer>,
    ) -> Result<Option<&mut ResponseSource>> {
        if header.associates_source() && self.state.source().is_none() {
            return Err(MhStreamError::Protocol(format!(
                "{} before response headers",
                frame_name(&header)
            )));
        }

        match header {
            FrameHeader::SendHeaders {
                status,
                reason,
                headers,
            } => {
                let slot = match &mut self.state {
                    ExchangeState::Active { source, .. }
                    | ExchangeState::AwaitingResponse { source }
                        if source.is_none() =>
                    {
                        source
                    }
                    _ => {
                        return Err(MhStreamError::Protocol(
                            "Unexpected response headers".to_string(),
                        ))
                    }
                };
                debug!("Response started with status {}", status);
                self.events
                    .push_back(ChannelEvent::ResponseStarted { status });
                Ok(Some(slot.insert(ResponseSource::new(status, reason, headers))))
            }

            FrameHeader::RequestBodyChunk { length } => {
                let Some(sink) = self.state.sink_mut() else {
                    debug!("Ignoring body chunk request with no open request body");
                    return Ok(None);
                };
                sink.credit(length);
                self.queues.recalculate_held();
                self.events.push_back(ChannelEvent::CreditGranted { length });
                Ok(None)
            }

            FrameHeader::SendBodyChunk { .. } => {
                let data = frame_data.ok_or_else(|| {
                    MhStreamError::Protocol("Body chunk without frame data".to_string())
                })?;
                let Some(source) = self.state.source_mut() else {
                    return Ok(None);
                };
                let length = source.push_chunk(data);
                self.events.push_back(ChannelEvent::Data { length });
                Ok(self.state.source_mut())
            }

            FrameHeader::EndResponse { persistent } => {
                let Some(source) = self.state.source_mut() else {
                    return Ok(None);
                };
                source.mark_finished();
                self.events
                    .push_back(ChannelEvent::ResponseFinished { persistent });
                self.check_source_done();
                Ok(self.state.source_mut())
            }
        }
    }

    fn is_last_frame_sent(&self) -> bool {
        self.persistence == Persistence::NonPersistent
    }

    fn is_last_frame_received(&self) -> bool {
        self.persistence == Persistence::NonPersistent
    }

    fn handle_broken_source_channel(&mut self, err: io::Error) {
        error!("Response stream broken: {}", err);
        self.close();
    }

    fn handle_broken_sink_channel(&mut self, err: io::Error) {
        error!("Request stream broken: {}", err);
        self.close();
    }

    fn close_sub_channels(&mut self) {
        self.state = ExchangeState::Idle;
        self.queues.clear();
    }
}

fn frame_name(header: &FrameHeader) -> &'static str {
    match header {
        FrameHeader::SendHeaders { .. } => "Response headers",
        FrameHeader::RequestBodyChunk { .. } => "Body chunk request",
        FrameHeader::SendBodyChunk { .. } => "Body chunk",
        FrameHeader::EndResponse { .. } => "End of response",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire_format::{put_int, put_string};
    use crate::protocol::{prefix, response_packet};
    use bytes::{BufMut, Bytes, BytesMut};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn headers_packet(status: u16) -> Bytes {
        let mut payload = BytesMut::new();
        payload.put_u8(prefix::SEND_HEADERS);
        put_int(&mut payload, status);
        put_string(&mut payload, "OK");
        put_int(&mut payload, 1);
        put_int(&mut payload, 0xA001);
        put_string(&mut payload, "text/plain");
        response_packet(&payload)
    }

    fn body_packet(data: &[u8]) -> Bytes {
        let mut payload = BytesMut::new();
        payload.put_u8(prefix::SEND_BODY_CHUNK);
        put_int(&mut payload, data.len() as u16);
        payload.put_slice(data);
        payload.put_u8(0);
        response_packet(&payload)
    }

    fn end_packet(persistent: bool) -> Bytes {
        response_packet(&[prefix::END_RESPONSE, u8::from(persistent)])
    }

    fn credit_packet(length: u16) -> Bytes {
        let mut payload = BytesMut::new();
        payload.put_u8(prefix::GET_BODY_CHUNK);
        put_int(&mut payload, length);
        response_packet(&payload)
    }

    fn start(channel: &mut ClientChannel) -> &mut RequestSink {
        channel
            .send_request(
                &RequestHead::new("POST", "/tq/run"),
                &ExchangeContext::default(),
                None,
            )
            .unwrap()
    }

    fn events(channel: &mut ClientChannel) -> Vec<ChannelEvent> {
        std::iter::from_fn(|| channel.poll_event()).collect()
    }

    #[test]
    fn test_second_request_rejected_while_open() {
        let mut channel = ClientChannel::new(ChannelConfig::default());
        start(&mut channel);

        let err = channel
            .send_request(
                &RequestHead::new("GET", "/"),
                &ExchangeContext::default(),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, MhStreamError::ExchangeInProgress));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_full_exchange_returns_to_idle() {
        let mut channel = ClientChannel::new(ChannelConfig::default());
        start(&mut channel).close();
        assert_eq!(channel.poll_frames().len(), 1);

        channel.on_read(&headers_packet(200)).unwrap();
        channel.on_read(&body_packet(b"hello")).unwrap();
        channel.on_read(&end_packet(true)).unwrap();
        assert_eq!(channel.source().unwrap().header("content-type"), Some("text/plain"));

        let mut buf = [0u8; 16];
        assert_eq!(channel.read_response(&mut buf), 5);
        assert_eq!(&buf[..5], b"hello");
        assert!(channel.is_idle());
        assert!(channel.is_open());

        assert_eq!(
            events(&mut channel),
            vec![
                ChannelEvent::RequestComplete,
                ChannelEvent::ResponseStarted { status: 200 },
                ChannelEvent::Data { length: 5 },
                ChannelEvent::ResponseFinished { persistent: true },
                ChannelEvent::ExchangeComplete,
            ]
        );

        // Fresh sink and source for the next exchange.
        let sink = start(&mut channel);
        assert!(!sink.is_closed());
        assert!(channel.source().is_none());
    }

    #[test]
    fn test_non_persistent_end_closes_for_new_work() {
        let mut channel = ClientChannel::new(ChannelConfig::default());
        start(&mut channel).close();
        channel.poll_frames();

        channel.on_read(&headers_packet(200)).unwrap();
        channel.on_read(&end_packet(false)).unwrap();

        assert!(!channel.is_open());
        assert!(channel.is_last_frame_sent());
        assert!(channel.is_last_frame_received());
        assert_eq!(channel.persistence(), Persistence::NonPersistent);

        let err = start_result(&mut channel);
        assert!(matches!(err, Err(MhStreamError::ConnectionClosed)));
    }

    fn start_result(channel: &mut ClientChannel) -> Result<()> {
        channel
            .send_request(
                &RequestHead::new("GET", "/"),
                &ExchangeContext::default(),
                None,
            )
            .map(|_| ())
    }

    #[test]
    fn test_body_waits_for_credit() {
        let config = ChannelConfig::default().initial_body_credit(0);
        let mut channel = ClientChannel::new(config);
        let sink = start(&mut channel);
        sink.write(b"payload").unwrap();
        sink.close();

        // Only the forward request goes out.
        assert_eq!(channel.poll_frames().len(), 1);
        assert!(channel.poll_frames().is_empty());

        channel.on_read(&credit_packet(7)).unwrap();
        let frames = channel.poll_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].header[..], &[0x12, 0x34, 0x00, 0x09, 0x00, 0x07]);
        assert_eq!(&frames[0].payload[..], b"payload");
        assert_eq!(&frames[1].header[..], &[0x12, 0x34, 0x00, 0x00]);
        assert!(events(&mut channel).contains(&ChannelEvent::RequestComplete));
    }

    #[test]
    fn test_early_response_discards_request_body() {
        let config = ChannelConfig::default().initial_body_credit(0);
        let mut channel = ClientChannel::new(config);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let sink = channel
            .send_request(
                &RequestHead::new("POST", "/upload"),
                &ExchangeContext::default(),
                Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
            )
            .unwrap();
        sink.write(b"never sent").unwrap();
        channel.poll_frames();

        channel.on_read(&headers_packet(413)).unwrap();
        channel.on_read(&end_packet(true)).unwrap();

        let sink = channel.sink_mut().unwrap();
        assert!(sink.is_discarding());
        assert_eq!(sink.write(b"more").unwrap(), 4);
        sink.close();
        assert!(channel.poll_frames().is_empty());

        assert!(channel.is_idle());
        assert!(finished.load(Ordering::SeqCst));
        assert!(channel.is_open());
    }

    #[test]
    fn test_credit_without_sink_is_ignored() {
        let mut channel = ClientChannel::new(ChannelConfig::default());
        start(&mut channel).close();
        channel.poll_frames();

        assert_eq!(channel.on_read(&credit_packet(100)).unwrap(), 1);
        assert!(channel.is_open());
    }

    #[test]
    fn test_body_before_headers_is_protocol_error() {
        let mut channel = ClientChannel::new(ChannelConfig::default());
        start(&mut channel).close();

        let err = channel.on_read(&body_packet(b"x")).unwrap_err();
        assert!(matches!(err, MhStreamError::Protocol(_)));
        assert!(!channel.is_open());
        assert!(channel.is_idle());
        assert_eq!(channel.pool().outstanding(), 0);
    }

    #[test]
    fn test_end_before_headers_is_protocol_error() {
        let mut channel = ClientChannel::new(ChannelConfig::default());
        start(&mut channel).close();
        channel.poll_frames();

        let err = channel.on_read(&end_packet(true)).unwrap_err();
        assert!(err.to_string().contains("End of response before response headers"));
        assert!(!channel.is_open());
    }

    #[test]
    fn test_split_reads_deliver_same_response() {
        let mut channel = ClientChannel::new(ChannelConfig::default());
        start(&mut channel).close();
        channel.poll_frames();

        let mut wire = BytesMut::new();
        wire.put_slice(&headers_packet(200));
        wire.put_slice(&body_packet(b"split body"));
        wire.put_slice(&end_packet(true));

        for byte in wire.chunks(3) {
            channel.on_read(byte).unwrap();
        }

        let mut buf = [0u8; 32];
        assert_eq!(channel.read_response(&mut buf), 10);
        assert_eq!(&buf[..10], b"split body");
        assert!(channel.is_idle());
        assert_eq!(channel.pool().outstanding(), 0);
    }

    #[test]
    fn test_broken_source_closes_everything() {
        let mut channel = ClientChannel::new(ChannelConfig::default());
        start(&mut channel).close();
        channel.poll_frames();
        channel.on_read(&headers_packet(200)).unwrap();
        channel.on_read(&body_packet(b"held")).unwrap();
        assert_eq!(channel.pool().outstanding(), 1);

        channel.handle_broken_source_channel(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(!channel.is_open());
        assert!(channel.is_idle());
        assert_eq!(channel.pool().outstanding(), 0);
        assert!(events(&mut channel).contains(&ChannelEvent::Closed));
        assert!(matches!(
            channel.on_read(&end_packet(true)),
            Err(MhStreamError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_eof_keeps_finished_response_readable() {
        let mut channel = ClientChannel::new(ChannelConfig::default());
        start(&mut channel).close();
        channel.poll_frames();
        channel.on_read(&headers_packet(200)).unwrap();
        channel.on_read(&body_packet(b"tail")).unwrap();
        channel.on_read(&end_packet(false)).unwrap();

        channel.last_data_read();
        assert!(!channel.is_open());

        let mut buf = [0u8; 8];
        assert_eq!(channel.read_response(&mut buf), 4);
        assert!(channel.is_idle());
    }

    #[test]
    fn test_eof_mid_response_drops_streams() {
        let mut channel = ClientChannel::new(ChannelConfig::default());
        start(&mut channel).close();
        channel.poll_frames();
        channel.on_read(&headers_packet(200)).unwrap();
        channel.on_read(&body_packet(b"partial")).unwrap();

        channel.last_data_read();
        assert!(channel.is_idle());
        assert_eq!(channel.pool().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_flush_and_read_over_duplex() {
        let (mut client, mut backend) = tokio::io::duplex(1024);
        let mut channel = ClientChannel::new(ChannelConfig::default());
        start(&mut channel).close();

        let written = channel.flush(&mut client).await.unwrap();
        let mut request = vec![0u8; written];
        backend.read_exact(&mut request).await.unwrap();
        assert_eq!(&request[..2], &[0x12, 0x34]);

        use tokio::io::AsyncWriteExt;
        backend.write_all(&headers_packet(204)).await.unwrap();
        backend.write_all(&end_packet(true)).await.unwrap();
        while !channel.is_idle() {
            assert!(channel.read_from(&mut client).await.unwrap() > 0);
        }
        assert_eq!(channel.pool().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_read_eof_closes_idle_channel() {
        let (mut client, backend) = tokio::io::duplex(64);
        drop(backend);
        let mut channel = ClientChannel::new(ChannelConfig::default());

        assert_eq!(channel.read_from(&mut client).await.unwrap(), 0);
        assert!(!channel.is_open());
    }
}
