//! Request sink and response source of one exchange.
//!
//! A [`RequestSink`] turns body writes into body frames that draw on its
//! flow window; the channel moves those frames into its scheduling queues.
//! A [`ResponseSource`] owns the pooled buffers of received body chunks
//! until the reader drains them.

use std::collections::VecDeque;
use std::fmt;

use bytes::{Buf, Bytes};

use crate::error::{MhStreamError, Result};
use crate::flow::FlowWindow;
use crate::pool::PooledBuffer;
use crate::protocol::MAX_BODY_CHUNK;
use crate::scheduler::SinkFrame;

/// Callback fired once the request side of an exchange completes.
pub type FinishListener = Box<dyn FnOnce() + Send>;

/// Outbound side of an exchange.
pub struct RequestSink {
    window: FlowWindow,
    max_chunk: usize,
    outbox: VecDeque<SinkFrame>,
    body_written: bool,
    closed: bool,
    discarding: bool,
    on_finish: Option<FinishListener>,
}

impl RequestSink {
    /// Create a sink whose first frame is the given forward-request packet.
    pub(crate) fn new(
        forward_request: Bytes,
        initial_credit: usize,
        max_chunk: usize,
        on_finish: Option<FinishListener>,
    ) -> Self {
        let mut outbox = VecDeque::new();
        outbox.push_back(SinkFrame::control(forward_request));
        Self {
            window: FlowWindow::new(initial_credit),
            max_chunk: max_chunk.clamp(1, MAX_BODY_CHUNK),
            outbox,
            body_written: false,
            closed: false,
            discarding: false,
            on_finish,
        }
    }

    /// Queue body bytes, split into chunks of at most the configured size.
    ///
    /// No chunk exceeds what one data packet can carry.
    ///
    /// In discard mode the bytes are accepted and dropped.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(MhStreamError::Protocol(
                "Write after request body was closed".to_string(),
            ));
        }
        if self.discarding || data.is_empty() {
            return Ok(data.len());
        }
        for chunk in data.chunks(self.max_chunk) {
            self.outbox.push_back(SinkFrame::body(
                self.window.clone(),
                Bytes::copy_from_slice(chunk),
            ));
        }
        self.body_written = true;
        Ok(data.len())
    }

    /// Finish the request body.
    ///
    /// A body that carried data is terminated with an empty body packet.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.body_written && !self.discarding {
            self.outbox
                .push_back(SinkFrame::body(self.window.clone(), Bytes::new()));
        }
    }

    /// Stop transmitting: the peer already ended the exchange.
    pub fn start_discard(&mut self) {
        self.discarding = true;
        self.outbox.clear();
    }

    /// Grant `amount` bytes of body credit.
    pub fn credit(&self, amount: usize) {
        self.window.grant(amount);
    }

    /// The flow window shared with this sink's frames.
    pub fn window(&self) -> &FlowWindow {
        &self.window
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the sink swallows writes.
    pub fn is_discarding(&self) -> bool {
        self.discarding
    }

    /// Frames produced since the last call.
    pub(crate) fn take_frames(&mut self) -> impl Iterator<Item = SinkFrame> + '_ {
        self.outbox.drain(..)
    }

    /// Whether frames are waiting to be handed to the channel.
    pub(crate) fn has_frames(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Fire the finish listener, at most once.
    pub(crate) fn finish(&mut self) {
        if let Some(listener) = self.on_finish.take() {
            listener();
        }
    }
}

impl fmt::Debug for RequestSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSink")
            .field("credit", &self.window.available())
            .field("queued", &self.outbox.len())
            .field("closed", &self.closed)
            .field("discarding", &self.discarding)
            .finish()
    }
}

/// Inbound side of an exchange.
#[derive(Debug)]
pub struct ResponseSource {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
    chunks: VecDeque<PooledBuffer>,
    finished: bool,
}

impl ResponseSource {
    pub(crate) fn new(status: u16, reason: String, headers: Vec<(String, String)>) -> Self {
        Self {
            status,
            reason,
            headers,
            chunks: VecDeque::new(),
            finished: false,
        }
    }

    /// Response status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Response reason phrase.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Response headers in arrival order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First header value with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Take ownership of a body chunk buffer.
    ///
    /// The buffer holds the whole frame; its trailing NUL is stripped.
    pub(crate) fn push_chunk(&mut self, mut frame_data: PooledBuffer) -> usize {
        if frame_data.last() == Some(&0) {
            let len = frame_data.len() - 1;
            frame_data.truncate(len);
        }
        let len = frame_data.len();
        if len > 0 {
            self.chunks.push_back(frame_data);
        }
        len
    }

    pub(crate) fn mark_finished(&mut self) {
        self.finished = true;
    }

    /// Copy buffered body bytes into `dst`.
    ///
    /// Buffers are returned to their pool as soon as they are drained.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let n = front.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&front[..n]);
            front.advance(n);
            copied += n;
            if front.is_empty() {
                self.chunks.pop_front();
            }
        }
        copied
    }

    /// Body bytes buffered and not yet read.
    pub fn available(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    /// Whether the end-of-response frame arrived.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the response is finished and every byte was read.
    pub fn is_drained(&self) -> bool {
        self.finished && self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sink(credit: usize, max_chunk: usize) -> RequestSink {
        RequestSink::new(Bytes::from_static(b"fwd"), credit, max_chunk, None)
    }

    #[test]
    fn test_sink_starts_with_forward_request() {
        let mut sink = sink(0, 10);
        let frames: Vec<_> = sink.take_frames().collect();
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].is_body());
        assert!(!sink.has_frames());
    }

    #[test]
    fn test_write_splits_into_chunks() {
        let mut sink = sink(0, 4);
        sink.take_frames().for_each(drop);

        assert_eq!(sink.write(b"0123456789").unwrap(), 10);
        let sizes: Vec<_> = sink.take_frames().map(|f| f.payload().len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_oversized_chunk_setting_capped_at_packet_limit() {
        let mut sink = sink(100_000, 20_000);
        sink.take_frames().for_each(drop);

        sink.write(&vec![b'x'; 20_000]).unwrap();
        let sizes: Vec<_> = sink.take_frames().map(|f| f.payload().len()).collect();
        assert_eq!(sizes, vec![MAX_BODY_CHUNK, MAX_BODY_CHUNK, 20_000 - 2 * MAX_BODY_CHUNK]);
    }

    #[test]
    fn test_close_appends_end_of_body_only_after_data() {
        let mut empty = sink(0, 4);
        empty.close();
        assert_eq!(empty.take_frames().count(), 1);

        let mut with_body = sink(0, 4);
        with_body.write(b"ab").unwrap();
        with_body.close();
        let frames: Vec<_> = with_body.take_frames().collect();
        assert_eq!(frames.len(), 3);
        assert!(frames[2].payload().is_empty());
    }

    #[test]
    fn test_write_after_close_fails() {
        let mut sink = sink(0, 4);
        sink.close();
        assert!(sink.write(b"late").is_err());
        sink.close();
    }

    #[test]
    fn test_discard_swallows_writes() {
        let mut sink = sink(0, 4);
        sink.write(b"abcd").unwrap();
        sink.start_discard();
        assert!(!sink.has_frames());

        assert_eq!(sink.write(b"more").unwrap(), 4);
        sink.close();
        assert!(!sink.has_frames());
        assert!(sink.is_discarding());
    }

    #[test]
    fn test_finish_listener_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut sink = RequestSink::new(
            Bytes::new(),
            0,
            4,
            Some(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })),
        );
        sink.finish();
        sink.finish();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_source_strips_nul_and_reads_across_chunks() {
        let pool = BufferPool::new(16, 4);
        let mut source = ResponseSource::new(200, "OK".into(), vec![]);

        let mut a = pool.allocate();
        a.extend_from_slice(b"hel\0");
        let mut b = pool.allocate();
        b.extend_from_slice(b"lo\0");
        assert_eq!(source.push_chunk(a), 3);
        assert_eq!(source.push_chunk(b), 2);
        assert_eq!(source.available(), 5);

        let mut dst = [0u8; 4];
        assert_eq!(source.read(&mut dst), 4);
        assert_eq!(&dst, b"hell");
        assert_eq!(pool.outstanding(), 1);

        assert_eq!(source.read(&mut dst), 1);
        assert_eq!(dst[0], b'o');
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_source_empty_chunk_released_immediately() {
        let pool = BufferPool::new(16, 4);
        let mut source = ResponseSource::new(204, "No Content".into(), vec![]);
        let mut buf = pool.allocate();
        buf.extend_from_slice(b"\0");
        assert_eq!(source.push_chunk(buf), 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_source_drained_requires_finish() {
        let mut source = ResponseSource::new(
            200,
            "OK".into(),
            vec![("Content-Type".into(), "text/plain".into())],
        );
        assert!(!source.is_drained());
        source.mark_finished();
        assert!(source.is_drained());
        assert_eq!(source.header("content-type"), Some("text/plain"));
        assert_eq!(source.status(), 200);
        assert_eq!(source.reason(), "OK");
    }

    #[test]
    fn test_dropped_source_releases_buffers() {
        let pool = BufferPool::new(16, 4);
        let mut source = ResponseSource::new(200, "OK".into(), vec![]);
        let mut buf = pool.allocate();
        buf.extend_from_slice(b"data\0");
        source.push_chunk(buf);
        assert_eq!(pool.outstanding(), 1);
        drop(source);
        assert_eq!(pool.outstanding(), 0);
    }
}
