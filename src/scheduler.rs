//! Flow-control scheduling of outbound frames.
//!
//! Outbound frames live in two ordered queues:
//! - `pending`: eligible to be written, header already generated
//! - `held`: body frames waiting for credit, header cleared
//!
//! Where a frame goes is decided by a [`FramePriority`] policy when the
//! frame is queued and again whenever credit may have changed. The client
//! policy ([`ClientFramePriority`]) only holds body frames; control frames
//! are always eligible.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use mh_stream::flow::FlowWindow;
//! use mh_stream::scheduler::{FrameQueues, SinkFrame};
//!
//! let window = FlowWindow::new(0);
//! let mut queues = FrameQueues::new();
//! queues.push(SinkFrame::body(window.clone(), Bytes::from_static(b"data")));
//! assert_eq!(queues.held_len(), 1);
//!
//! window.grant(4);
//! queues.recalculate_held();
//! assert!(queues.pop_eligible().is_some());
//! ```

use std::collections::VecDeque;

use bytes::Bytes;

use crate::flow::FlowWindow;
use crate::protocol::body_chunk_header;
use crate::writer::OutboundFrame;

#[derive(Debug)]
enum FrameKind {
    /// Fully encoded packet, never subject to credit.
    Control,
    /// Request body data drawing on a flow window.
    Body { window: FlowWindow },
}

/// An outbound frame with a lazily generated header.
#[derive(Debug)]
pub struct SinkFrame {
    kind: FrameKind,
    header: Option<Bytes>,
    payload: Bytes,
}

impl SinkFrame {
    /// A complete control packet.
    pub fn control(packet: Bytes) -> Self {
        Self {
            kind: FrameKind::Control,
            header: Some(Bytes::new()),
            payload: packet,
        }
    }

    /// A body data packet carrying `payload`.
    ///
    /// An empty payload encodes as the end-of-body packet.
    pub fn body(window: FlowWindow, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Body { window },
            header: None,
            payload,
        }
    }

    /// Whether this frame carries request body data.
    pub fn is_body(&self) -> bool {
        matches!(self.kind, FrameKind::Body { .. })
    }

    /// Flow window of a body frame.
    pub fn window(&self) -> Option<&FlowWindow> {
        match &self.kind {
            FrameKind::Body { window } => Some(window),
            FrameKind::Control => None,
        }
    }

    /// Payload bytes (without header).
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Whether a header has been generated.
    pub fn has_header(&self) -> bool {
        self.header.is_some()
    }

    /// Generate the header, consuming credit for body frames.
    ///
    /// Returns `false` if the window cannot cover the payload.
    pub fn generate_header(&mut self) -> bool {
        if self.header.is_some() {
            return true;
        }
        match &self.kind {
            FrameKind::Control => true,
            FrameKind::Body { window } => {
                if !window.try_consume(self.payload.len()) {
                    return false;
                }
                self.header = Some(body_chunk_header(self.payload.len()));
                true
            }
        }
    }

    /// Drop a generated body header, refunding its credit.
    pub fn clear_header(&mut self) {
        if let FrameKind::Body { window } = &self.kind {
            if self.header.take().is_some() {
                window.refund(self.payload.len());
            }
        }
    }

    /// Convert into wire parts. The header must have been generated.
    pub fn into_outbound(self) -> OutboundFrame {
        debug_assert!(self.header.is_some());
        OutboundFrame::new(self.header.unwrap_or_default(), self.payload)
    }
}

/// Policy deciding whether a frame is eligible or held back.
pub trait FramePriority<F> {
    /// Offer a new frame.
    ///
    /// Eligible frames are appended to `pending`; a frame that must wait is
    /// handed back to the caller for the held queue.
    fn insert_frame(&self, frame: F, pending: &mut VecDeque<F>) -> Option<F>;

    /// Re-examine held frames after a frame was added or credit changed.
    fn frame_added(&self, pending: &mut VecDeque<F>, held: &mut VecDeque<F>);
}

/// Client policy: body frames wait for credit, everything else goes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientFramePriority;

impl FramePriority<SinkFrame> for ClientFramePriority {
    fn insert_frame(
        &self,
        mut frame: SinkFrame,
        pending: &mut VecDeque<SinkFrame>,
    ) -> Option<SinkFrame> {
        if frame.generate_header() {
            pending.push_back(frame);
            return None;
        }
        // Regenerated once the window grows.
        frame.clear_header();
        Some(frame)
    }

    fn frame_added(&self, pending: &mut VecDeque<SinkFrame>, held: &mut VecDeque<SinkFrame>) {
        let mut blocked: Vec<FlowWindow> = Vec::new();
        let mut still_held = VecDeque::with_capacity(held.len());

        for mut frame in held.drain(..) {
            // Body bytes behind a stalled frame of the same window keep their order.
            let behind_stall = frame
                .window()
                .is_some_and(|w| blocked.iter().any(|b| b.same_window(w)));

            if !behind_stall && frame.generate_header() {
                pending.push_back(frame);
                continue;
            }

            frame.clear_header();
            if let Some(window) = frame.window() {
                if !behind_stall {
                    blocked.push(window.clone());
                }
            }
            still_held.push_back(frame);
        }

        *held = still_held;
    }
}

/// Pending and held frame queues for one connection.
#[derive(Debug, Default)]
pub struct FrameQueues<P = ClientFramePriority> {
    priority: P,
    pending: VecDeque<SinkFrame>,
    held: VecDeque<SinkFrame>,
}

impl FrameQueues<ClientFramePriority> {
    /// Create queues driven by the client policy.
    pub fn new() -> Self {
        Self::with_priority(ClientFramePriority)
    }
}

impl<P: FramePriority<SinkFrame>> FrameQueues<P> {
    /// Create queues driven by a custom policy.
    pub fn with_priority(priority: P) -> Self {
        Self {
            priority,
            pending: VecDeque::new(),
            held: VecDeque::new(),
        }
    }

    /// Queue a frame.
    ///
    /// While anything is held a new frame queues behind it.
    pub fn push(&mut self, frame: SinkFrame) {
        if self.held.is_empty() {
            if let Some(frame) = self.priority.insert_frame(frame, &mut self.pending) {
                self.held.push_back(frame);
            }
        } else {
            self.held.push_back(frame);
        }
        self.priority.frame_added(&mut self.pending, &mut self.held);
    }

    /// Re-run the held scan after credit changed.
    pub fn recalculate_held(&mut self) {
        if !self.held.is_empty() {
            self.priority.frame_added(&mut self.pending, &mut self.held);
        }
    }

    /// Next frame ready to be written.
    pub fn pop_eligible(&mut self) -> Option<SinkFrame> {
        self.pending.pop_front()
    }

    /// Drop every frame matching `predicate`, refunding credit.
    ///
    /// Returns how many frames were dropped.
    pub fn drop_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&SinkFrame) -> bool,
    {
        let before = self.len();
        for queue in [&mut self.pending, &mut self.held] {
            queue.retain_mut(|frame| {
                if predicate(frame) {
                    frame.clear_header();
                    false
                } else {
                    true
                }
            });
        }
        before - self.len()
    }

    /// Drop all frames.
    pub fn clear(&mut self) {
        self.drop_where(|_| true);
    }

    /// Number of eligible frames.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of held frames.
    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    /// Total queued frames.
    pub fn len(&self) -> usize {
        self.pending.len() + self.held.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.held.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(window: &FlowWindow, data: &'static [u8]) -> SinkFrame {
        SinkFrame::body(window.clone(), Bytes::from_static(data))
    }

    fn drain_payloads(queues: &mut FrameQueues) -> Vec<Bytes> {
        std::iter::from_fn(|| queues.pop_eligible())
            .map(|f| f.payload().clone())
            .collect()
    }

    #[test]
    fn test_generate_header_consumes_credit() {
        let window = FlowWindow::new(10);
        let mut frame = body(&window, b"hello");
        assert!(frame.generate_header());
        assert_eq!(window.available(), 5);

        // Idempotent once generated.
        assert!(frame.generate_header());
        assert_eq!(window.available(), 5);

        frame.clear_header();
        assert!(!frame.has_header());
        assert_eq!(window.available(), 10);
    }

    #[test]
    fn test_control_frames_always_eligible() {
        let mut queues = FrameQueues::new();
        queues.push(SinkFrame::control(Bytes::from_static(b"packet")));
        assert_eq!(queues.pending_len(), 1);

        let out = queues.pop_eligible().unwrap().into_outbound();
        assert!(out.header.is_empty());
        assert_eq!(&out.payload[..], b"packet");
    }

    #[test]
    fn test_body_frame_held_without_credit() {
        let window = FlowWindow::new(2);
        let mut queues = FrameQueues::new();
        queues.push(body(&window, b"abc"));

        assert_eq!(queues.pending_len(), 0);
        assert_eq!(queues.held_len(), 1);
        assert_eq!(window.available(), 2);
    }

    #[test]
    fn test_grant_releases_held_in_order() {
        let window = FlowWindow::new(0);
        let mut queues = FrameQueues::new();
        queues.push(body(&window, b"one"));
        queues.push(body(&window, b"two"));
        queues.push(body(&window, b"three"));
        assert_eq!(queues.held_len(), 3);

        window.grant(6);
        queues.recalculate_held();
        assert_eq!(
            drain_payloads(&mut queues),
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
        assert_eq!(queues.held_len(), 1);

        window.grant(5);
        queues.recalculate_held();
        assert_eq!(drain_payloads(&mut queues), vec![Bytes::from_static(b"three")]);
        assert_eq!(window.available(), 0);
    }

    #[test]
    fn test_small_frame_waits_behind_stalled_frame() {
        let window = FlowWindow::new(0);
        let mut queues = FrameQueues::new();
        queues.push(body(&window, b"large"));
        queues.push(body(&window, b"s"));

        window.grant(1);
        queues.recalculate_held();
        assert_eq!(queues.pending_len(), 0);
        assert_eq!(queues.held_len(), 2);
        assert_eq!(window.available(), 1);
    }

    #[test]
    fn test_independent_windows_do_not_block() {
        let stalled = FlowWindow::new(0);
        let open = FlowWindow::new(10);
        let mut queues = FrameQueues::new();
        queues.push(body(&stalled, b"wait"));
        queues.push(body(&open, b"go"));

        assert_eq!(drain_payloads(&mut queues), vec![Bytes::from_static(b"go")]);
        assert_eq!(queues.held_len(), 1);
    }

    #[test]
    fn test_control_frame_behind_held_body() {
        let window = FlowWindow::new(0);
        let mut queues = FrameQueues::new();
        queues.push(body(&window, b"body"));
        queues.push(SinkFrame::control(Bytes::from_static(b"ctl")));

        assert_eq!(drain_payloads(&mut queues), vec![Bytes::from_static(b"ctl")]);
    }

    #[test]
    fn test_end_of_body_waits_for_data() {
        let window = FlowWindow::new(0);
        let mut queues = FrameQueues::new();
        queues.push(body(&window, b"data"));
        queues.push(SinkFrame::body(window.clone(), Bytes::new()));
        assert_eq!(queues.held_len(), 2);

        window.grant(4);
        queues.recalculate_held();
        let frames: Vec<_> = std::iter::from_fn(|| queues.pop_eligible()).collect();
        assert_eq!(frames.len(), 2);
        let end = frames.into_iter().nth(1).unwrap().into_outbound();
        assert_eq!(&end.header[..], &[0x12, 0x34, 0x00, 0x00]);
    }

    #[test]
    fn test_drop_where_refunds_credit() {
        let window = FlowWindow::new(3);
        let mut queues = FrameQueues::new();
        queues.push(body(&window, b"abc"));
        queues.push(body(&window, b"def"));
        assert_eq!(window.available(), 0);

        let dropped = queues.drop_where(SinkFrame::is_body);
        assert_eq!(dropped, 2);
        assert!(queues.is_empty());
        assert_eq!(window.available(), 3);
    }
}
