//! Flow-control credit for request body data.
//!
//! The backend grants credit with body-chunk requests; every outbound body
//! frame must consume credit covering its payload before it gets a header.
//! A [`FlowWindow`] is shared between a request sink and the frames it
//! produced, so a grant made through any clone is visible to all of them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared credit counter for one request body.
#[derive(Debug, Clone, Default)]
pub struct FlowWindow {
    credit: Arc<AtomicUsize>,
}

impl FlowWindow {
    /// Create a window with `initial` bytes of credit.
    pub fn new(initial: usize) -> Self {
        Self {
            credit: Arc::new(AtomicUsize::new(initial)),
        }
    }

    /// Add credit for `amount` bytes.
    #[inline]
    pub fn grant(&self, amount: usize) {
        self.credit.fetch_add(amount, Ordering::AcqRel);
    }

    /// Take `amount` bytes of credit if available.
    ///
    /// Returns `false` and leaves the window untouched otherwise.
    pub fn try_consume(&self, amount: usize) -> bool {
        self.credit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(amount)
            })
            .is_ok()
    }

    /// Return credit taken by a header that was cleared before sending.
    #[inline]
    pub fn refund(&self, amount: usize) {
        self.grant(amount);
    }

    /// Credit currently available.
    #[inline]
    pub fn available(&self) -> usize {
        self.credit.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same window.
    #[inline]
    pub fn same_window(&self, other: &FlowWindow) -> bool {
        Arc::ptr_eq(&self.credit, &other.credit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_within_credit() {
        let window = FlowWindow::new(10);
        assert!(window.try_consume(4));
        assert_eq!(window.available(), 6);
        assert!(window.try_consume(6));
        assert_eq!(window.available(), 0);
    }

    #[test]
    fn test_consume_beyond_credit_is_noop() {
        let window = FlowWindow::new(3);
        assert!(!window.try_consume(4));
        assert_eq!(window.available(), 3);
    }

    #[test]
    fn test_zero_consume_always_succeeds() {
        let window = FlowWindow::new(0);
        assert!(window.try_consume(0));
    }

    #[test]
    fn test_grant_visible_through_clone() {
        let window = FlowWindow::new(0);
        let frame_view = window.clone();
        window.grant(100);
        assert!(frame_view.try_consume(100));
        assert!(window.same_window(&frame_view));
        assert!(!window.same_window(&FlowWindow::new(0)));
    }

    #[test]
    fn test_refund() {
        let window = FlowWindow::new(8);
        assert!(window.try_consume(8));
        window.refund(8);
        assert_eq!(window.available(), 8);
    }

    #[test]
    fn test_concurrent_grants() {
        let window = FlowWindow::new(0);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let w = window.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        w.grant(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(window.available(), 4000);
    }
}
