//! Bounded sample FIFOs between the USB event thread and caller threads.
//!
//! The inbound queue carries measured sample rows from the device to the
//! caller, the outbound queues carry to-source values the other way. Both
//! sides are lock-free channels; the queue only adds the sticky
//! overflow/underflow bookkeeping that turns silent data loss into a
//! reportable fault.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// FIFO of measured sample rows, filled by the event thread.
///
/// Overflow policy: when the consumer reads too slowly the incoming sample is
/// dropped and the overflow flag latches. Queued samples are never reordered.
pub(crate) struct InboundQueue {
    tx: Sender<[f32; 4]>,
    rx: Receiver<[f32; 4]>,
    overflowed: AtomicBool,
}

impl InboundQueue {
    pub(crate) fn new(depth: usize) -> Self {
        let (tx, rx) = bounded(depth);
        Self {
            tx,
            rx,
            overflowed: AtomicBool::new(false),
        }
    }

    /// Producer side: enqueue one row, latching the overflow flag when full.
    /// Returns whether the row was accepted.
    pub(crate) fn push(&self, row: [f32; 4]) -> bool {
        match self.tx.try_send(row) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.overflowed.store(true, Ordering::Release);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Consumer side: move up to `max` rows into `buf`.
    ///
    /// A zero `timeout` returns immediately with whatever is available; a
    /// positive one blocks up to the deadline for the first row only.
    pub(crate) fn pop_into(&self, buf: &mut Vec<[f32; 4]>, max: usize, timeout: Duration) -> usize {
        if max == 0 {
            return 0;
        }
        let first = if timeout.is_zero() {
            self.rx.try_recv().ok()
        } else {
            match self.rx.recv_timeout(timeout) {
                Ok(row) => Some(row),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
            }
        };
        let Some(first) = first else { return 0 };
        buf.push(first);
        let mut count = 1;
        while count < max {
            match self.rx.try_recv() {
                Ok(row) => {
                    buf.push(row);
                    count += 1;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        count
    }

    /// Read and clear the sticky overflow flag.
    pub(crate) fn take_overflow(&self) -> bool {
        self.overflowed.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
        self.overflowed.store(false, Ordering::Release);
    }
}

/// FIFO of to-source values for one channel, drained by the event thread.
pub(crate) struct OutboundQueue {
    tx: Sender<f32>,
    rx: Receiver<f32>,
    underflowed: AtomicBool,
    // Underflow only counts once the caller has actually written something;
    // a queue that was never fed is sourcing the configured fallback, not
    // running dry.
    primed: AtomicBool,
}

impl OutboundQueue {
    pub(crate) fn new(depth: usize) -> Self {
        let (tx, rx) = bounded(depth);
        Self {
            tx,
            rx,
            underflowed: AtomicBool::new(false),
            primed: AtomicBool::new(false),
        }
    }

    /// Caller side: enqueue as many of `samples` as the deadline allows.
    /// Returns the count actually queued.
    pub(crate) fn push_from(&self, samples: &[f32], timeout: Duration) -> usize {
        let count = if timeout.is_zero() {
            let mut count = 0;
            for &value in samples {
                match self.tx.try_send(value) {
                    Ok(()) => count += 1,
                    Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => break,
                }
            }
            count
        } else {
            let deadline = Instant::now() + timeout;
            let mut count = 0;
            for &value in samples {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match self.tx.send_timeout(value, remaining) {
                    Ok(()) => count += 1,
                    Err(_) => break,
                }
            }
            count
        };
        if count > 0 {
            self.primed.store(true, Ordering::Release);
        }
        count
    }

    /// Producer (event thread) side: next value to source, if any.
    pub(crate) fn pop(&self) -> Option<f32> {
        self.rx.try_recv().ok()
    }

    /// Latch the underflow flag; called by the event thread when it needed a
    /// value and the queue had run dry. No-op until the queue was fed once.
    pub(crate) fn mark_underflow(&self) {
        if self.primed.load(Ordering::Acquire) {
            self.underflowed.store(true, Ordering::Release);
        }
    }

    /// Whether the caller has written to this queue since the last clear.
    pub(crate) fn is_primed(&self) -> bool {
        self.primed.load(Ordering::Acquire)
    }

    /// Read and clear the sticky underflow flag.
    pub(crate) fn take_underflow(&self) -> bool {
        self.underflowed.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
        self.underflowed.store(false, Ordering::Release);
        self.primed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_zero_timeout_empty_returns_immediately() {
        let q = InboundQueue::new(4);
        let mut buf = Vec::new();
        let start = Instant::now();
        assert_eq!(q.pop_into(&mut buf, 16, Duration::ZERO), 0);
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_overflow_latches_and_order_is_kept() {
        let q = InboundQueue::new(2);
        assert!(q.push([1.0; 4]));
        assert!(q.push([2.0; 4]));
        // Third row is dropped, not reordered in.
        assert!(!q.push([3.0; 4]));
        assert!(q.take_overflow());
        // Flag is cleared by reading it.
        assert!(!q.take_overflow());

        let mut buf = Vec::new();
        assert_eq!(q.pop_into(&mut buf, 8, Duration::ZERO), 2);
        assert_eq!(buf[0], [1.0; 4]);
        assert_eq!(buf[1], [2.0; 4]);
    }

    #[test]
    fn test_blocking_pop_wakes_on_late_producer() {
        let q = std::sync::Arc::new(InboundQueue::new(4));
        let producer = std::sync::Arc::clone(&q);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push([7.0; 4]);
        });
        let mut buf = Vec::new();
        let got = q.pop_into(&mut buf, 1, Duration::from_millis(500));
        handle.join().ok();
        assert_eq!(got, 1);
        assert_eq!(buf[0], [7.0; 4]);
    }

    #[test]
    fn test_outbound_zero_timeout_full_returns_short_count() {
        let q = OutboundQueue::new(3);
        assert_eq!(q.push_from(&[0.1, 0.2, 0.3, 0.4], Duration::ZERO), 3);
        assert_eq!(q.pop(), Some(0.1));
        assert_eq!(q.pop(), Some(0.2));
        assert_eq!(q.pop(), Some(0.3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_outbound_underflow_is_sticky_until_read() {
        let q = OutboundQueue::new(2);
        q.push_from(&[1.0], Duration::ZERO);
        assert_eq!(q.pop(), Some(1.0));
        assert_eq!(q.pop(), None);
        q.mark_underflow();
        assert!(q.take_underflow());
        assert!(!q.take_underflow());
    }

    #[test]
    fn test_underflow_needs_a_prior_write() {
        let q = OutboundQueue::new(2);
        assert!(!q.is_primed());
        q.mark_underflow();
        assert!(!q.take_underflow());
        q.push_from(&[1.0], Duration::ZERO);
        assert!(q.is_primed());
    }

    #[test]
    fn test_clear_resets_contents_and_flags() {
        let q = OutboundQueue::new(2);
        q.push_from(&[1.0, 2.0], Duration::ZERO);
        q.mark_underflow();
        q.clear();
        assert_eq!(q.pop(), None);
        assert!(!q.take_underflow());
    }
}
