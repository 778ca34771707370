//! Per-stream receive buffer with credit accounting.

use std::collections::VecDeque;

use bytes::{Buf, Bytes};

/// The peer wrote past the credit it was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WindowExceeded;

/// Bounded receive buffer for one stream.
///
/// Incoming payloads are kept as the `Bytes` chunks they arrived in and
/// copied out on demand. Three counters share the stream's window budget:
/// `window` is credit the peer still holds, `buffered` is data waiting for
/// a reader, and `pending_credit` is consumed data not yet re-advertised.
/// `buffered + window + pending_credit == capacity` at every step; pushes
/// move window into buffered, pops move buffered into pending credit, and
/// `take_credit` moves pending credit back into window when enough has
/// piled up to be worth a `WINDOW_UPDATE`.
pub(crate) struct RecvBuffer {
    segments: VecDeque<Bytes>,
    buffered: usize,
    window: u32,
    pending_credit: u32,
    capacity: u32,
}

impl RecvBuffer {
    pub(crate) fn new(capacity: u32) -> Self {
        Self {
            segments: VecDeque::new(),
            buffered: 0,
            window: capacity,
            pending_credit: 0,
            capacity,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffered == 0
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buffered
    }

    #[cfg(test)]
    pub(crate) fn window(&self) -> u32 {
        self.window
    }

    /// Appends an incoming chunk, charging it against the peer's credit.
    pub(crate) fn push(&mut self, data: Bytes) -> Result<(), WindowExceeded> {
        if data.len() > self.window as usize {
            return Err(WindowExceeded);
        }
        self.window -= data.len() as u32;
        self.buffered += data.len();
        if !data.is_empty() {
            self.segments.push_back(data);
        }
        Ok(())
    }

    /// Copies out up to `out.len()` bytes, crossing chunk boundaries, and
    /// accrues the consumed amount as pending credit.
    pub(crate) fn pop(&mut self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < out.len() {
            let Some(segment) = self.segments.front_mut() else {
                break;
            };
            let n = segment.len().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&segment[..n]);
            segment.advance(n);
            if segment.is_empty() {
                self.segments.pop_front();
            }
            copied += n;
        }
        self.buffered -= copied;
        self.pending_credit += copied as u32;
        copied
    }

    /// Returns the credit to re-advertise once consumption crosses half
    /// the window, restoring it to the peer's budget. Below the threshold
    /// the credit keeps accruing so small reads do not each cost a frame.
    pub(crate) fn take_credit(&mut self) -> Option<u32> {
        if self.pending_credit < self.capacity / 2 {
            return None;
        }
        let delta = self.pending_credit;
        self.pending_credit = 0;
        self.window += delta;
        Some(delta)
    }

    /// Drops buffered data, e.g. after a reset.
    pub(crate) fn clear(&mut self) {
        self.segments.clear();
        self.buffered = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAP: u32 = 64 * 1024;

    #[test]
    fn test_push_pop_roundtrip() {
        let mut buf = RecvBuffer::new(CAP);
        buf.push(Bytes::from_static(b"hello ")).unwrap();
        buf.push(Bytes::from_static(b"world")).unwrap();
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.window(), CAP - 11);

        let mut out = [0u8; 16];
        let n = buf.pop(&mut out);
        assert_eq!(n, 11);
        assert_eq!(&out[..n], b"hello world");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pop_crosses_segments() {
        let mut buf = RecvBuffer::new(CAP);
        buf.push(Bytes::from_static(b"abcd")).unwrap();
        buf.push(Bytes::from_static(b"efgh")).unwrap();

        let mut out = [0u8; 6];
        assert_eq!(buf.pop(&mut out), 6);
        assert_eq!(&out, b"abcdef");

        let mut out = [0u8; 6];
        assert_eq!(buf.pop(&mut out), 2);
        assert_eq!(&out[..2], b"gh");
    }

    #[test]
    fn test_window_overrun_rejected() {
        let mut buf = RecvBuffer::new(8 * 1024);
        buf.push(Bytes::from(vec![0u8; 8 * 1024])).unwrap();
        assert_eq!(buf.window(), 0);
        assert_eq!(buf.push(Bytes::from_static(b"x")), Err(WindowExceeded));
    }

    #[test]
    fn test_credit_released_at_half_window() {
        let mut buf = RecvBuffer::new(8 * 1024);
        buf.push(Bytes::from(vec![0u8; 8 * 1024])).unwrap();

        let mut out = vec![0u8; 4 * 1024 - 1];
        buf.pop(&mut out);
        assert_eq!(buf.take_credit(), None);

        let mut out = [0u8; 1];
        buf.pop(&mut out);
        assert_eq!(buf.take_credit(), Some(4 * 1024));
        assert_eq!(buf.window(), 4 * 1024);

        // Credit granted again means the peer may push again.
        buf.push(Bytes::from(vec![0u8; 4 * 1024])).unwrap();
    }

    #[test]
    fn test_budget_invariant_holds() {
        let mut buf = RecvBuffer::new(CAP);
        let invariant = |buf: &RecvBuffer| {
            buf.buffered as u32 + buf.window + buf.pending_credit == buf.capacity
        };
        assert!(invariant(&buf));
        buf.push(Bytes::from(vec![7u8; 10_000])).unwrap();
        assert!(invariant(&buf));
        let mut out = vec![0u8; 9_999];
        buf.pop(&mut out);
        assert!(invariant(&buf));
        buf.take_credit();
        assert!(invariant(&buf));
    }
}
