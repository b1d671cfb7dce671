//! Selective-Repeat receive-side state machine.
//!
//! [`SrReceiver`] implements the receiver side of Selective Repeat:
//!
//! - A data segment is accepted only if its checksum verifies and its
//!   sequence number lies in `[rec_base, rec_base + window_size)`.
//! - Accepted segments are buffered until the gap in front of them closes;
//!   the contiguous prefix is then appended to the delivery buffer.
//! - Every valid segment is acknowledged individually with `ack = seq`,
//!   including duplicates of segments already delivered (their ACK may have
//!   been lost).  A delivered segment may lag `rec_base` by up to
//!   [`MAX_WINDOW`], whatever the local window: the sender's window is
//!   configured independently of ours.
//! - Corrupt and out-of-window segments are dropped without an ACK; the
//!   sender's timeout recovers them.
//!
//! Out-of-order payloads live in an arena of `window_size` slots indexed by
//! `index mod window_size`.  Only indices inside the window are ever stored,
//! so two live indices never share a slot.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility (same pattern as [`crate::sr_sender::SrSender`]).

use crate::config::MAX_WINDOW;
use crate::segment::Segment;
use crate::sr_sender::wire_seq;

/// What happened to one inbound data segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// First arrival; buffered.  `delivered` bytes became ready as a result.
    Accepted { ack: u16, delivered: usize },
    /// Already received earlier; only the ACK must be repeated.
    Duplicate { ack: u16 },
    /// Checksum mismatch.
    Corrupt,
    /// Sequence number outside the acceptable range.
    OutOfWindow,
}

impl Receipt {
    /// ACK number to send back, if this segment deserves one.
    pub fn ack(&self) -> Option<u16> {
        match *self {
            Receipt::Accepted { ack, .. } | Receipt::Duplicate { ack } => Some(ack),
            Receipt::Corrupt | Receipt::OutOfWindow => None,
        }
    }
}

// ---------------------------------------------------------------------------
// SrReceiver
// ---------------------------------------------------------------------------

/// Selective-Repeat receive-side state for one connection.
#[derive(Debug)]
pub struct SrReceiver {
    /// Absolute index of the lowest chunk not yet received.
    rec_base: usize,
    window_size: usize,
    /// Out-of-order payloads, slot = `index % window_size`.
    slots: Vec<Option<Vec<u8>>>,
    /// In-order bytes waiting for [`deliver`](Self::deliver).
    ready: Vec<u8>,
}

impl SrReceiver {
    /// `window_size` comes from a validated [`Config`](crate::config::Config).
    pub(crate) fn new(window_size: usize) -> Self {
        Self::starting_at(0, window_size)
    }

    /// Receiver whose next expected chunk has absolute index `first`.
    pub(crate) fn starting_at(first: usize, window_size: usize) -> Self {
        debug_assert!(window_size >= 1);
        Self {
            rec_base: first,
            window_size,
            slots: vec![None; window_size],
            ready: Vec::new(),
        }
    }

    pub fn rec_base(&self) -> usize {
        self.rec_base
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Number of out-of-order chunks held back behind a gap.
    pub fn buffered(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Bytes ready for delivery.
    pub fn pending(&self) -> usize {
        self.ready.len()
    }

    /// Validate, deduplicate and buffer one inbound data segment.
    pub fn on_data_segment(&mut self, seg: &Segment) -> Receipt {
        if !seg.is_intact() {
            return Receipt::Corrupt;
        }

        let seq = seg.header.seq;
        let base = wire_seq(self.rec_base);
        let offset = seq.wrapping_sub(base) as usize;

        if offset >= self.window_size {
            let behind = base.wrapping_sub(seq) as usize;
            if behind >= 1 && behind <= MAX_WINDOW as usize && behind <= self.rec_base {
                return Receipt::Duplicate { ack: seq };
            }
            return Receipt::OutOfWindow;
        }

        let slot = (self.rec_base + offset) % self.window_size;
        if self.slots[slot].is_some() {
            return Receipt::Duplicate { ack: seq };
        }
        self.slots[slot] = Some(seg.payload.clone());

        let before = self.ready.len();
        while let Some(chunk) = self.slots[self.rec_base % self.window_size].take() {
            self.ready.extend_from_slice(&chunk);
            self.rec_base += 1;
        }
        Receipt::Accepted {
            ack: seq,
            delivered: self.ready.len() - before,
        }
    }

    /// Drain every in-order byte received so far (empty if none).
    pub fn deliver(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.ready)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;

    fn seg(seq: u16, payload: &[u8]) -> Segment {
        Segment::data(seq, payload.to_vec())
    }

    #[test]
    fn initial_state() {
        let mut r = SrReceiver::new(4);
        assert_eq!(r.rec_base(), 0);
        assert_eq!(r.buffered(), 0);
        assert!(r.deliver().is_empty());
    }

    #[test]
    fn in_order_segment_delivered_and_acked() {
        let mut r = SrReceiver::new(4);
        let receipt = r.on_data_segment(&seg(0, b"hello"));
        assert_eq!(receipt, Receipt::Accepted { ack: 0, delivered: 5 });
        assert_eq!(receipt.ack(), Some(0));
        assert_eq!(r.rec_base(), 1);
        assert_eq!(r.deliver(), b"hello");
        assert!(r.deliver().is_empty());
    }

    #[test]
    fn reverse_order_delivers_once_gap_closes() {
        let mut r = SrReceiver::new(4);

        assert_eq!(
            r.on_data_segment(&seg(2, b"cc")),
            Receipt::Accepted { ack: 2, delivered: 0 }
        );
        assert_eq!(
            r.on_data_segment(&seg(1, b"bb")),
            Receipt::Accepted { ack: 1, delivered: 0 }
        );
        assert_eq!(r.buffered(), 2);
        assert_eq!(r.rec_base(), 0);
        assert!(r.deliver().is_empty(), "nothing deliverable before index 0");

        assert_eq!(
            r.on_data_segment(&seg(0, b"aa")),
            Receipt::Accepted { ack: 0, delivered: 6 }
        );
        assert_eq!(r.rec_base(), 3);
        assert_eq!(r.buffered(), 0);
        assert_eq!(r.deliver(), b"aabbcc");
    }

    #[test]
    fn duplicate_is_reacked_but_not_rebuffered() {
        let mut r = SrReceiver::new(4);
        r.on_data_segment(&seg(1, b"one"));
        assert_eq!(r.on_data_segment(&seg(1, b"one")), Receipt::Duplicate { ack: 1 });
        assert_eq!(r.buffered(), 1);

        r.on_data_segment(&seg(0, b"zero"));
        assert_eq!(r.deliver(), b"zeroone");

        // Already delivered: ACK again, stream unchanged.
        assert_eq!(r.on_data_segment(&seg(0, b"zero")), Receipt::Duplicate { ack: 0 });
        assert_eq!(r.on_data_segment(&seg(1, b"one")), Receipt::Duplicate { ack: 1 });
        assert!(r.deliver().is_empty());
        assert_eq!(r.rec_base(), 2);
    }

    #[test]
    fn corrupt_segment_dropped_without_ack() {
        let mut r = SrReceiver::new(4);
        let mut bad = seg(0, b"payload");
        bad.header.checksum ^= 0x0001;

        let receipt = r.on_data_segment(&bad);
        assert_eq!(receipt, Receipt::Corrupt);
        assert_eq!(receipt.ack(), None);
        assert_eq!(r.rec_base(), 0);
        assert!(r.deliver().is_empty());

        // The unmodified retransmission succeeds.
        assert!(matches!(
            r.on_data_segment(&seg(0, b"payload")),
            Receipt::Accepted { ack: 0, .. }
        ));
        assert_eq!(r.deliver(), b"payload");
    }

    #[test]
    fn segments_beyond_window_dropped() {
        let mut r = SrReceiver::new(3);
        assert_eq!(r.on_data_segment(&seg(3, b"x")), Receipt::OutOfWindow);
        assert_eq!(r.on_data_segment(&seg(500, b"x")), Receipt::OutOfWindow);
        assert_eq!(r.buffered(), 0);

        // Highest acceptable index is rec_base + window - 1.
        assert!(matches!(
            r.on_data_segment(&seg(2, b"x")),
            Receipt::Accepted { .. }
        ));
    }

    #[test]
    fn window_moves_with_rec_base() {
        let mut r = SrReceiver::new(2);
        r.on_data_segment(&seg(0, b"a"));
        r.on_data_segment(&seg(1, b"b"));
        assert_eq!(r.rec_base(), 2);
        // 2 and 3 are now acceptable, 4 is not.
        assert_eq!(r.on_data_segment(&seg(4, b"e")), Receipt::OutOfWindow);
        assert!(matches!(
            r.on_data_segment(&seg(3, b"d")),
            Receipt::Accepted { delivered: 0, .. }
        ));
        assert!(matches!(
            r.on_data_segment(&seg(2, b"c")),
            Receipt::Accepted { delivered: 2, .. }
        ));
        assert_eq!(r.deliver(), b"abcd");
    }

    #[test]
    fn fresh_receiver_drops_segments_behind_zero() {
        let mut r = SrReceiver::new(4);
        assert_eq!(r.on_data_segment(&seg(0xffff, b"x")), Receipt::OutOfWindow);
    }

    #[test]
    fn sequence_numbers_wrap_past_u16() {
        let mut r = SrReceiver::starting_at(0xfffe, 4);
        r.on_data_segment(&seg(1, b"d"));
        r.on_data_segment(&seg(0, b"c"));
        r.on_data_segment(&seg(0xffff, b"b"));
        assert!(r.deliver().is_empty());

        assert_eq!(
            r.on_data_segment(&seg(0xfffe, b"a")),
            Receipt::Accepted { ack: 0xfffe, delivered: 4 }
        );
        assert_eq!(r.rec_base(), 0x1_0002);
        assert_eq!(r.deliver(), b"abcd");
        // A late copy from before the wrap is a duplicate, not new data.
        assert_eq!(r.on_data_segment(&seg(0xffff, b"b")), Receipt::Duplicate { ack: 0xffff });
    }

    #[test]
    fn old_duplicate_beyond_local_window_is_reacked() {
        // The peer's window may be wider than ours: rec_base can move well
        // past a chunk whose ACK was lost before it is retransmitted.
        let mut r = SrReceiver::new(2);
        for seq in 0..8u16 {
            r.on_data_segment(&seg(seq, &[seq as u8]));
        }
        assert_eq!(r.rec_base(), 8);
        assert_eq!(r.deliver(), vec![0, 1, 2, 3, 4, 5, 6, 7]);

        assert_eq!(r.on_data_segment(&seg(0, &[0])), Receipt::Duplicate { ack: 0 });
        assert_eq!(r.on_data_segment(&seg(5, &[5])), Receipt::Duplicate { ack: 5 });
        assert!(r.deliver().is_empty());
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn duplicate_range_stops_at_half_sequence_space() {
        let base = MAX_WINDOW as usize + 10;
        let mut r = SrReceiver::starting_at(base, 4);
        let edge = wire_seq(base - MAX_WINDOW as usize);
        assert_eq!(r.on_data_segment(&seg(edge, b"x")), Receipt::Duplicate { ack: edge });
        let past = edge.wrapping_sub(1);
        assert_eq!(r.on_data_segment(&seg(past, b"x")), Receipt::OutOfWindow);
    }

    #[test]
    fn deliver_drains_partial_progress() {
        let mut r = SrReceiver::new(8);
        r.on_data_segment(&seg(0, b"ab"));
        assert_eq!(r.pending(), 2);
        assert_eq!(r.deliver(), b"ab");
        r.on_data_segment(&seg(1, b"cd"));
        assert_eq!(r.deliver(), b"cd");
        assert_eq!(r.pending(), 0);
    }
}
