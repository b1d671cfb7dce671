//! Selective-Repeat send-side state machine.
//!
//! [`SrSender`] splits application data into [`PAYLOAD_SIZE`] chunks and
//! keeps a sliding window of up to `window_size` of them in flight.
//!
//! # Protocol contract
//!
//! - Chunk `i` travels as a data segment with `seq = i mod 2^16`.
//! - ACKs are **selective**: `ack = i` acknowledges chunk `i` only.
//! - `send_base` advances past a gap-free prefix of acknowledged chunks.
//!   Acknowledgements beyond a gap are remembered but do not move the base.
//! - `send_next − send_base ≤ window_size` at all times, so a chunk is only
//!   transmitted for the first time once it fits behind the base.
//! - Every sent-but-unacked chunk is retransmitted on its own once it has
//!   been in flight longer than `timeout`.  There is no retry cap.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.  Time is passed in explicitly so the window can be driven
//! deterministically from tests.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::MAX_WINDOW;
use crate::segment::{Segment, PAYLOAD_SIZE};

/// Wire sequence number of absolute chunk index `index`.
#[inline]
pub fn wire_seq(index: usize) -> u16 {
    (index & 0xffff) as u16
}

// ---------------------------------------------------------------------------
// SrEntry
// ---------------------------------------------------------------------------

/// Book-keeping for one chunk that has not yet been retired past `send_base`.
#[derive(Debug, Clone)]
pub struct SrEntry {
    pub payload: Vec<u8>,
    pub acked: bool,
    /// Most recent transmission, `None` until first sent.
    pub last_sent: Option<Instant>,
    /// Total number of times this chunk has been transmitted.
    pub tx_count: u32,
}

/// Result of feeding one ACK number to [`SrSender::on_ack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The base moved forward by this many chunks.
    Advanced(usize),
    /// New ACK beyond a gap; recorded, base unchanged.
    Buffered,
    /// ACK for a chunk that was already acknowledged.
    Duplicate,
    /// ACK for a chunk that was never sent.
    OutOfRange,
}

// ---------------------------------------------------------------------------
// SrSender
// ---------------------------------------------------------------------------

/// Selective-Repeat send-side state for one connection.
///
/// # Index layout
///
/// ```text
///  send_base          send_next            total
///      │                  │                  │
///  ────┼──────────────────┼──────────────────┼──▶ chunk index
///      │ <── in flight ──▶│ <── queued ─────▶│
/// ```
#[derive(Debug)]
pub struct SrSender {
    send_base: usize,
    send_next: usize,
    window_size: usize,
    timeout: Duration,
    /// Entries for chunks `send_base..total`, front = `send_base`.
    queue: VecDeque<SrEntry>,
}

impl SrSender {
    /// Create an idle sender.  `window_size` comes from a validated
    /// [`Config`](crate::config::Config) and is at least 1.
    pub(crate) fn new(window_size: usize, timeout: Duration) -> Self {
        Self::starting_at(0, window_size, timeout)
    }

    /// Create an idle sender whose first chunk gets absolute index `first`.
    pub(crate) fn starting_at(first: usize, window_size: usize, timeout: Duration) -> Self {
        debug_assert!(window_size >= 1);
        Self {
            send_base: first,
            send_next: first,
            window_size,
            timeout,
            queue: VecDeque::new(),
        }
    }

    /// Partition `data` into chunks and queue them behind anything already
    /// queued.  Returns the number of chunks added.
    pub fn start_sending(&mut self, data: &[u8]) -> usize {
        let before = self.queue.len();
        self.queue.extend(data.chunks(PAYLOAD_SIZE).map(|chunk| SrEntry {
            payload: chunk.to_vec(),
            acked: false,
            last_sent: None,
            tx_count: 0,
        }));
        self.queue.len() - before
    }

    /// Lowest chunk index not yet acknowledged as part of a gap-free prefix.
    pub fn send_base(&self) -> usize {
        self.send_base
    }

    /// Next chunk index that has never been sent.
    pub fn send_next(&self) -> usize {
        self.send_next
    }

    /// Number of chunks queued so far, acknowledged or not.
    pub fn total(&self) -> usize {
        self.send_base + self.queue.len()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Width of the occupied window (`send_next − send_base`).
    pub fn in_flight(&self) -> usize {
        self.send_next - self.send_base
    }

    /// Chunks that are sent and still waiting for their own ACK.
    pub fn outstanding(&self) -> usize {
        self.live_entries().filter(|e| !e.acked).count()
    }

    /// `true` once every queued chunk has been acknowledged.
    pub fn is_done(&self) -> bool {
        self.queue.is_empty()
    }

    /// `true` when the next queued chunk fits into the window.
    pub fn can_send(&self) -> bool {
        self.in_flight() < self.window_size && self.send_next < self.total()
    }

    /// Entry for absolute chunk `index`, if it has not been retired yet.
    pub fn entry(&self, index: usize) -> Option<&SrEntry> {
        index
            .checked_sub(self.send_base)
            .and_then(|off| self.queue.get(off))
    }

    /// Collect every segment that must go on the wire at `now`.
    ///
    /// First fills the window with never-sent chunks, then retransmits every
    /// outstanding chunk whose last transmission is older than the timeout.
    pub fn poll(&mut self, now: Instant) -> Vec<Segment> {
        let mut out = Vec::new();

        while self.can_send() {
            out.push(self.transmit(self.send_next, now));
            self.send_next += 1;
        }

        for index in self.send_base..self.send_next {
            let entry = &self.queue[index - self.send_base];
            let expired = entry
                .last_sent
                .is_some_and(|at| now.saturating_duration_since(at) > self.timeout);
            if !entry.acked && expired {
                out.push(self.transmit(index, now));
            }
        }
        out
    }

    /// Earliest instant at which [`poll`](Self::poll) would retransmit
    /// something, or `None` when nothing is outstanding.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.live_entries()
            .filter(|e| !e.acked)
            .filter_map(|e| e.last_sent)
            .min()
            .map(|at| at + self.timeout)
    }

    /// Process a selective ACK carrying wire sequence number `ack`.
    pub fn on_ack(&mut self, ack: u16) -> AckOutcome {
        let base = wire_seq(self.send_base);
        let offset = ack.wrapping_sub(base) as usize;

        if offset >= self.in_flight() {
            // Behind the base: a chunk that was already retired.
            let behind = base.wrapping_sub(ack) as usize;
            if behind >= 1 && behind <= MAX_WINDOW as usize && behind <= self.send_base {
                return AckOutcome::Duplicate;
            }
            return AckOutcome::OutOfRange;
        }

        let entry = &mut self.queue[offset];
        if entry.acked {
            return AckOutcome::Duplicate;
        }
        entry.acked = true;

        let mut advanced = 0;
        while self.queue.front().is_some_and(|e| e.acked) {
            self.queue.pop_front();
            self.send_base += 1;
            advanced += 1;
        }
        if advanced > 0 {
            AckOutcome::Advanced(advanced)
        } else {
            AckOutcome::Buffered
        }
    }

    fn transmit(&mut self, index: usize, now: Instant) -> Segment {
        let entry = &mut self.queue[index - self.send_base];
        entry.last_sent = Some(now);
        entry.tx_count += 1;
        Segment::data(wire_seq(index), entry.payload.clone())
    }

    fn live_entries(&self) -> impl Iterator<Item = &SrEntry> {
        self.queue.iter().take(self.in_flight())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn seqs(segments: &[Segment]) -> Vec<u16> {
        segments.iter().map(|s| s.header.seq).collect()
    }

    /// `n` full chunks, each filled with its own index.
    fn chunks(n: usize) -> Vec<u8> {
        (0..n).flat_map(|i| vec![i as u8; PAYLOAD_SIZE]).collect()
    }

    #[test]
    fn initial_state() {
        let s = SrSender::new(4, TIMEOUT);
        assert_eq!(s.send_base(), 0);
        assert_eq!(s.send_next(), 0);
        assert!(s.is_done());
        assert!(!s.can_send());
    }

    #[test]
    fn partitions_data_into_chunks() {
        let mut s = SrSender::new(4, TIMEOUT);
        let data = vec![7u8; PAYLOAD_SIZE * 2 + 10];
        assert_eq!(s.start_sending(&data), 3);
        assert_eq!(s.total(), 3);

        let sent = s.poll(Instant::now());
        assert_eq!(seqs(&sent), vec![0, 1, 2]);
        assert_eq!(sent[0].payload.len(), PAYLOAD_SIZE);
        assert_eq!(sent[2].payload.len(), 10);
        assert_eq!(sent[2].header.data_length, 10);
        assert!(sent.iter().all(|seg| seg.is_intact()));
    }

    #[test]
    fn empty_data_is_done_immediately() {
        let mut s = SrSender::new(4, TIMEOUT);
        assert_eq!(s.start_sending(&[]), 0);
        assert!(s.is_done());
        assert!(s.poll(Instant::now()).is_empty());
    }

    #[test]
    fn window_limits_first_transmissions() {
        let mut s = SrSender::new(2, TIMEOUT);
        s.start_sending(&chunks(3));
        let t0 = Instant::now();

        assert_eq!(seqs(&s.poll(t0)), vec![0, 1]);
        assert_eq!(s.in_flight(), 2);
        assert!(!s.can_send());
        // Nothing new, nothing expired.
        assert!(s.poll(t0 + TIMEOUT / 2).is_empty());
    }

    #[test]
    fn only_unacked_chunk_is_retransmitted_after_timeout() {
        let mut s = SrSender::new(2, TIMEOUT);
        s.start_sending(&chunks(3));
        let t0 = Instant::now();
        s.poll(t0);

        // Chunk 1 is acknowledged out of order; the base stays at 0.
        assert_eq!(s.on_ack(1), AckOutcome::Buffered);
        assert_eq!(s.send_base(), 0);

        // Chunk 2 must not go out while the base is stuck at 0, and only
        // chunk 0 is retransmitted.
        let resent = s.poll(t0 + Duration::from_millis(60));
        assert_eq!(seqs(&resent), vec![0]);
        assert_eq!(s.entry(0).unwrap().tx_count, 2);
        assert_eq!(s.entry(1).unwrap().tx_count, 1);
    }

    #[test]
    fn ack_of_base_slides_window_and_releases_next_chunk() {
        let mut s = SrSender::new(2, TIMEOUT);
        s.start_sending(&chunks(3));
        let t0 = Instant::now();
        assert_eq!(seqs(&s.poll(t0)), vec![0, 1]);

        assert_eq!(s.on_ack(0), AckOutcome::Advanced(1));
        assert_eq!(s.send_base(), 1);

        // After the timeout: chunk 2 is new, chunk 1 is a retransmission.
        let out = s.poll(t0 + Duration::from_millis(60));
        assert_eq!(seqs(&out), vec![2, 1]);
        assert!(s.in_flight() <= s.window_size());
    }

    #[test]
    fn gap_fill_advances_over_buffered_acks() {
        let mut s = SrSender::new(4, TIMEOUT);
        s.start_sending(&chunks(4));
        s.poll(Instant::now());

        assert_eq!(s.on_ack(2), AckOutcome::Buffered);
        assert_eq!(s.on_ack(1), AckOutcome::Buffered);
        assert_eq!(s.send_base(), 0);
        assert_eq!(s.outstanding(), 2);

        assert_eq!(s.on_ack(0), AckOutcome::Advanced(3));
        assert_eq!(s.send_base(), 3);
        assert_eq!(s.on_ack(3), AckOutcome::Advanced(1));
        assert!(s.is_done());
    }

    #[test]
    fn duplicate_ack_never_moves_base_backwards() {
        let mut s = SrSender::new(4, TIMEOUT);
        s.start_sending(&chunks(3));
        s.poll(Instant::now());

        s.on_ack(0);
        s.on_ack(2);
        let base = s.send_base();
        assert_eq!(s.on_ack(0), AckOutcome::Duplicate);
        assert_eq!(s.on_ack(2), AckOutcome::Duplicate);
        assert_eq!(s.send_base(), base);
    }

    #[test]
    fn reack_far_behind_base_is_duplicate() {
        let mut s = SrSender::new(2, TIMEOUT);
        s.start_sending(&chunks(10));
        let mut now = Instant::now();
        while s.send_base() < 8 {
            for seg in s.poll(now) {
                s.on_ack(seg.header.seq);
            }
            now += Duration::from_millis(1);
        }
        // A receiver re-ACKs stale retransmissions from further back than
        // our own window.
        assert_eq!(s.on_ack(0), AckOutcome::Duplicate);
        assert_eq!(s.send_base(), 8);
    }

    #[test]
    fn ack_for_unsent_chunk_is_out_of_range() {
        let mut s = SrSender::new(2, TIMEOUT);
        s.start_sending(&chunks(5));
        s.poll(Instant::now());

        assert_eq!(s.on_ack(3), AckOutcome::OutOfRange);
        assert_eq!(s.on_ack(999), AckOutcome::OutOfRange);
        assert_eq!(s.send_base(), 0);
    }

    #[test]
    fn window_invariant_holds_throughout_transfer() {
        let mut s = SrSender::new(3, TIMEOUT);
        s.start_sending(&chunks(10));
        let mut now = Instant::now();
        let mut next_ack = 0u16;
        while !s.is_done() {
            s.poll(now);
            assert!(s.send_next() - s.send_base() <= 3);
            // Acknowledge in reverse within each window.
            let hi = s.send_next() as u16;
            for ack in (next_ack..hi).rev() {
                s.on_ack(ack);
                assert!(s.send_next() - s.send_base() <= 3);
            }
            next_ack = hi;
            now += Duration::from_millis(1);
        }
        assert_eq!(s.send_base(), 10);
    }

    #[test]
    fn next_timeout_tracks_oldest_outstanding() {
        let mut s = SrSender::new(4, TIMEOUT);
        assert_eq!(s.next_timeout(), None);
        s.start_sending(&chunks(2));
        let t0 = Instant::now();
        s.poll(t0);
        assert_eq!(s.next_timeout(), Some(t0 + TIMEOUT));
        s.on_ack(0);
        s.on_ack(1);
        assert_eq!(s.next_timeout(), None);
    }

    #[test]
    fn successive_sends_continue_numbering() {
        let mut s = SrSender::new(4, TIMEOUT);
        s.start_sending(b"first");
        let t0 = Instant::now();
        assert_eq!(seqs(&s.poll(t0)), vec![0]);
        s.on_ack(0);

        s.start_sending(b"second");
        let out = s.poll(t0);
        assert_eq!(seqs(&out), vec![1]);
        assert_eq!(out[0].payload, b"second");
    }

    #[test]
    fn sequence_numbers_wrap_past_u16() {
        let mut s = SrSender::starting_at(0xfffe, 4, TIMEOUT);
        s.start_sending(&chunks(4));
        assert_eq!(seqs(&s.poll(Instant::now())), vec![0xfffe, 0xffff, 0, 1]);

        assert_eq!(s.on_ack(0), AckOutcome::Buffered);
        assert_eq!(s.on_ack(0xfffe), AckOutcome::Advanced(1));
        assert_eq!(s.on_ack(0xffff), AckOutcome::Advanced(2));
        assert_eq!(s.send_base(), 0x1_0001);
        // An ACK from before the wrap is recognised as old, not as new data.
        assert_eq!(s.on_ack(0xfffe), AckOutcome::Duplicate);
        assert_eq!(s.on_ack(1), AckOutcome::Advanced(1));
        assert!(s.is_done());
    }

    #[test]
    fn wire_seq_wraps() {
        assert_eq!(wire_seq(0xffff), 0xffff);
        assert_eq!(wire_seq(0x1_0000), 0);
        assert_eq!(wire_seq(0x1_0005), 5);
    }
}
