//! Window containers: the three FIFO queues the protocol is built on.
//!
//! - [`SendWindow`]: the sender's unacknowledged segments, oldest first,
//!   with a cursor marking how many of them have been transmitted.
//! - [`ReorderBuffer`]: the receiver's out-of-order segments in arrival
//!   order, bounded by the advertised receive window.
//! - [`DelayQueue`]: the emulator's packets waiting out their propagation
//!   delay, ordered by absolute expiry.
//!
//! Each segment is owned by exactly one container and is dropped the moment
//! it leaves it.  These types only manage state; all socket I/O is the
//! caller's responsibility.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::packet::{seq_le, seq_lt, Packet};

// ---------------------------------------------------------------------------
// SendWindow
// ---------------------------------------------------------------------------

/// Sender-side window of unacknowledged segments.
///
/// ```text
///  front (oldest)                                   back (newest)
///  ┌──────┬──────┬──────┬──────┬──────┐
///  │ sent │ sent │ sent │unsent│unsent│
///  └──────┴──────┴──────┴──────┴──────┘
///                       ▲
///                    sent == 3
/// ```
#[derive(Debug, Default)]
pub struct SendWindow {
    segments: VecDeque<Packet>,
    /// Number of segments at the front that have been transmitted.
    sent: usize,
}

impl SendWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total segments held, sent or not (`current_window_size`).
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segments transmitted and still unacknowledged.
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Append a segment at the back; it starts out unsent.
    pub fn push(&mut self, packet: Packet) {
        self.segments.push_back(packet);
    }

    /// Oldest unacknowledged segment.
    pub fn front(&self) -> Option<&Packet> {
        self.segments.front()
    }

    /// Drop every segment whose data ends at or before `ack`.
    ///
    /// Returns the number of segments removed.
    pub fn acknowledge(&mut self, ack: u32) -> usize {
        let mut removed = 0;
        while let Some(front) = self.segments.front() {
            if !seq_le(front.end_seq(), ack) {
                break;
            }
            self.segments.pop_front();
            removed += 1;
        }
        self.sent = self.sent.saturating_sub(removed);
        removed
    }

    /// Mark unsent segments as sent until `limit` segments are in flight,
    /// returning copies of the newly eligible ones in window order.
    ///
    /// Stamps each with the current congestion window so the peer's log
    /// shows the value in force when it left.
    pub fn take_unsent(&mut self, limit: usize, window: u32) -> Vec<Packet> {
        let upto = limit.min(self.segments.len());
        let mut out = Vec::new();
        while self.sent < upto {
            let seg = &mut self.segments[self.sent];
            seg.window = window;
            out.push(seg.clone());
            self.sent += 1;
        }
        out
    }

    /// Copy of the oldest segment for retransmission, stamped with `window`.
    pub fn head_for_retransmit(&mut self, window: u32) -> Option<Packet> {
        let head = self.segments.front_mut()?;
        head.window = window;
        Some(head.clone())
    }

    /// Treat everything after the head as not yet transmitted.
    ///
    /// Used after a timeout: only the head is retransmitted right away and
    /// the rest goes out again as the window regrows.
    pub fn rewind_to_head(&mut self) {
        self.sent = self.sent.min(1);
    }

    /// Forget every segment, sent or not.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.sent = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.segments.iter()
    }
}

// ---------------------------------------------------------------------------
// ReorderBuffer
// ---------------------------------------------------------------------------

/// Receiver-side buffer of out-of-order segments.
///
/// Every buffered segment consumes one credit of the receive window, so
/// `used() + free() == capacity()` holds at every point.
#[derive(Debug)]
pub struct ReorderBuffer {
    segments: VecDeque<Packet>,
    capacity: usize,
}

/// Outcome of [`ReorderBuffer::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOutcome {
    Buffered,
    /// Same sequence number already held; nothing consumed.
    Duplicate,
    /// No credit left; segment dropped.
    Full,
}

impl ReorderBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            segments: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Total receive window, in segments.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Credits consumed by buffered segments.
    pub fn used(&self) -> usize {
        self.segments.len()
    }

    /// Credits still available; advertised as the receive window.
    pub fn free(&self) -> usize {
        self.capacity - self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Buffer `packet` at the tail if credit remains.
    pub fn insert(&mut self, packet: Packet) -> BufferOutcome {
        if self.segments.iter().any(|p| p.seq == packet.seq) {
            return BufferOutcome::Duplicate;
        }
        if self.free() == 0 {
            return BufferOutcome::Full;
        }
        self.segments.push_back(packet);
        BufferOutcome::Buffered
    }

    /// Remove and return the buffered segment starting at `seq`, if any.
    pub fn take(&mut self, seq: u32) -> Option<Packet> {
        let pos = self.segments.iter().position(|p| p.seq == seq)?;
        self.segments.remove(pos)
    }

    /// Drop segments that start before `expected`; they can never be
    /// delivered.  Returns how many were discarded.
    pub fn discard_before(&mut self, expected: u32) -> usize {
        let before = self.segments.len();
        self.segments.retain(|p| !seq_lt(p.seq, expected));
        before - self.segments.len()
    }
}

// ---------------------------------------------------------------------------
// DelayQueue
// ---------------------------------------------------------------------------

/// A packet waiting out its propagation delay.
#[derive(Debug, Clone)]
pub struct Delayed<T> {
    pub packet: Packet,
    /// Where the packet goes when it expires.
    pub route: T,
    pub deadline: Instant,
}

/// Pending deliveries ordered by absolute expiry.
///
/// With a constant delay every arrival lands at the tail, so the queue is a
/// plain delay line; entries with equal deadlines stay FIFO.
#[derive(Debug)]
pub struct DelayQueue<T> {
    entries: VecDeque<Delayed<T>>,
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue `packet` for delivery at `deadline`, after any entry expiring
    /// at or before it.
    pub fn push(&mut self, packet: Packet, route: T, deadline: Instant) {
        let pos = self.entries.partition_point(|e| e.deadline <= deadline);
        self.entries.insert(
            pos,
            Delayed {
                packet,
                route,
                deadline,
            },
        );
    }

    pub fn iter(&self) -> impl Iterator<Item = &Delayed<T>> {
        self.entries.iter()
    }

    /// Expiry of the head entry; what the single timer should be armed for.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.front().map(|e| e.deadline)
    }

    /// Pop the head if it has expired by `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<Delayed<T>> {
        if self.entries.front()?.deadline <= now {
            self.entries.pop_front()
        } else {
            None
        }
    }
}
