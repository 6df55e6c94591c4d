//! Reliable channel bookkeeping.
//!
//! [`RetransmitQueue`] is the sender side: every reliable packet in flight,
//! its retransmission timer, and the send window. [`ReorderBuffer`] is the
//! receiver side: it holds early arrivals and releases payloads in sequence
//! order, skipping gaps that fall out of the window.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::timing::backoff;
use crate::codec::SequenceNumber;

/// One reliable packet awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct InFlight {
    /// Sequence number of the packet.
    pub sequence: SequenceNumber,
    /// Payload, kept for retransmission.
    pub payload: Bytes,
    /// First transmission time.
    pub first_sent: Instant,
    /// Most recent transmission time.
    pub last_sent: Instant,
    /// Timeout before the next retransmission.
    pub rto: Duration,
    /// Number of times the packet has been sent.
    pub transmissions: u32,
}

impl InFlight {
    fn deadline(&self) -> Instant {
        self.last_sent + self.rto
    }
}

/// Result of processing an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The entry was removed. Carries an RTT sample if the packet was sent once.
    Acked(Option<Duration>),
    /// Nothing in flight has this sequence (already acked, or bogus).
    Unknown,
}

/// A packet ran out of retransmission attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitExhausted {
    /// The packet that gave up.
    pub sequence: SequenceNumber,
}

/// Sender-side window of unacknowledged reliable packets.
///
/// Slots are indexed by distance from the oldest unacknowledged sequence, so
/// lookups on ack are O(1). Acked slots become `None` until the front catches
/// up.
#[derive(Debug)]
pub struct RetransmitQueue {
    slots: VecDeque<Option<InFlight>>,
    window: u32,
    in_flight: usize,
}

impl RetransmitQueue {
    /// Create an empty queue limited to `window` outstanding sequences.
    pub fn new(window: u32) -> Self {
        Self {
            slots: VecDeque::new(),
            window,
            in_flight: 0,
        }
    }

    /// Number of unacknowledged packets.
    pub fn len(&self) -> usize {
        self.in_flight
    }

    /// Check if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.in_flight == 0
    }

    /// Oldest unacknowledged sequence.
    pub fn oldest(&self) -> Option<SequenceNumber> {
        self.slots.front().and_then(|s| s.as_ref()).map(|e| e.sequence)
    }

    /// Check if `next` may be transmitted without outrunning the receiver's window.
    pub fn can_send(&self, next: SequenceNumber) -> bool {
        match self.oldest() {
            None => true,
            Some(oldest) => next.distance_from(oldest) < self.window,
        }
    }

    /// Record a first transmission. Sequences must be pushed in order.
    pub fn push(&mut self, sequence: SequenceNumber, payload: Bytes, now: Instant, rto: Duration) {
        if let Some(oldest) = self.oldest() {
            let index = sequence.distance_from(oldest) as usize;
            while self.slots.len() < index {
                self.slots.push_back(None);
            }
        }
        self.slots.push_back(Some(InFlight {
            sequence,
            payload,
            first_sent: now,
            last_sent: now,
            rto,
            transmissions: 1,
        }));
        self.in_flight += 1;
    }

    /// Remove `sequence` from the window. Acking twice is a no-op.
    pub fn on_ack(&mut self, sequence: SequenceNumber, now: Instant) -> AckOutcome {
        let Some(oldest) = self.oldest() else {
            return AckOutcome::Unknown;
        };
        let index = sequence.distance_from(oldest) as usize;
        let Some(slot) = self.slots.get_mut(index) else {
            return AckOutcome::Unknown;
        };
        let Some(entry) = slot.take() else {
            return AckOutcome::Unknown;
        };
        self.in_flight -= 1;
        while matches!(self.slots.front(), Some(None)) {
            self.slots.pop_front();
        }

        // Karn: a retransmitted packet's ack is ambiguous.
        let sample =
            (entry.transmissions == 1).then(|| now.saturating_duration_since(entry.first_sent));
        AckOutcome::Acked(sample)
    }

    /// Collect packets whose timer expired, backing off their timeouts.
    ///
    /// Fails if a due packet was already retransmitted `max_retransmits` times.
    pub fn poll_retransmits(
        &mut self,
        now: Instant,
        max_retransmits: u32,
    ) -> Result<Vec<(SequenceNumber, Bytes)>, RetransmitExhausted> {
        let mut due = Vec::new();
        for entry in self.slots.iter_mut().flatten() {
            if now < entry.deadline() {
                continue;
            }
            if entry.transmissions > max_retransmits {
                return Err(RetransmitExhausted {
                    sequence: entry.sequence,
                });
            }
            entry.transmissions += 1;
            entry.last_sent = now;
            entry.rto = backoff(entry.rto);
            due.push((entry.sequence, entry.payload.clone()));
        }
        Ok(due)
    }

    /// Earliest retransmission deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().flatten().map(InFlight::deadline).min()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.in_flight = 0;
    }
}

/// What happened to one received reliable packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderOutcome {
    /// Payloads released to the application, in order.
    pub delivered: usize,
    /// Sequences given up on because they fell out of the window.
    pub skipped: u32,
    /// Packet was already delivered or already buffered.
    pub duplicate: bool,
}

/// Receiver-side reorder window.
#[derive(Debug)]
pub struct ReorderBuffer {
    next_expected: SequenceNumber,
    window: u32,
    pending: HashMap<SequenceNumber, Bytes>,
}

impl ReorderBuffer {
    /// Create a buffer expecting sequence 0 first.
    pub fn new(window: u32) -> Self {
        Self::starting_at(SequenceNumber::ZERO, window)
    }

    /// Create a buffer expecting `next_expected` first.
    pub fn starting_at(next_expected: SequenceNumber, window: u32) -> Self {
        Self {
            next_expected,
            window,
            pending: HashMap::new(),
        }
    }

    /// Next sequence to be delivered.
    pub fn next_expected(&self) -> SequenceNumber {
        self.next_expected
    }

    /// Early arrivals being held.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Accept a packet; deliverable payloads are appended to `out` in order.
    pub fn receive(
        &mut self,
        sequence: SequenceNumber,
        payload: Bytes,
        out: &mut Vec<Bytes>,
    ) -> ReorderOutcome {
        let mut outcome = ReorderOutcome::default();

        if sequence.is_before(self.next_expected) || self.pending.contains_key(&sequence) {
            outcome.duplicate = true;
            return outcome;
        }

        let distance = sequence.distance_from(self.next_expected);
        if distance >= self.window {
            let new_base = sequence.wrapping_sub(self.window - 1);
            let (delivered, skipped) = self.advance_to(new_base, out);
            outcome.delivered += delivered;
            outcome.skipped = skipped;
        }

        self.pending.insert(sequence, payload);
        outcome.delivered += self.release_contiguous(out);
        outcome
    }

    /// Move the window start to `new_base`, flushing what is buffered below it.
    fn advance_to(&mut self, new_base: SequenceNumber, out: &mut Vec<Bytes>) -> (usize, u32) {
        let base = self.next_expected;
        let shift = new_base.distance_from(base);

        let mut below: Vec<SequenceNumber> = self
            .pending
            .keys()
            .copied()
            .filter(|s| s.distance_from(base) < shift)
            .collect();
        below.sort_by_key(|s| s.distance_from(base));

        for seq in &below {
            if let Some(payload) = self.pending.remove(seq) {
                out.push(payload);
            }
        }
        self.next_expected = new_base;
        (below.len(), shift - below.len() as u32)
    }

    fn release_contiguous(&mut self, out: &mut Vec<Bytes>) -> usize {
        let mut delivered = 0;
        while let Some(payload) = self.pending.remove(&self.next_expected) {
            out.push(payload);
            self.next_expected = self.next_expected.next();
            delivered += 1;
        }
        delivered
    }
}
