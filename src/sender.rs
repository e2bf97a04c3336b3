//! Send-side ARQ engine.
//!
//! [`SenderEngine`] keeps a sliding window of up to `N` in-flight segments and
//! drives one batch of segments to full acknowledgement.  The same engine runs
//! every [`ArqMode`](crate::config::ArqMode):
//!
//! - **Per-segment ACKs** (selective repeat, stop-and-wait): ACK `s` marks
//!   slot `s`; `base` slides only over a contiguous run of acknowledged slots.
//! - **Cumulative ACKs** (go-back-N): ACK `s` confirms everything below `s`.
//! - On timeout either the expired segment alone is resent, or every
//!   unacknowledged segment in the window is.
//!
//! # Sequence-number layout
//!
//! ```text
//!   first       base                next               end
//!     │           │                   │                  │
//!  ───┼───────────┼───────────────────┼──────────────────┼──▶ seq space
//!     │  acked    │ <── in flight ──▶ │ <── sendable ──▶ │
//! ```
//!
//! Invariant: `next - base <= window` at every point of the loop.

use std::net::SocketAddr;
use std::ops::Range;
use std::time::Duration;

use tokio::time::Instant;

use crate::channel::Channel;
use crate::config::{AckPolicy, RetransmitPolicy, TransferConfig};
use crate::error::{Result, TransferError};
use crate::packet::{Message, Segment, MAX_PACKET_LEN};

/// Shortest wait handed to the channel; keeps the loop from spinning when a
/// deadline is due right now.
const MIN_WAIT: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

/// Per-segment bookkeeping for one in-flight position.
#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    acked: bool,
    /// Time of the most recent transmission.
    sent_at: Option<Instant>,
    /// Total number of transmissions, the first one included.
    tx_count: u32,
}

impl Slot {
    fn deadline(&self, timeout: Duration) -> Option<Instant> {
        match (self.acked, self.sent_at) {
            (false, Some(at)) => Some(at + timeout),
            _ => None,
        }
    }
}

/// Counters accumulated over the engine's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    pub transmissions: u64,
    pub retransmissions: u64,
    pub acks_received: u64,
    pub duplicate_acks: u64,
    /// Datagrams dropped for failing decode or the integrity check.
    pub corrupt_acks: u64,
}

// ---------------------------------------------------------------------------
// SenderEngine
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SenderEngine {
    window: usize,
    ack_policy: AckPolicy,
    retransmit_policy: RetransmitPolicy,
    timeout: Duration,
    poll_interval: Duration,
    max_retries: Option<u32>,

    /// Sequence number of the first submitted segment.
    first: u32,
    /// Oldest unacknowledged sequence number (left window edge).
    base: u32,
    /// Next sequence number to put on the wire.
    next: u32,
    /// Encoded datagrams, indexed by `seq - first`; released once acknowledged.
    frames: Vec<Option<Vec<u8>>>,
    /// Payload length of each submitted segment, for progress reporting.
    lens: Vec<usize>,
    /// Indexed by `(seq - first) % slots.len()`.
    slots: Vec<Slot>,

    stats: SenderStats,
}

impl SenderEngine {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            window: config.send_window().max(1),
            ack_policy: config.mode.ack_policy(),
            retransmit_policy: config.mode.retransmit_policy(),
            timeout: config.timeout,
            poll_interval: config.poll_interval,
            max_retries: config.max_retries,
            first: 0,
            base: 0,
            next: 0,
            frames: Vec::new(),
            lens: Vec::new(),
            slots: Vec::new(),
            stats: SenderStats::default(),
        }
    }

    /// Load the ordered batch to transfer.  Nothing is transmitted yet.
    ///
    /// Sequence numbers must be consecutive.  Replaces any previous batch.
    pub fn submit(&mut self, segments: Vec<Segment>) -> Result<()> {
        let first = segments.first().map_or(self.end(), Segment::seq);
        for (i, seg) in segments.iter().enumerate() {
            if u64::from(seg.seq()) != u64::from(first) + i as u64 {
                return Err(TransferError::Config(format!(
                    "segment {} out of order in batch starting at {first}",
                    seg.seq()
                )));
            }
        }

        self.first = first;
        self.base = first;
        self.next = first;
        self.lens = segments.iter().map(Segment::len).collect();
        self.frames = segments
            .into_iter()
            .map(|s| Some(Message::Segment(s).encode()))
            .collect();
        // Never more slots than segments: the table is allocated once per batch.
        self.slots = vec![Slot::default(); self.window.min(self.frames.len()).max(1)];
        Ok(())
    }

    /// One past the last submitted sequence number.
    pub fn end(&self) -> u32 {
        self.first + self.frames.len() as u32
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn next_seq(&self) -> u32 {
        self.next
    }

    pub fn in_flight(&self) -> usize {
        (self.next - self.base) as usize
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// `true` once every submitted segment is acknowledged.
    pub fn is_done(&self) -> bool {
        self.base == self.end()
    }

    pub fn stats(&self) -> SenderStats {
        self.stats
    }

    /// Payload length of submitted segment `seq`.
    pub fn payload_len(&self, seq: u32) -> usize {
        self.lens[(seq - self.first) as usize]
    }

    fn slot_index(&self, seq: u32) -> usize {
        (seq - self.first) as usize % self.slots.len()
    }

    // -----------------------------------------------------------------------
    // ACK processing
    // -----------------------------------------------------------------------

    /// Apply one valid ACK and return the sequence numbers it newly confirmed.
    ///
    /// An empty range means the ACK was a duplicate or out of range; applying
    /// the same ACK twice never moves `base` further than applying it once.
    pub fn on_ack(&mut self, seq: u32) -> Range<u32> {
        match self.ack_policy {
            AckPolicy::PerSegment => {
                if seq < self.base || seq >= self.next {
                    return seq..seq;
                }
                let idx = self.slot_index(seq);
                if self.slots[idx].acked {
                    return seq..seq;
                }
                self.slots[idx].acked = true;
                self.release(seq);
                while self.base < self.next && self.slots[self.slot_index(self.base)].acked {
                    self.base += 1;
                }
                seq..seq + 1
            }
            AckPolicy::Cumulative => {
                // `seq` is the receiver's next expected sequence number.
                if seq <= self.base || seq > self.next {
                    return seq..seq;
                }
                let newly = self.base..seq;
                for s in newly.clone() {
                    let idx = self.slot_index(s);
                    self.slots[idx].acked = true;
                    self.release(s);
                }
                self.base = seq;
                newly
            }
        }
    }

    fn release(&mut self, seq: u32) {
        self.frames[(seq - self.first) as usize] = None;
    }

    /// Encoded frames still held for possible retransmission.
    #[cfg(test)]
    fn retained(&self) -> usize {
        self.frames.iter().filter(|f| f.is_some()).count()
    }

    // -----------------------------------------------------------------------
    // Engine loop
    // -----------------------------------------------------------------------

    /// Transmit, collect ACKs and retransmit until the whole batch is
    /// acknowledged.
    ///
    /// `on_acked(seq, payload_len)` runs once for every segment the first time
    /// it is confirmed.  Datagrams from any address but `peer` are ignored.
    pub async fn run_to_completion<C, F>(
        &mut self,
        channel: &C,
        peer: SocketAddr,
        mut on_acked: F,
    ) -> Result<()>
    where
        C: Channel,
        F: FnMut(u32, usize),
    {
        let mut buf = vec![0u8; MAX_PACKET_LEN];

        while !self.is_done() {
            self.fill(channel, peer).await?;

            // The first receive waits up to the next deadline; later ones only
            // drain what is already queued.
            let mut wait = self.next_wait();
            while let Some((n, from)) = channel.recv_from(&mut buf, wait).await? {
                wait = Duration::ZERO;
                if from != peer {
                    log::debug!("[sender] ignoring datagram from {from}");
                    continue;
                }
                self.handle_datagram(&buf[..n], &mut on_acked);
            }

            if !self.is_done() {
                self.retransmit_expired(channel, peer).await?;
            }
        }
        Ok(())
    }

    /// Put new segments on the wire while the window has room.
    async fn fill<C: Channel>(&mut self, channel: &C, peer: SocketAddr) -> Result<()> {
        while self.next < self.end() && self.in_flight() < self.window {
            let seq = self.next;
            let idx = self.slot_index(seq);
            self.slots[idx] = Slot::default();
            self.transmit(channel, peer, seq).await?;
            self.next += 1;
            debug_assert!(
                self.in_flight() <= self.window,
                "window overrun ({} / {})",
                self.in_flight(),
                self.window
            );
            log::debug!(
                "[sender] → seq={seq} in_flight={}/{}",
                self.in_flight(),
                self.window
            );
        }
        Ok(())
    }

    fn handle_datagram<F: FnMut(u32, usize)>(&mut self, raw: &[u8], on_acked: &mut F) {
        let decoded = match Message::decode(raw) {
            Ok(d) => d,
            Err(e) => {
                self.stats.corrupt_acks += 1;
                log::warn!("[sender] dropping {e}");
                return;
            }
        };
        if !decoded.intact {
            self.stats.corrupt_acks += 1;
            log::warn!("[sender] dropping corrupt ACK");
            return;
        }
        let Message::Ack { seq } = decoded.message else {
            log::debug!("[sender] ignoring non-ACK {:?}", decoded.message.kind());
            return;
        };

        self.stats.acks_received += 1;
        let newly = self.on_ack(seq);
        if newly.is_empty() {
            self.stats.duplicate_acks += 1;
            log::debug!("[sender] ← ACK {seq} (duplicate)");
            return;
        }
        log::debug!("[sender] ← ACK {seq} base={}", self.base);
        for s in newly {
            on_acked(s, self.payload_len(s));
        }
    }

    /// Resend whatever has been waiting longer than the timeout.
    async fn retransmit_expired<C: Channel>(&mut self, channel: &C, peer: SocketAddr) -> Result<()> {
        let now = Instant::now();
        let timeout = self.timeout;
        let expired = move |slot: &Slot| slot.deadline(timeout).is_some_and(|d| d <= now);

        match self.retransmit_policy {
            RetransmitPolicy::SingleSegment => {
                let due: Vec<u32> = (self.base..self.next)
                    .filter(|&s| expired(&self.slots[self.slot_index(s)]))
                    .collect();
                for seq in due {
                    self.retransmit(channel, peer, seq).await?;
                }
            }
            RetransmitPolicy::WholeWindow => {
                let any_due = (self.base..self.next).any(|s| expired(&self.slots[self.slot_index(s)]));
                if any_due {
                    log::debug!("[sender] timeout: resending window {}..{}", self.base, self.next);
                    for seq in self.base..self.next {
                        if !self.slots[self.slot_index(seq)].acked {
                            self.retransmit(channel, peer, seq).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn retransmit<C: Channel>(&mut self, channel: &C, peer: SocketAddr, seq: u32) -> Result<()> {
        let attempts = self.slots[self.slot_index(seq)].tx_count;
        if let Some(max) = self.max_retries {
            if attempts > max {
                return Err(TransferError::RetryExhausted { seq, attempts });
            }
        }
        log::debug!("[sender] ↻ seq={seq} attempt={}", attempts + 1);
        self.stats.retransmissions += 1;
        self.transmit(channel, peer, seq).await
    }

    async fn transmit<C: Channel>(&mut self, channel: &C, peer: SocketAddr, seq: u32) -> Result<()> {
        let Some(frame) = &self.frames[(seq - self.first) as usize] else {
            debug_assert!(false, "transmit of released seq {seq}");
            return Ok(());
        };
        channel.send_to(frame, peer).await?;
        let idx = self.slot_index(seq);
        let slot = &mut self.slots[idx];
        slot.sent_at = Some(Instant::now());
        slot.tx_count += 1;
        self.stats.transmissions += 1;
        Ok(())
    }

    /// How long the next receive may block: until the earliest retransmit
    /// deadline, capped by the poll interval.
    fn next_wait(&self) -> Duration {
        let earliest = (self.base..self.next)
            .filter_map(|s| self.slots[self.slot_index(s)].deadline(self.timeout))
            .min();
        match earliest {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(self.poll_interval)
                .max(MIN_WAIT),
            None => self.poll_interval.max(MIN_WAIT),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArqMode;

    fn segments(first: u32, count: u32) -> Vec<Segment> {
        (first..first + count)
            .map(|s| Segment::data(s, vec![s as u8; 10]).unwrap())
            .collect()
    }

    fn engine(mode: ArqMode, window: usize) -> SenderEngine {
        SenderEngine::new(&TransferConfig {
            mode,
            window_size: window,
            ..Default::default()
        })
    }

    /// Pretend the fill phase ran without touching a channel.
    fn mark_sent(e: &mut SenderEngine, upto: u32) {
        while e.next < upto {
            let idx = e.slot_index(e.next);
            e.slots[idx] = Slot {
                acked: false,
                sent_at: Some(Instant::now()),
                tx_count: 1,
            };
            e.next += 1;
        }
    }

    #[test]
    fn submit_sets_edges() {
        let mut e = engine(ArqMode::SelectiveRepeat, 4);
        e.submit(segments(5, 3)).unwrap();
        assert_eq!(e.base(), 5);
        assert_eq!(e.next_seq(), 5);
        assert_eq!(e.end(), 8);
        assert_eq!(e.in_flight(), 0);
        assert!(!e.is_done());
    }

    #[test]
    fn submit_rejects_gaps() {
        let mut e = engine(ArqMode::SelectiveRepeat, 4);
        let mut segs = segments(0, 3);
        segs.remove(1);
        assert!(matches!(e.submit(segs), Err(TransferError::Config(_))));
    }

    #[test]
    fn empty_batch_is_done() {
        let mut e = engine(ArqMode::SelectiveRepeat, 4);
        e.submit(segments(3, 1)).unwrap();
        e.submit(Vec::new()).unwrap();
        assert!(e.is_done());
    }

    #[test]
    fn selective_ack_out_of_order_holds_base() {
        let mut e = engine(ArqMode::SelectiveRepeat, 4);
        e.submit(segments(0, 4)).unwrap();
        mark_sent(&mut e, 4);

        assert_eq!(e.on_ack(2), 2..3);
        assert_eq!(e.base(), 0);
        assert_eq!(e.on_ack(1), 1..2);
        assert_eq!(e.base(), 0);
        assert_eq!(e.on_ack(0), 0..1);
        // Slides over the already-acknowledged 1 and 2.
        assert_eq!(e.base(), 3);
    }

    #[test]
    fn duplicate_ack_is_idempotent() {
        let mut e = engine(ArqMode::SelectiveRepeat, 4);
        e.submit(segments(0, 3)).unwrap();
        mark_sent(&mut e, 3);

        assert_eq!(e.on_ack(1), 1..2);
        let base_once = e.base();
        assert!(e.on_ack(1).is_empty());
        assert_eq!(e.base(), base_once);

        assert_eq!(e.on_ack(0), 0..1);
        assert!(e.on_ack(0).is_empty());
        assert_eq!(e.base(), 2);
    }

    #[test]
    fn ack_outside_window_ignored() {
        let mut e = engine(ArqMode::SelectiveRepeat, 2);
        e.submit(segments(0, 5)).unwrap();
        mark_sent(&mut e, 2);

        assert!(e.on_ack(3).is_empty(), "not sent yet");
        assert!(e.on_ack(99).is_empty());
        assert_eq!(e.base(), 0);
    }

    #[test]
    fn cumulative_ack_slides_multiple() {
        let mut e = engine(ArqMode::GoBackN, 4);
        e.submit(segments(1, 4)).unwrap();
        mark_sent(&mut e, 5);

        assert_eq!(e.on_ack(3), 1..3);
        assert_eq!(e.base(), 3);
        assert!(e.on_ack(3).is_empty(), "same cumulative value twice");
        assert!(e.on_ack(2).is_empty(), "behind base");
        assert!(e.on_ack(6).is_empty(), "beyond next");
        assert_eq!(e.on_ack(5), 3..5);
        assert!(e.is_done());
    }

    #[test]
    fn acknowledged_frames_are_released() {
        let mut e = engine(ArqMode::SelectiveRepeat, 4);
        e.submit(segments(0, 6)).unwrap();
        mark_sent(&mut e, 4);
        assert_eq!(e.retained(), 6);

        e.on_ack(2);
        assert_eq!(e.retained(), 5);
        e.on_ack(0);
        e.on_ack(1);
        assert_eq!(e.retained(), 3);

        let mut g = engine(ArqMode::GoBackN, 4);
        g.submit(segments(1, 4)).unwrap();
        mark_sent(&mut g, 5);
        g.on_ack(4);
        assert_eq!(g.retained(), 1);
    }

    #[test]
    fn stop_and_wait_window_is_one() {
        let e = engine(ArqMode::StopAndWait, 8);
        assert_eq!(e.window(), 1);
    }

    #[test]
    fn slot_table_bounded_by_batch() {
        let mut e = engine(ArqMode::SelectiveRepeat, 64);
        e.submit(segments(0, 3)).unwrap();
        assert_eq!(e.slots.len(), 3);
        e.submit(segments(3, 100)).unwrap();
        assert_eq!(e.slots.len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn next_wait_tracks_earliest_deadline() {
        let mut e = SenderEngine::new(&TransferConfig {
            timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(500),
            ..Default::default()
        });
        e.submit(segments(0, 2)).unwrap();
        mark_sent(&mut e, 1);
        tokio::time::advance(Duration::from_millis(150)).await;
        mark_sent(&mut e, 2);

        assert_eq!(e.next_wait(), Duration::from_millis(50));
        tokio::time::advance(Duration::from_millis(80)).await;
        assert_eq!(e.next_wait(), MIN_WAIT);
    }
}
