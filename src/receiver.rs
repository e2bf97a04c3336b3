//! Receive-side ARQ engine.
//!
//! [`ReceiverEngine`] turns raw datagrams into in-order sink writes:
//!
//! - Segments inside `[receive_base, receive_base + window)` are buffered in
//!   a slot table indexed by `seq % window`, and acknowledged.
//! - Whenever the slot at `receive_base` is filled, a delivery sweep hands
//!   consecutive payloads to the [`Sink`] and slides the window.
//! - Segments below `receive_base` were delivered already: ACK again, never
//!   write again.
//! - Segments beyond the window and anything failing the checksum are dropped
//!   without an ACK; the sender's timer recovers them.
//!
//! Sequence 0 carries the metadata text rather than file bytes.  An in-order
//! DIGEST segment finishes the sink and produces a [`DigestVerdict`].
//!
//! This module only manages state; the caller sends the ACKs it returns.

use crate::checksum::Digest;
use crate::config::{AckPolicy, TransferConfig};
use crate::error::Result;
use crate::files::Sink;
use crate::packet::{Message, Segment, SegmentKind};
use crate::segment::{Metadata, DEFAULT_NAME};
use crate::state::Phase;

/// What happened to one incoming datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Could not be framed at all.
    Malformed,
    /// Framed, but the checksum does not verify.
    Corrupt,
    /// An ACK or other message a receiver has no use for.
    Stray,
    /// Stored out of order; waiting for a gap to fill.
    Buffered,
    /// Filled the gap at `receive_base`; `segments` payloads were delivered.
    Delivered { segments: usize },
    /// Already buffered or delivered.
    Duplicate,
    /// Beyond the receive window, or arriving after completion.
    OutOfWindow,
}

/// Result of [`ReceiverEngine::on_packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reception {
    pub disposition: Disposition,
    /// Sequence number to acknowledge, if any.
    pub ack: Option<u32>,
}

impl Reception {
    fn silent(disposition: Disposition) -> Self {
        Self {
            disposition,
            ack: None,
        }
    }
}

/// Outcome of the end-to-end digest comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestVerdict {
    /// Digest carried by the DIGEST segment.
    pub expected: Vec<u8>,
    /// Digest of the output as written.
    pub actual: Digest,
}

impl DigestVerdict {
    pub fn matches(&self) -> bool {
        Digest::from_slice(&self.expected) == Some(self.actual)
    }
}

#[derive(Debug)]
pub struct ReceiverEngine<S> {
    sink: S,
    window: usize,
    ack_policy: AckPolicy,
    /// Next sequence number to deliver.
    receive_base: u32,
    /// Indexed by `seq % window`; `Some` means filled.
    slots: Vec<Option<Segment>>,
    phase: Phase,
    metadata: Option<Metadata>,
    bytes_written: u64,
    verdict: Option<DigestVerdict>,
}

impl<S: Sink> ReceiverEngine<S> {
    pub fn new(sink: S, config: &TransferConfig) -> Self {
        let window = config.receive_window().max(1);
        Self {
            sink,
            window,
            ack_policy: config.mode.ack_policy(),
            receive_base: 0,
            slots: vec![None; window],
            phase: Phase::AwaitingMetadata,
            metadata: None,
            bytes_written: 0,
            verdict: None,
        }
    }

    /// Process one raw datagram.
    ///
    /// Errors come only from the sink; they move the engine to
    /// [`Phase::Failed`].
    pub fn on_packet(&mut self, raw: &[u8]) -> Result<Reception> {
        let result = self.process(raw);
        if result.is_err() {
            self.abort();
        }
        result
    }

    fn process(&mut self, raw: &[u8]) -> Result<Reception> {
        let decoded = match Message::decode(raw) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("[receiver] dropping {e}");
                return Ok(Reception::silent(Disposition::Malformed));
            }
        };
        if !decoded.intact {
            log::warn!(
                "[receiver] dropping corrupt {:?} seq={}",
                decoded.message.kind(),
                decoded.message.seq()
            );
            return Ok(Reception::silent(Disposition::Corrupt));
        }
        let Message::Segment(segment) = decoded.message else {
            return Ok(Reception::silent(Disposition::Stray));
        };

        let seq = segment.seq();
        // Sequence 0 is reserved for the metadata DATA segment.
        if seq == 0 && segment.kind() == SegmentKind::Digest {
            log::warn!("[receiver] dropping DIGEST at seq 0");
            return Ok(Reception::silent(Disposition::Stray));
        }
        if seq < self.receive_base {
            log::debug!("[receiver] ← seq={seq} already delivered");
            return Ok(Reception {
                disposition: Disposition::Duplicate,
                ack: Some(self.ack_for(seq)),
            });
        }

        let offset = (seq - self.receive_base) as usize;
        if offset >= self.window || self.phase.is_terminal() {
            log::debug!(
                "[receiver] ← seq={seq} outside window [{}, +{})",
                self.receive_base,
                self.window
            );
            // A cumulative receiver restates how far it got.
            let ack = match self.ack_policy {
                AckPolicy::Cumulative if !self.phase.is_terminal() => Some(self.receive_base),
                _ => None,
            };
            return Ok(Reception {
                disposition: Disposition::OutOfWindow,
                ack,
            });
        }

        let idx = seq as usize % self.window;
        if self.slots[idx].is_some() {
            log::debug!("[receiver] ← seq={seq} already buffered");
            return Ok(Reception {
                disposition: Disposition::Duplicate,
                ack: Some(self.ack_for(seq)),
            });
        }
        self.slots[idx] = Some(segment);

        let delivered = self.sweep()?;
        log::debug!(
            "[receiver] ← seq={seq} delivered={delivered} base={}",
            self.receive_base
        );
        let disposition = if delivered > 0 {
            Disposition::Delivered {
                segments: delivered,
            }
        } else {
            Disposition::Buffered
        };
        Ok(Reception {
            disposition,
            ack: Some(self.ack_for(seq)),
        })
    }

    fn ack_for(&self, seq: u32) -> u32 {
        match self.ack_policy {
            AckPolicy::PerSegment => seq,
            AckPolicy::Cumulative => self.receive_base,
        }
    }

    /// Deliver the contiguous run of filled slots starting at `receive_base`.
    fn sweep(&mut self) -> Result<usize> {
        let mut delivered = 0;
        while !self.phase.is_terminal() {
            let idx = self.receive_base as usize % self.window;
            let Some(segment) = self.slots[idx].take() else {
                break;
            };
            self.deliver(segment)?;
            self.receive_base += 1;
            delivered += 1;
        }
        Ok(delivered)
    }

    fn deliver(&mut self, segment: Segment) -> Result<()> {
        match (segment.kind(), self.phase) {
            (SegmentKind::Data, Phase::AwaitingMetadata) => {
                let metadata = Metadata::parse(segment.payload()).unwrap_or_else(|| {
                    log::warn!("[receiver] unreadable metadata, writing to {DEFAULT_NAME}");
                    Metadata::new(DEFAULT_NAME, 0)
                });
                log::info!(
                    "[receiver] incoming {} ({} bytes)",
                    metadata.name,
                    metadata.size
                );
                self.sink.begin(&metadata)?;
                self.metadata = Some(metadata);
                self.advance(Phase::TransferringData);
                self.check_all_data_in();
            }
            // Only seq 0 is delivered before metadata, and a DIGEST there is
            // refused at intake.
            (SegmentKind::Digest, Phase::AwaitingMetadata) => {}
            (SegmentKind::Data, _) => {
                self.sink.write_chunk(segment.payload())?;
                self.bytes_written += segment.len() as u64;
                self.check_all_data_in();
            }
            (SegmentKind::Digest, _) => {
                if self.phase == Phase::TransferringData {
                    self.advance(Phase::AwaitingDigest);
                }
                let actual = self.sink.finish()?;
                let verdict = DigestVerdict {
                    expected: segment.into_payload(),
                    actual,
                };
                if verdict.matches() {
                    log::info!("[receiver] digest verified: {}", verdict.actual);
                } else {
                    log::warn!(
                        "[receiver] digest mismatch: expected {}, got {}",
                        hex::encode(&verdict.expected),
                        verdict.actual
                    );
                }
                self.verdict = Some(verdict);
                self.advance(Phase::Complete);
            }
        }
        Ok(())
    }

    fn check_all_data_in(&mut self) {
        let declared = self.metadata.as_ref().map_or(0, |m| m.size);
        if self.phase == Phase::TransferringData && self.bytes_written >= declared {
            self.advance(Phase::AwaitingDigest);
        }
    }

    fn advance(&mut self, next: Phase) {
        if !self.phase.can_advance_to(next) {
            log::warn!("[receiver] ignoring transition {} → {next}", self.phase);
            return;
        }
        log::info!("[receiver] {} → {next}", self.phase);
        self.phase = next;
    }

    /// Move to [`Phase::Failed`] unless already finished.
    pub fn abort(&mut self) {
        if !self.phase.is_terminal() {
            self.advance(Phase::Failed);
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    pub fn receive_base(&self) -> u32 {
        self.receive_base
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn verdict(&self) -> Option<&DigestVerdict> {
        self.verdict.as_ref()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::digest_of_stream;
    use crate::config::ArqMode;
    use crate::files::MemorySink;

    fn engine(mode: ArqMode, window: usize) -> ReceiverEngine<MemorySink> {
        let config = TransferConfig {
            mode,
            window_size: window,
            ..Default::default()
        };
        ReceiverEngine::new(MemorySink::new(), &config)
    }

    fn meta(size: u64) -> Vec<u8> {
        Message::Segment(Segment::data(0, Metadata::new("f.bin", size).encode()).unwrap()).encode()
    }

    fn data(seq: u32, payload: &[u8]) -> Vec<u8> {
        Message::Segment(Segment::data(seq, payload.to_vec()).unwrap()).encode()
    }

    fn digest(seq: u32, bytes: &[u8]) -> Vec<u8> {
        Message::Segment(Segment::digest(seq, bytes).unwrap()).encode()
    }

    #[test]
    fn metadata_opens_sink() {
        let mut r = engine(ArqMode::SelectiveRepeat, 4);
        let rx = r.on_packet(&meta(6)).unwrap();
        assert_eq!(rx.disposition, Disposition::Delivered { segments: 1 });
        assert_eq!(rx.ack, Some(0));
        assert_eq!(r.metadata(), Some(&Metadata::new("f.bin", 6)));
        assert_eq!(r.phase(), Phase::TransferringData);
        assert_eq!(r.sink().data, b"");
    }

    #[test]
    fn unreadable_metadata_falls_back_to_default_name() {
        let mut r = engine(ArqMode::SelectiveRepeat, 4);
        r.on_packet(&data(0, b"garbage")).unwrap();
        assert_eq!(r.metadata().unwrap().name, DEFAULT_NAME);
    }

    #[test]
    fn digest_in_metadata_position_is_refused() {
        let mut r = engine(ArqMode::SelectiveRepeat, 4);
        let rx = r.on_packet(&digest(0, &[0xAA; 32])).unwrap();
        assert_eq!(rx.disposition, Disposition::Stray);
        assert_eq!(rx.ack, None);
        assert_eq!(r.receive_base(), 0);
        assert_eq!(r.phase(), Phase::AwaitingMetadata);

        // The real metadata still takes seq 0, and data after it is file bytes.
        r.on_packet(&meta(3)).unwrap();
        r.on_packet(&data(1, b"abc")).unwrap();
        assert_eq!(r.metadata(), Some(&Metadata::new("f.bin", 3)));
        assert_eq!(r.sink().data, b"abc");
        assert_eq!(r.phase(), Phase::AwaitingDigest);
    }

    #[test]
    fn reordered_segment_buffered_until_gap_fills() {
        let mut r = engine(ArqMode::SelectiveRepeat, 4);
        r.on_packet(&meta(6)).unwrap();

        let rx = r.on_packet(&data(2, b"def")).unwrap();
        assert_eq!(rx.disposition, Disposition::Buffered);
        assert_eq!(rx.ack, Some(2));
        assert!(r.sink().data.is_empty());
        assert_eq!(r.receive_base(), 1);

        let rx = r.on_packet(&data(1, b"abc")).unwrap();
        assert_eq!(rx.disposition, Disposition::Delivered { segments: 2 });
        assert_eq!(rx.ack, Some(1));
        assert_eq!(r.sink().data, b"abcdef");
        assert_eq!(r.sink().writes, 2);
        assert_eq!(r.receive_base(), 3);
        assert_eq!(r.phase(), Phase::AwaitingDigest);
    }

    #[test]
    fn delivered_duplicate_is_acked_not_rewritten() {
        let mut r = engine(ArqMode::SelectiveRepeat, 4);
        r.on_packet(&meta(3)).unwrap();
        r.on_packet(&data(1, b"abc")).unwrap();

        let rx = r.on_packet(&data(1, b"abc")).unwrap();
        assert_eq!(rx.disposition, Disposition::Duplicate);
        assert_eq!(rx.ack, Some(1));
        assert_eq!(r.sink().data, b"abc");
        assert_eq!(r.sink().writes, 1);
    }

    #[test]
    fn buffered_duplicate_is_acked_again() {
        let mut r = engine(ArqMode::SelectiveRepeat, 4);
        r.on_packet(&meta(6)).unwrap();
        r.on_packet(&data(3, b"x")).unwrap();
        let rx = r.on_packet(&data(3, b"x")).unwrap();
        assert_eq!(rx.disposition, Disposition::Duplicate);
        assert_eq!(rx.ack, Some(3));
    }

    #[test]
    fn beyond_window_dropped_without_ack() {
        let mut r = engine(ArqMode::SelectiveRepeat, 2);
        r.on_packet(&meta(6)).unwrap();
        // Window is [1, 3).
        let rx = r.on_packet(&data(3, b"late")).unwrap();
        assert_eq!(rx.disposition, Disposition::OutOfWindow);
        assert_eq!(rx.ack, None);
        assert_eq!(r.receive_base(), 1);
    }

    #[test]
    fn corrupt_segment_dropped_without_ack() {
        let mut r = engine(ArqMode::SelectiveRepeat, 4);
        let mut raw = meta(6);
        let last = raw.len() - 1;
        raw[last] ^= 0x10;
        let rx = r.on_packet(&raw).unwrap();
        assert_eq!(rx, Reception::silent(Disposition::Corrupt));
        assert_eq!(r.phase(), Phase::AwaitingMetadata);
    }

    #[test]
    fn malformed_and_stray_dropped() {
        let mut r = engine(ArqMode::SelectiveRepeat, 4);
        assert_eq!(
            r.on_packet(&[1, 2, 3]).unwrap().disposition,
            Disposition::Malformed
        );
        assert_eq!(
            r.on_packet(&Message::ack(0).encode()).unwrap().disposition,
            Disposition::Stray
        );
    }

    #[test]
    fn matching_digest_completes() {
        let mut r = engine(ArqMode::SelectiveRepeat, 4);
        let expected = digest_of_stream(&b"abc"[..]).unwrap();
        r.on_packet(&meta(3)).unwrap();
        r.on_packet(&data(1, b"abc")).unwrap();
        let rx = r.on_packet(&digest(2, expected.as_bytes())).unwrap();

        assert_eq!(rx.ack, Some(2));
        assert!(r.is_complete());
        assert!(r.sink().finished);
        assert!(r.verdict().unwrap().matches());
    }

    #[test]
    fn digest_mismatch_keeps_output() {
        let mut r = engine(ArqMode::SelectiveRepeat, 4);
        r.on_packet(&meta(3)).unwrap();
        r.on_packet(&data(1, b"abc")).unwrap();
        r.on_packet(&digest(2, &[0u8; 32])).unwrap();

        assert!(r.is_complete());
        let verdict = r.verdict().unwrap();
        assert!(!verdict.matches());
        assert_eq!(verdict.actual, digest_of_stream(&b"abc"[..]).unwrap());
        assert_eq!(r.sink().data, b"abc");
    }

    #[test]
    fn nothing_accepted_after_completion() {
        let mut r = engine(ArqMode::SelectiveRepeat, 4);
        r.on_packet(&meta(0)).unwrap();
        r.on_packet(&digest(1, &[0u8; 32])).unwrap();
        assert!(r.is_complete());

        let rx = r.on_packet(&data(2, b"extra")).unwrap();
        assert_eq!(rx, Reception::silent(Disposition::OutOfWindow));
        // The digest itself is still re-acknowledged.
        assert_eq!(r.on_packet(&digest(1, &[0u8; 32])).unwrap().ack, Some(1));
    }

    #[test]
    fn cumulative_acks_carry_next_expected() {
        let mut r = engine(ArqMode::GoBackN, 8);
        assert_eq!(r.on_packet(&meta(6)).unwrap().ack, Some(1));

        // Go-back-N receivers take one segment at a time.
        let rx = r.on_packet(&data(2, b"def")).unwrap();
        assert_eq!(rx.disposition, Disposition::OutOfWindow);
        assert_eq!(rx.ack, Some(1));

        assert_eq!(r.on_packet(&data(1, b"abc")).unwrap().ack, Some(2));
        assert_eq!(r.on_packet(&data(1, b"abc")).unwrap().ack, Some(2));
        assert_eq!(r.sink().data, b"abc");
    }

    #[test]
    fn sink_failure_aborts() {
        struct Broken;
        impl Sink for Broken {
            fn begin(&mut self, _: &Metadata) -> std::io::Result<()> {
                Err(std::io::Error::other("disk full"))
            }
            fn write_chunk(&mut self, _: &[u8]) -> std::io::Result<()> {
                Ok(())
            }
            fn finish(&mut self) -> std::io::Result<Digest> {
                digest_of_stream(&b""[..])
            }
        }

        let mut r = ReceiverEngine::new(Broken, &TransferConfig::default());
        assert!(r.on_packet(&meta(1)).is_err());
        assert_eq!(r.phase(), Phase::Failed);
    }
}
