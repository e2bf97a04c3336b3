//! Transfer sessions: the phase machine on top of the ARQ engines.
//!
//! # Architecture
//!
//! ```text
//!  send side                                receive side
//!  ─────────                                ────────────
//!  TransferPlan                             ReceiverSession
//!    │ seg 0 / data / digest                  ├── peer lock, idle timeout, linger
//!    ▼                                        ├── ReceiverEngine (slots, sweep)
//!  SenderSession ── Phase ──▶ report          │     └── Sink (FileSink / MemorySink)
//!    └── SenderEngine (window, timers)        │
//!          │                                  │
//!          └────────── Channel ◀──────────────┘
//! ```
//!
//! The sender runs three batches through one [`SenderEngine`]: segment 0 in
//! [`Phase::AwaitingMetadata`], the data segments in
//! [`Phase::TransferringData`], the DIGEST segment in
//! [`Phase::AwaitingDigest`].  Any error moves the session to
//! [`Phase::Failed`] and the report carries the progress made so far.
//!
//! ```ignore
//! let socket = Socket::bind("0.0.0.0:0".parse()?).await?;
//! let report = send_file(&socket, peer, Path::new("big.iso"), &config, |_| {}).await?;
//! assert!(report.is_complete());
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;

use crate::channel::Channel;
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::files::Sink;
use crate::packet::{Message, MAX_PACKET_LEN};
use crate::receiver::{DigestVerdict, Disposition, ReceiverEngine};
use crate::segment::{Metadata, TransferPlan};
use crate::sender::{SenderEngine, SenderStats};
use crate::state::Phase;

const MIN_WAIT: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Send side
// ---------------------------------------------------------------------------

/// Snapshot handed to the progress observer after each acknowledged data
/// segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub segments_acked: u64,
    pub bytes_acked: u64,
    pub total_bytes: u64,
}

/// Outcome of a send attempt.
#[derive(Debug)]
pub struct TransferReport {
    /// [`Phase::Complete`] or [`Phase::Failed`].
    pub phase: Phase,
    /// Data segments acknowledged.
    pub segments_acked: u64,
    pub bytes_acked: u64,
    pub total_bytes: u64,
    pub stats: SenderStats,
    /// Why the session failed, if it did.
    pub error: Option<TransferError>,
}

impl TransferReport {
    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    /// Turn a failed report into its error.
    pub fn into_result(mut self) -> Result<Self> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

/// Send side of one transfer.
pub struct SenderSession<'a, C> {
    channel: &'a C,
    peer: SocketAddr,
    config: TransferConfig,
    phase: Phase,
}

impl<'a, C: Channel> SenderSession<'a, C> {
    pub fn new(channel: &'a C, peer: SocketAddr, config: TransferConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            channel,
            peer,
            config,
            phase: Phase::AwaitingMetadata,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Drive `plan` through all three phases.
    ///
    /// The plan is consumed so each segment's memory is released as soon as
    /// it is acknowledged.  Never returns an error: failures are recorded in
    /// the report.
    pub async fn send<F>(&mut self, plan: TransferPlan, mut on_progress: F) -> TransferReport
    where
        F: FnMut(Progress),
    {
        let mut engine = SenderEngine::new(&self.config);
        let mut progress = Progress {
            total_bytes: plan.metadata.size,
            ..Progress::default()
        };
        log::info!(
            "[session] sending {} ({} bytes, {} segments) to {} using {}, window {}",
            plan.metadata.name,
            plan.metadata.size,
            plan.segment_count(),
            self.peer,
            self.config.mode,
            engine.window()
        );

        let outcome = self
            .run_phases(&mut engine, plan, &mut progress, &mut on_progress)
            .await;
        let error = match outcome {
            Ok(()) => {
                log::info!("[session] transfer complete: {:?}", engine.stats());
                None
            }
            Err(e) => {
                log::warn!(
                    "[session] transfer failed in {}: {e} ({} of {} bytes acknowledged)",
                    self.phase,
                    progress.bytes_acked,
                    progress.total_bytes
                );
                self.advance(Phase::Failed);
                Some(e)
            }
        };

        TransferReport {
            phase: self.phase,
            segments_acked: progress.segments_acked,
            bytes_acked: progress.bytes_acked,
            total_bytes: progress.total_bytes,
            stats: engine.stats(),
            error,
        }
    }

    async fn run_phases<F>(
        &mut self,
        engine: &mut SenderEngine,
        plan: TransferPlan,
        progress: &mut Progress,
        on_progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(Progress),
    {
        let TransferPlan {
            metadata_segment,
            data_segments,
            digest_segment,
            ..
        } = plan;

        engine.submit(vec![metadata_segment])?;
        engine.run_to_completion(self.channel, self.peer, |_, _| {}).await?;
        self.advance(Phase::TransferringData);

        engine.submit(data_segments)?;
        engine
            .run_to_completion(self.channel, self.peer, |_, len| {
                progress.segments_acked += 1;
                progress.bytes_acked += len as u64;
                on_progress(*progress);
            })
            .await?;
        self.advance(Phase::AwaitingDigest);

        engine.submit(vec![digest_segment])?;
        engine.run_to_completion(self.channel, self.peer, |_, _| {}).await?;
        self.advance(Phase::Complete);
        Ok(())
    }

    fn advance(&mut self, next: Phase) {
        if self.phase.can_advance_to(next) {
            log::info!("[session] {} → {next}", self.phase);
            self.phase = next;
        }
    }
}

/// Plan and send a file on disk.
///
/// Errors here are start-up failures (bad configuration, unreadable file);
/// transfer failures come back inside the report.
pub async fn send_file<C, F>(
    channel: &C,
    peer: SocketAddr,
    path: &Path,
    config: &TransferConfig,
    on_progress: F,
) -> Result<TransferReport>
where
    C: Channel,
    F: FnMut(Progress),
{
    let mut session = SenderSession::new(channel, peer, config.clone())?;
    let plan = TransferPlan::from_file(path, config.payload_len)?;
    Ok(session.send(plan, on_progress).await)
}

// ---------------------------------------------------------------------------
// Receive side
// ---------------------------------------------------------------------------

/// Outcome of a receive session.
#[derive(Debug)]
pub struct ReceiveReport {
    pub phase: Phase,
    /// Sender the session locked onto.
    pub peer: Option<SocketAddr>,
    pub metadata: Option<Metadata>,
    pub bytes_written: u64,
    pub verdict: Option<DigestVerdict>,
    pub error: Option<TransferError>,
}

impl ReceiveReport {
    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete
    }

    /// `true` only when a digest arrived and matched the output.
    pub fn digest_matches(&self) -> bool {
        self.verdict.as_ref().is_some_and(DigestVerdict::matches)
    }

    /// `true` when the bytes written differ from the declared size.
    pub fn size_mismatch(&self) -> bool {
        self.metadata
            .as_ref()
            .is_some_and(|m| m.size != self.bytes_written)
    }
}

/// Receive side of one transfer.
pub struct ReceiverSession<'a, C, S> {
    channel: &'a C,
    config: TransferConfig,
    engine: ReceiverEngine<S>,
    peer: Option<SocketAddr>,
}

impl<'a, C: Channel, S: Sink> ReceiverSession<'a, C, S> {
    pub fn new(channel: &'a C, sink: S, config: TransferConfig) -> Result<Self> {
        config.validate()?;
        let engine = ReceiverEngine::new(sink, &config);
        Ok(Self {
            channel,
            config,
            engine,
            peer: None,
        })
    }

    /// Accept datagrams from `peer` only, instead of the first sender heard.
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn engine(&self) -> &ReceiverEngine<S> {
        &self.engine
    }

    pub fn into_sink(self) -> S {
        self.engine.into_sink()
    }

    /// Receive until the digest is delivered, then keep answering
    /// duplicates for the configured linger period.
    pub async fn run(&mut self) -> ReceiveReport {
        let error = self.receive_loop().await.err();
        if let Some(e) = &error {
            log::warn!("[session] receive failed in {}: {e}", self.engine.phase());
            self.engine.abort();
        }

        let report = ReceiveReport {
            phase: self.engine.phase(),
            peer: self.peer,
            metadata: self.engine.metadata().cloned(),
            bytes_written: self.engine.bytes_written(),
            verdict: self.engine.verdict().cloned(),
            error,
        };
        if report.size_mismatch() {
            log::warn!(
                "[session] wrote {} bytes, sender declared {}",
                report.bytes_written,
                report.metadata.as_ref().map_or(0, |m| m.size)
            );
        }
        report
    }

    async fn receive_loop(&mut self) -> Result<()> {
        // One spare byte so an oversized datagram fails framing instead of
        // being silently truncated into something valid.
        let mut buf = vec![0u8; MAX_PACKET_LEN + 1];
        let mut last_heard: Option<Instant> = None;
        let mut completed_at: Option<Instant> = None;

        loop {
            let wait = match completed_at {
                Some(at) => {
                    let left = self.config.linger.saturating_sub(at.elapsed());
                    if left.is_zero() {
                        log::info!("[session] linger over, closing");
                        return Ok(());
                    }
                    left.min(self.config.poll_interval)
                }
                None => {
                    if let (Some(limit), Some(heard)) = (self.config.idle_timeout, last_heard) {
                        if heard.elapsed() >= limit {
                            return Err(TransferError::IdleTimeout(limit));
                        }
                    }
                    self.config.poll_interval
                }
            };

            let Some((n, from)) = self.channel.recv_from(&mut buf, wait.max(MIN_WAIT)).await?
            else {
                continue;
            };
            if self.peer.is_some_and(|p| p != from) {
                log::debug!("[session] ignoring datagram from {from}");
                continue;
            }

            let reception = self.engine.on_packet(&buf[..n])?;
            if matches!(
                reception.disposition,
                Disposition::Malformed | Disposition::Corrupt | Disposition::Stray
            ) {
                continue;
            }
            if self.peer.is_none() {
                log::info!("[session] receiving from {from}");
                self.peer = Some(from);
            }
            last_heard = Some(Instant::now());

            if let Some(seq) = reception.ack {
                self.channel.send_to(&Message::ack(seq).encode(), from).await?;
                log::debug!("[session] → ACK {seq}");
            }
            if completed_at.is_none() && self.engine.is_complete() {
                completed_at = Some(Instant::now());
            }
        }
    }
}
