//! Network simulator for deterministic testing.
//!
//! Real networks drop, reorder, duplicate and corrupt datagrams.  To exercise
//! the reliability mechanisms without depending on actual network conditions,
//! this module provides:
//!
//! - [`link`]: a pair of connected in-memory [`MemoryChannel`]s.
//! - [`Simulator`]: a wrapper around any [`Channel`] that intercepts sends and
//!   applies a seeded fault model plus scripted one-shot drops.
//!
//! | Fault         | Description                                             |
//! |---------------|---------------------------------------------------------|
//! | Packet loss   | Drop a datagram with probability `loss_rate`.           |
//! | Reordering    | Hold a datagram back so the next one overtakes it.      |
//! | Duplication   | Deliver a datagram twice.                               |
//! | Corruption    | Flip one random bit.                                    |
//! | Scripted drop | Drop the next `n` datagrams of a given kind and seq.    |
//!
//! The same seed always produces the same fault sequence for the same traffic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::packet::{self, Kind};

type Datagram = (Vec<u8>, SocketAddr);

// ---------------------------------------------------------------------------
// In-memory link
// ---------------------------------------------------------------------------

/// One end of an in-memory datagram link.
///
/// Datagrams addressed to anything but the far end vanish, as do datagrams
/// sent after the far end was dropped.
#[derive(Debug)]
pub struct MemoryChannel {
    pub local_addr: SocketAddr,
    peer_addr: SocketAddr,
    tx: mpsc::UnboundedSender<Datagram>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

/// Two connected channels with the given addresses.
pub fn link(a: SocketAddr, b: SocketAddr) -> (MemoryChannel, MemoryChannel) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MemoryChannel {
            local_addr: a,
            peer_addr: b,
            tx: a_tx,
            rx: tokio::sync::Mutex::new(a_rx),
        },
        MemoryChannel {
            local_addr: b,
            peer_addr: a,
            tx: b_tx,
            rx: tokio::sync::Mutex::new(b_rx),
        },
    )
}

fn copy_out(buf: &mut [u8], (data, from): Datagram) -> (usize, SocketAddr) {
    let n = data.len().min(buf.len());
    buf[..n].copy_from_slice(&data[..n]);
    (n, from)
}

impl Channel for MemoryChannel {
    async fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> Result<usize, ChannelError> {
        if dest == self.peer_addr {
            // A closed far end behaves like an unreachable host: silent loss.
            let _ = self.tx.send((datagram.to_vec(), self.local_addr));
        }
        Ok(datagram.len())
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
        wait: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, ChannelError> {
        let mut rx = self.rx.lock().await;
        if wait.is_zero() {
            return match rx.try_recv() {
                Ok(d) => Ok(Some(copy_out(buf, d))),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => Ok(None),
            };
        }
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(d)) => Ok(Some(copy_out(buf, d))),
            Ok(None) => {
                // Far end gone: nothing will ever arrive, but honour the wait.
                tokio::time::sleep(wait).await;
                Ok(None)
            }
            Err(_elapsed) => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Fault model
// ---------------------------------------------------------------------------

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram is held back behind the next one.
    pub reorder_rate: f64,
    /// Probability that a datagram is delivered twice.
    pub duplicate_rate: f64,
    /// Probability that one bit of a datagram is flipped.
    pub corrupt_rate: f64,
    /// RNG seed; identical seeds give identical fault sequences.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: the simulator is a transparent pass-through.
        Self {
            loss_rate: 0.0,
            reorder_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            seed: 0,
        }
    }
}

/// What the simulator did with the traffic offered to it.
#[derive(Debug, Clone, Default)]
pub struct TrafficStats {
    offered: HashMap<(Kind, u32), u32>,
    pub dropped: u64,
    pub duplicated: u64,
    pub corrupted: u64,
    pub reordered: u64,
}

impl TrafficStats {
    /// Times a datagram of `kind` with sequence `seq` was handed to `send_to`.
    pub fn offered(&self, kind: Kind, seq: u32) -> u32 {
        self.offered.get(&(kind, seq)).copied().unwrap_or(0)
    }

    /// Times any datagram of `kind` was handed to `send_to`.
    pub fn offered_kind(&self, kind: Kind) -> u32 {
        self.offered
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, n)| n)
            .sum()
    }
}

#[derive(Debug)]
struct ScriptedDrop {
    kind: Kind,
    seq: u32,
    remaining: u32,
}

#[derive(Debug)]
struct SimState {
    rng: StdRng,
    held: Option<Datagram>,
    script: Vec<ScriptedDrop>,
    stats: TrafficStats,
}

/// A fault-injecting wrapper around the channel layer.
///
/// Faults apply on send; receives pass straight through to the inner channel.
#[derive(Debug)]
pub struct Simulator<C> {
    inner: C,
    config: SimulatorConfig,
    state: Mutex<SimState>,
}

impl<C: Channel> Simulator<C> {
    pub fn new(inner: C, config: SimulatorConfig) -> Self {
        let state = SimState {
            rng: StdRng::seed_from_u64(config.seed),
            held: None,
            script: Vec::new(),
            stats: TrafficStats::default(),
        };
        Self {
            inner,
            config,
            state: Mutex::new(state),
        }
    }

    /// A simulator that only observes traffic.
    pub fn passthrough(inner: C) -> Self {
        Self::new(inner, SimulatorConfig::default())
    }

    /// Drop the next `times` datagrams of `kind` carrying `seq`.
    pub fn drop_next(&self, kind: Kind, seq: u32, times: u32) {
        self.lock().script.push(ScriptedDrop {
            kind,
            seq,
            remaining: times,
        });
    }

    pub fn stats(&self) -> TrafficStats {
        self.lock().stats.clone()
    }

    /// Release a datagram held back for reordering, if any.
    pub async fn flush(&self) -> Result<(), ChannelError> {
        let held = self.lock().held.take();
        if let Some((data, dest)) = held {
            self.inner.send_to(&data, dest).await?;
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        // Never held across an await, and nothing panics while holding it.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply the fault model to one outgoing datagram; returns what to
    /// actually put on the inner channel, in order.
    fn plan(&self, datagram: &[u8], dest: SocketAddr) -> Vec<Datagram> {
        let mut st = self.lock();
        let released = st.held.take();
        let mut out = Vec::with_capacity(3);

        let class = packet::peek(datagram).ok();
        if let Some(key) = class {
            *st.stats.offered.entry(key).or_insert(0) += 1;
        }

        let scripted = class.is_some_and(|(kind, seq)| {
            st.script
                .iter_mut()
                .find(|d| d.kind == kind && d.seq == seq && d.remaining > 0)
                .map(|d| d.remaining -= 1)
                .is_some()
        });

        let cfg = &self.config;
        if scripted || st.rng.random_bool(cfg.loss_rate.clamp(0.0, 1.0)) {
            st.stats.dropped += 1;
            log::debug!("[sim] drop {:?}", class);
        } else {
            let mut data = datagram.to_vec();
            if !data.is_empty() && st.rng.random_bool(cfg.corrupt_rate.clamp(0.0, 1.0)) {
                let bit = st.rng.random_range(0..data.len() * 8);
                data[bit / 8] ^= 1 << (bit % 8);
                st.stats.corrupted += 1;
                log::debug!("[sim] corrupt {:?} bit {bit}", class);
            }
            let copies = if st.rng.random_bool(cfg.duplicate_rate.clamp(0.0, 1.0)) {
                st.stats.duplicated += 1;
                2
            } else {
                1
            };
            if released.is_none() && st.rng.random_bool(cfg.reorder_rate.clamp(0.0, 1.0)) {
                st.stats.reordered += 1;
                log::debug!("[sim] hold back {:?}", class);
                st.held = Some((data, dest));
            } else {
                for _ in 0..copies {
                    out.push((data.clone(), dest));
                }
            }
        }

        // A held datagram goes out after the one that overtook it.
        out.extend(released);
        out
    }
}

impl<C: Channel> Channel for Simulator<C> {
    async fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> Result<usize, ChannelError> {
        for (data, to) in self.plan(datagram, dest) {
            self.inner.send_to(&data, to).await?;
        }
        Ok(datagram.len())
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
        wait: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, ChannelError> {
        self.inner.recv_from(buf, wait).await
    }
}
