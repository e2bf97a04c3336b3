//! Error types shared across the crate.
//!
//! Corrupt and out-of-window packets are *not* errors: they are the normal
//! recovery path and surface as [`crate::receiver::Disposition`] values.  A
//! digest mismatch is a verdict in the receive report, not an error either.

use std::time::Duration;

use thiserror::Error;

use crate::packet::PacketError;

/// Failure of the datagram channel underneath the protocol.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that end a transfer attempt.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    /// A segment exhausted its retransmission budget.
    #[error("segment {seq} not acknowledged after {attempts} transmissions")]
    RetryExhausted { seq: u32, attempts: u32 },

    /// The peer went silent in the middle of a transfer.
    #[error("no traffic from peer for {0:?}")]
    IdleTimeout(Duration),

    /// Reading the source file or writing the output failed.
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;
