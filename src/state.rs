//! Session finite-state machine types.
//!
//! Transitions are driven by [`crate::session`]; this module only names the
//! states and which moves between them are legal.
//!
//! ```text
//!  AWAITING_METADATA ──seg 0 acked──▶ TRANSFERRING_DATA ──last data acked──▶ AWAITING_DIGEST
//!          │                                  │                                     │
//!          │                                  │                         digest acked│
//!          ▼                                  ▼                                     ▼
//!        FAILED ◀──────────────────────────────────────────────────────────── COMPLETE
//!   (retries exhausted, channel or file error, from any non-final state)
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Segment 0 (name and size) has not been acknowledged / delivered yet.
    #[default]
    AwaitingMetadata,
    /// Bulk DATA segments are moving.
    TransferringData,
    /// All data is through; the DIGEST segment is outstanding.
    AwaitingDigest,
    /// Digest exchanged.  Terminal.
    Complete,
    /// Abandoned.  Terminal.
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed)
    }

    /// `true` when moving from `self` to `next` is a legal transition.
    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Complete | Failed, _) => false,
            (_, Failed) => true,
            (AwaitingMetadata, TransferringData)
            | (TransferringData, AwaitingDigest)
            | (AwaitingDigest, Complete) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::AwaitingMetadata => "AWAITING_METADATA",
            Phase::TransferringData => "TRANSFERRING_DATA",
            Phase::AwaitingDigest => "AWAITING_DIGEST",
            Phase::Complete => "COMPLETE",
            Phase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}
