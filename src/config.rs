//! Transfer configuration.
//!
//! One [`TransferConfig`] parameterizes both ARQ engines.  The [`ArqMode`]
//! picks an acknowledgment policy and a retransmission policy; every mode runs
//! through the same sender and receiver code.
//!
//! | Mode              | ACKs         | Retransmit on timeout | Window |
//! |-------------------|--------------|-----------------------|--------|
//! | `SelectiveRepeat` | per segment  | the expired segment   | N      |
//! | `GoBackN`         | cumulative   | the whole window      | N (receiver: 1) |
//! | `StopAndWait`     | per segment  | the expired segment   | 1      |
//!
//! Both peers must run the same mode.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::TransferError;
use crate::packet::MAX_PAYLOAD_LEN;

/// Largest accepted window.  Far below half the 32-bit sequence space, so old
/// and new segments can never share a slot.
pub const MAX_WINDOW: usize = 1 << 16;

/// How the receiver acknowledges and how the sender interprets ACKs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// ACK `s` confirms segment `s` only.
    PerSegment,
    /// ACK `s` confirms every segment below `s` (next expected).
    Cumulative,
}

/// What the sender resends when a timer expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmitPolicy {
    SingleSegment,
    WholeWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArqMode {
    #[default]
    SelectiveRepeat,
    GoBackN,
    StopAndWait,
}

impl ArqMode {
    pub fn ack_policy(self) -> AckPolicy {
        match self {
            ArqMode::GoBackN => AckPolicy::Cumulative,
            ArqMode::SelectiveRepeat | ArqMode::StopAndWait => AckPolicy::PerSegment,
        }
    }

    pub fn retransmit_policy(self) -> RetransmitPolicy {
        match self {
            ArqMode::GoBackN => RetransmitPolicy::WholeWindow,
            ArqMode::SelectiveRepeat | ArqMode::StopAndWait => RetransmitPolicy::SingleSegment,
        }
    }

    /// Sender window actually used for a configured `window_size`.
    pub fn send_window(self, window_size: usize) -> usize {
        match self {
            ArqMode::StopAndWait => 1,
            _ => window_size,
        }
    }

    /// Receiver window actually used for a configured `window_size`.
    ///
    /// Go-back-N receivers only ever accept the next in-order segment.
    pub fn receive_window(self, window_size: usize) -> usize {
        match self {
            ArqMode::SelectiveRepeat => window_size,
            ArqMode::GoBackN | ArqMode::StopAndWait => 1,
        }
    }
}

impl FromStr for ArqMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sr" | "selective" | "selective-repeat" => Ok(ArqMode::SelectiveRepeat),
            "gbn" | "go-back-n" => Ok(ArqMode::GoBackN),
            "saw" | "stop-and-wait" => Ok(ArqMode::StopAndWait),
            _ => Err(format!("unknown ARQ mode: {s}")),
        }
    }
}

impl fmt::Display for ArqMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArqMode::SelectiveRepeat => "selective-repeat",
            ArqMode::GoBackN => "go-back-n",
            ArqMode::StopAndWait => "stop-and-wait",
        };
        f.write_str(name)
    }
}

/// Parameters for one transfer, shared by sender and receiver.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub mode: ArqMode,
    /// Segments in flight (sender) / buffered out of order (receiver).
    pub window_size: usize,
    /// Age after which an unacknowledged segment is resent.
    pub timeout: Duration,
    /// Longest single wait on the channel per loop iteration.
    pub poll_interval: Duration,
    /// Retransmissions allowed per segment; `None` retries forever.
    pub max_retries: Option<u32>,
    /// Payload bytes per DATA segment.
    pub payload_len: usize,
    /// How long a finished receiver keeps answering duplicates.
    pub linger: Duration,
    /// Silence that abandons a started receive; `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            mode: ArqMode::SelectiveRepeat,
            window_size: 8,
            timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(50),
            max_retries: Some(50),
            payload_len: MAX_PAYLOAD_LEN,
            linger: Duration::from_secs(1),
            idle_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl TransferConfig {
    /// Reject settings the engines cannot run with.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.window_size == 0 {
            return Err(TransferError::Config("window size must be at least 1".into()));
        }
        if self.window_size > MAX_WINDOW {
            return Err(TransferError::Config(format!(
                "window size {} exceeds the maximum of {MAX_WINDOW}",
                self.window_size
            )));
        }
        if self.timeout.is_zero() {
            return Err(TransferError::Config("retransmit timeout must be non-zero".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(TransferError::Config("poll interval must be non-zero".into()));
        }
        if self.payload_len == 0 || self.payload_len > MAX_PAYLOAD_LEN {
            return Err(TransferError::Config(format!(
                "payload length must be between 1 and {MAX_PAYLOAD_LEN}"
            )));
        }
        Ok(())
    }

    pub fn send_window(&self) -> usize {
        self.mode.send_window(self.window_size)
    }

    pub fn receive_window(&self) -> usize {
        self.mode.receive_window(self.window_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        TransferConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_window_rejected() {
        let cfg = TransferConfig {
            window_size: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(TransferError::Config(_))));
    }

    #[test]
    fn oversized_window_rejected() {
        let cfg = TransferConfig {
            window_size: MAX_WINDOW + 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = TransferConfig {
            window_size: MAX_WINDOW,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn payload_len_bounds() {
        for bad in [0, MAX_PAYLOAD_LEN + 1] {
            let cfg = TransferConfig {
                payload_len: bad,
                ..Default::default()
            };
            assert!(cfg.validate().is_err(), "payload_len {bad}");
        }
    }

    #[test]
    fn stop_and_wait_forces_window_of_one() {
        let cfg = TransferConfig {
            mode: ArqMode::StopAndWait,
            window_size: 16,
            ..Default::default()
        };
        assert_eq!(cfg.send_window(), 1);
        assert_eq!(cfg.receive_window(), 1);
    }

    #[test]
    fn go_back_n_policies() {
        let mode = ArqMode::GoBackN;
        assert_eq!(mode.ack_policy(), AckPolicy::Cumulative);
        assert_eq!(mode.retransmit_policy(), RetransmitPolicy::WholeWindow);
        assert_eq!(mode.send_window(4), 4);
        assert_eq!(mode.receive_window(4), 1);
    }

    #[test]
    fn mode_parses_aliases() {
        assert_eq!("sr".parse::<ArqMode>().unwrap(), ArqMode::SelectiveRepeat);
        assert_eq!("Go-Back-N".parse::<ArqMode>().unwrap(), ArqMode::GoBackN);
        assert_eq!("saw".parse::<ArqMode>().unwrap(), ArqMode::StopAndWait);
        assert!("tcp".parse::<ArqMode>().is_err());
    }
}
