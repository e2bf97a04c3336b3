//! `file-over-udp`: reliable file transfer over lossy UDP datagrams.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────────┐   DATA / DIGEST   ┌────────────────┐
//!  │ SenderSession │──────────────────▶│ ReceiverSession│
//!  └──────┬────────┘                   └───────┬────────┘
//!         │              ACKs                  │
//!         │◀───────────────────────────────────┘
//!         │
//!  ┌──────▼────────────────────────────────────────────┐
//!  │  SenderEngine / ReceiverEngine                    │
//!  │  (sliding windows, per-segment timers, sweep)     │
//!  └──────┬────────────────────────────────────────────┘
//!         │ encoded datagrams
//!  ┌──────▼──────┐       ┌─────────────┐
//!  │  Channel    │◀──────│  Simulator  │  (loss / reorder / corruption)
//!  │  (Socket)   │       └─────────────┘
//!  └─────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`checksum`]: CRC-32 per packet, SHA-256 per file
//! - [`packet`]: wire format (serialise / deserialise)
//! - [`segment`]: file → metadata, data and digest segments
//! - [`files`]: chunked sources and output sinks
//! - [`channel`]: datagram I/O trait and async UDP socket
//! - [`config`]: ARQ mode, window, timers, retry budget
//! - [`sender`]: outbound window state machine
//! - [`receiver`]: inbound buffering and in-order delivery
//! - [`state`]: session phase types
//! - [`session`]: phase driver for both sides
//! - [`simulator`]: in-memory link and fault injection for testing
//! - [`error`]: error types

pub mod channel;
pub mod checksum;
pub mod config;
pub mod error;
pub mod files;
pub mod packet;
pub mod receiver;
pub mod segment;
pub mod sender;
pub mod session;
pub mod simulator;
pub mod state;

pub use config::{ArqMode, TransferConfig};
pub use error::{Result, TransferError};
pub use session::{send_file, Progress, ReceiveReport, ReceiverSession, SenderSession, TransferReport};
