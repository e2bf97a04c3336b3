//! Wire-format definitions for transfer messages.
//!
//! Every datagram exchanged between peers is a [`Message`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (tag, sequence, checksum, payload).
//! - Serialising a [`Message`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Message`], returning errors
//!   for malformed or truncated input and an integrity flag otherwise.
//!
//! No I/O happens here; this is pure data transformation.  Nothing outside
//! this module looks at raw datagram bytes.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Kind      |               Sequence Number                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               |                  Checksum                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               |        Payload Length         |  Payload ...  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! An ACK stops after the checksum ([`HEADER_LEN`] = 9 bytes).  DATA and
//! DIGEST messages carry the length field and payload
//! ([`SEGMENT_HEADER_LEN`] = 11 bytes of header).
//!
//! The checksum is a CRC-32 over the whole encoded message with the checksum
//! field itself set to zero.

use thiserror::Error;

use crate::checksum::{crc32, verify_crc32};

/// Byte length of the header common to every message kind.
/// kind(1) + seq(4) + checksum(4)
pub const HEADER_LEN: usize = 9;

/// Header length of DATA / DIGEST messages: common header + payload_len(2).
pub const SEGMENT_HEADER_LEN: usize = HEADER_LEN + 2;

/// Largest payload a single segment may carry.
pub const MAX_PAYLOAD_LEN: usize = 1014;

/// Largest datagram this protocol ever produces.
pub const MAX_PACKET_LEN: usize = SEGMENT_HEADER_LEN + MAX_PAYLOAD_LEN;

// Byte offsets of each field within the serialised header.
const OFF_KIND: usize = 0;
const OFF_SEQ: usize = 1;
const OFF_CHECKSUM: usize = 5;
const OFF_PAYLOAD_LEN: usize = 9;

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// Type tag carried in the first byte of every datagram.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Ack = 0,
    Data = 1,
    Digest = 2,
}

impl Kind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Kind::Ack),
            1 => Some(Kind::Data),
            2 => Some(Kind::Digest),
            _ => None,
        }
    }

    /// Minimum encoded length of a message with this tag.
    fn min_len(self) -> usize {
        match self {
            Kind::Ack => HEADER_LEN,
            Kind::Data | Kind::Digest => SEGMENT_HEADER_LEN,
        }
    }
}

/// Payload-bearing segment kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Data,
    Digest,
}

impl From<SegmentKind> for Kind {
    fn from(kind: SegmentKind) -> Self {
        match kind {
            SegmentKind::Data => Kind::Data,
            SegmentKind::Digest => Kind::Digest,
        }
    }
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

/// One unit of transfer.
///
/// Immutable once built; the constructors refuse payloads larger than
/// [`MAX_PAYLOAD_LEN`], so every `Segment` in existence fits in a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    seq: u32,
    kind: SegmentKind,
    payload: Vec<u8>,
}

impl Segment {
    pub fn new(seq: u32, kind: SegmentKind, payload: Vec<u8>) -> Result<Self, PacketError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(PacketError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { seq, kind, payload })
    }

    /// A DATA segment (file bytes, or the metadata text at sequence 0).
    pub fn data(seq: u32, payload: Vec<u8>) -> Result<Self, PacketError> {
        Self::new(seq, SegmentKind::Data, payload)
    }

    /// A DIGEST segment carrying the sender's hash of the whole file.
    pub fn digest(seq: u32, digest: &[u8]) -> Result<Self, PacketError> {
        Self::new(seq, SegmentKind::Digest, digest.to_vec())
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Every datagram kind, as a tagged variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Segment(Segment),
    /// Acknowledges `seq`.  Per-segment under selective repeat; under go-back-N
    /// it means "every sequence number below `seq`".
    Ack { seq: u32 },
}

impl Message {
    pub fn ack(seq: u32) -> Self {
        Message::Ack { seq }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Message::Segment(s) => s.kind().into(),
            Message::Ack { .. } => Kind::Ack,
        }
    }

    pub fn seq(&self) -> u32 {
        match self {
            Message::Segment(s) => s.seq(),
            Message::Ack { seq } => *seq,
        }
    }

    /// Serialise this message into a newly allocated byte vector.
    ///
    /// The checksum is computed over the finished buffer with the checksum
    /// field zeroed and then written into place.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = match self {
            Message::Ack { .. } => vec![0u8; HEADER_LEN],
            Message::Segment(s) => {
                let mut buf = vec![0u8; SEGMENT_HEADER_LEN + s.len()];
                buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2]
                    .copy_from_slice(&(s.len() as u16).to_be_bytes());
                buf[SEGMENT_HEADER_LEN..].copy_from_slice(s.payload());
                buf
            }
        };

        buf[OFF_KIND] = self.kind() as u8;
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq().to_be_bytes());
        // Checksum field is still zero here.
        let csum = crc32(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&csum.to_be_bytes());

        buf
    }

    /// Parse a [`Message`] from a raw datagram.
    ///
    /// Returns [`Err`] only when the buffer cannot be framed at all.  A
    /// well-framed buffer whose checksum does not verify decodes successfully
    /// with [`Decoded::intact`] set to `false`; the caller decides what to do.
    pub fn decode(buf: &[u8]) -> Result<Decoded, PacketError> {
        let (kind, seq) = peek(buf)?;
        if buf.len() < kind.min_len() {
            return Err(PacketError::Truncated {
                len: buf.len(),
                need: kind.min_len(),
            });
        }

        let stored = read_u32(buf, OFF_CHECKSUM);
        let message = match kind {
            Kind::Ack => {
                if buf.len() != HEADER_LEN {
                    return Err(PacketError::LengthMismatch);
                }
                Message::Ack { seq }
            }
            Kind::Data | Kind::Digest => {
                let payload_len =
                    u16::from_be_bytes([buf[OFF_PAYLOAD_LEN], buf[OFF_PAYLOAD_LEN + 1]]) as usize;
                if payload_len > MAX_PAYLOAD_LEN {
                    return Err(PacketError::PayloadTooLarge(payload_len));
                }
                if buf.len() != SEGMENT_HEADER_LEN + payload_len {
                    return Err(PacketError::LengthMismatch);
                }
                let kind = if kind == Kind::Data {
                    SegmentKind::Data
                } else {
                    SegmentKind::Digest
                };
                Message::Segment(Segment {
                    seq,
                    kind,
                    payload: buf[SEGMENT_HEADER_LEN..].to_vec(),
                })
            }
        };

        // Zero the stored field, recompute, compare.
        let mut scratch = buf.to_vec();
        scratch[OFF_CHECKSUM..OFF_CHECKSUM + 4].fill(0);
        let intact = verify_crc32(&scratch, stored);

        Ok(Decoded { message, intact })
    }
}

/// Result of [`Message::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub message: Message,
    /// `true` when the stored checksum matches the recomputed one.
    pub intact: bool,
}

/// Read the kind tag and sequence number without validating anything else.
///
/// Used by the fault-injecting simulator to classify datagrams in flight.
pub fn peek(buf: &[u8]) -> Result<(Kind, u32), PacketError> {
    if buf.len() < HEADER_LEN {
        return Err(PacketError::Truncated {
            len: buf.len(),
            need: HEADER_LEN,
        });
    }
    let kind = Kind::from_u8(buf[OFF_KIND]).ok_or(PacketError::UnknownKind(buf[OFF_KIND]))?;
    Ok((kind, read_u32(buf, OFF_SEQ)))
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// A datagram that cannot be framed as any [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Buffer shorter than the header required for its kind.
    #[error("malformed packet: {len} bytes, need at least {need}")]
    Truncated { len: usize, need: usize },
    /// Unrecognised type tag.
    #[error("malformed packet: unknown kind tag {0}")]
    UnknownKind(u8),
    /// Payload longer than [`MAX_PAYLOAD_LEN`].
    #[error("payload of {0} bytes exceeds the {max}-byte limit", max = MAX_PAYLOAD_LEN)]
    PayloadTooLarge(usize),
    /// Length field disagrees with the datagram length.
    #[error("malformed packet: length field does not match datagram length")]
    LengthMismatch,
}
