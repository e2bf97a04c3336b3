//! Turning a file into an ordered list of segments.
//!
//! Sequence layout of one transfer:
//!
//! ```text
//!  seq 0          seq 1 ..= n              seq n + 1
//! ┌──────────┐   ┌──────┬──────┬─────┐   ┌────────┐
//! │ metadata │   │ data │ data │ ... │   │ digest │
//! └──────────┘   └──────┴──────┴─────┘   └────────┘
//! ```
//!
//! The metadata segment is a DATA segment whose payload is the text
//! `FILENAME=<name>;SIZE=<bytes>`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::checksum::{digest_of_stream, Digest};
use crate::error::{Result, TransferError};
use crate::files::{digest_of_file, Source};
use crate::packet::Segment;

/// Output name used when the metadata segment cannot be parsed.
pub const DEFAULT_NAME: &str = "received_file";

/// Name and declared size of the transferred item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub name: String,
    pub size: u64,
}

impl Metadata {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        format!("FILENAME={};SIZE={}", self.name, self.size).into_bytes()
    }

    /// Parse a metadata payload.  Trailing NUL bytes are tolerated.
    ///
    /// The name is reduced to its final path component, so a peer cannot
    /// steer the output outside the receiver's directory.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let end = payload
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        let text = std::str::from_utf8(&payload[..end]).ok()?;
        let rest = text.strip_prefix("FILENAME=")?;
        let (name, size) = rest.rsplit_once(";SIZE=")?;
        let size = size.trim().parse().ok()?;
        let name = Path::new(name).file_name()?.to_str()?.to_owned();
        Some(Self { name, size })
    }
}

/// Every segment of one transfer, ready for the sender session.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub metadata: Metadata,
    pub digest: Digest,
    pub metadata_segment: Segment,
    pub data_segments: Vec<Segment>,
    pub digest_segment: Segment,
}

impl TransferPlan {
    /// Split everything `source` yields into `payload_len`-byte DATA segments.
    ///
    /// `digest` is the sender's hash of the same bytes.
    pub fn build<S: Source>(
        name: &str,
        source: &mut S,
        digest: Digest,
        payload_len: usize,
    ) -> Result<Self> {
        let mut data_segments = Vec::new();
        let mut size = 0u64;
        let mut seq = 1u32;
        while let Some(chunk) = source.read_chunk(payload_len)? {
            size += chunk.len() as u64;
            data_segments.push(Segment::data(seq, chunk)?);
            seq = seq
                .checked_add(1)
                .filter(|s| *s < u32::MAX)
                .ok_or_else(|| TransferError::Config("file needs too many segments".into()))?;
        }

        let metadata = Metadata::new(name, size);
        let metadata_segment = Segment::data(0, metadata.encode())?;
        let digest_segment = Segment::digest(seq, digest.as_bytes())?;

        Ok(Self {
            metadata,
            digest,
            metadata_segment,
            data_segments,
            digest_segment,
        })
    }

    /// Plan the transfer of a file on disk, announced under its file name.
    pub fn from_file(path: &Path, payload_len: usize) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::Config(format!("no file name in {}", path.display())))?;
        let digest = digest_of_file(path)?;
        let mut source = BufReader::new(File::open(path)?);
        Self::build(name, &mut source, digest, payload_len)
    }

    /// Plan the transfer of an in-memory buffer.
    pub fn from_bytes(name: &str, data: &[u8], payload_len: usize) -> Result<Self> {
        let digest = digest_of_stream(data)?;
        let mut source = data;
        Self::build(name, &mut source, digest, payload_len)
    }

    /// Total number of segments, metadata and digest included.
    pub fn segment_count(&self) -> usize {
        self.data_segments.len() + 2
    }
}
