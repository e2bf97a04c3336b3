//! Integrity primitives.
//!
//! Two checks protect a transfer at different scopes:
//! - [`crc32`] guards every datagram against bit errors on the wire.  The
//!   codec computes it over the whole encoded message with the checksum field
//!   zeroed (see [`crate::packet`]).
//! - [`digest_of_stream`] computes a SHA-256 [`Digest`] over the complete
//!   reconstructed file, once per transfer, for end-to-end verification.
//!
//! Both are pure functions; verification never panics on malformed input, it
//! simply reports a mismatch.

use std::fmt;
use std::io::{self, Read};
use std::sync::OnceLock;

use sha2::{Digest as _, Sha256};

/// Reflected CRC-32 polynomial (IEEE 802.3 / zlib).
const POLY: u32 = 0xEDB8_8320;

/// Chunk size used when streaming a file through the hasher.
pub const DIGEST_CHUNK: usize = 4096;

/// Byte length of a [`Digest`].
pub const DIGEST_LEN: usize = 32;

static TABLE: OnceLock<[u32; 256]> = OnceLock::new();

fn make_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let mut c = i as u32;
        for _ in 0..8 {
            c = if c & 1 != 0 { POLY ^ (c >> 1) } else { c >> 1 };
        }
        *slot = c;
    }
    table
}

/// Standard CRC-32 of `data`.
///
/// The lookup table is built on first use and shared afterwards.
pub fn crc32(data: &[u8]) -> u32 {
    let table = TABLE.get_or_init(make_table);
    let mut c = 0xFFFF_FFFFu32;
    for &byte in data {
        c = table[((c ^ u32::from(byte)) & 0xFF) as usize] ^ (c >> 8);
    }
    c ^ 0xFFFF_FFFF
}

/// `true` when `crc32(data)` equals `expected`.
pub fn verify_crc32(data: &[u8], expected: u32) -> bool {
    crc32(data) == expected
}

// ---------------------------------------------------------------------------
// Digest
// ---------------------------------------------------------------------------

/// SHA-256 digest of a complete file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    /// Interpret `bytes` as a digest; `None` unless exactly [`DIGEST_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Digest)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Hash everything `source` yields, reading [`DIGEST_CHUNK`] bytes at a time.
pub fn digest_of_stream<R: Read>(mut source: R) -> io::Result<Digest> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; DIGEST_CHUNK];
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(Digest(hasher.finalize().into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_check_value() {
        // The catalogue check value for CRC-32/ISO-HDLC.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn crc32_empty_input() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn crc32_matches_reference_implementation() {
        let mut data = Vec::new();
        for len in [1usize, 7, 64, 1014, 4000] {
            data.clear();
            data.extend((0..len).map(|i| (i * 31 + 7) as u8));
            assert_eq!(crc32(&data), crc32fast::hash(&data), "len {len}");
        }
    }

    #[test]
    fn verify_detects_mismatch() {
        let crc = crc32(b"payload");
        assert!(verify_crc32(b"payload", crc));
        assert!(!verify_crc32(b"paylaod", crc));
        assert!(!verify_crc32(&[], crc));
    }

    #[test]
    fn digest_of_empty_stream() {
        let d = digest_of_stream(&b""[..]).unwrap();
        assert_eq!(
            d.to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn digest_spans_chunk_boundaries() {
        let data: Vec<u8> = (0..DIGEST_CHUNK * 3 + 17).map(|i| i as u8).collect();
        let streamed = digest_of_stream(&data[..]).unwrap();
        let direct = Digest(Sha256::digest(&data).into());
        assert_eq!(streamed, direct);
    }

    #[test]
    fn digest_from_slice_requires_exact_length() {
        assert!(Digest::from_slice(&[0u8; 32]).is_some());
        assert!(Digest::from_slice(&[0u8; 31]).is_none());
        assert!(Digest::from_slice(&[0u8; 33]).is_none());
    }
}
