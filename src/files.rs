//! File-side collaborators: where segments come from and where they go.
//!
//! [`Source`] is implemented for every [`Read`]er, so a `BufReader<File>` or a
//! byte slice can feed a [`crate::segment::TransferPlan`] directly.  [`Sink`]
//! receives in-order payloads from the receiver engine; [`FileSink`] writes to
//! disk, [`MemorySink`] keeps everything in a `Vec` for tests and embedding.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::checksum::{digest_of_stream, Digest};
use crate::segment::Metadata;

/// Chunked input.
pub trait Source {
    /// Up to `max_len` bytes, or `None` once the input is exhausted.
    fn read_chunk(&mut self, max_len: usize) -> io::Result<Option<Vec<u8>>>;
}

impl<R: Read> Source for R {
    fn read_chunk(&mut self, max_len: usize) -> io::Result<Option<Vec<u8>>> {
        let mut buf = Vec::with_capacity(max_len);
        self.by_ref().take(max_len as u64).read_to_end(&mut buf)?;
        Ok(if buf.is_empty() { None } else { Some(buf) })
    }
}

/// In-order output of the receiver engine.
pub trait Sink {
    /// Called once, when the metadata segment is delivered.
    fn begin(&mut self, metadata: &Metadata) -> io::Result<()>;
    fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Flush everything and return the digest of the complete output.
    fn finish(&mut self) -> io::Result<Digest>;
}

/// SHA-256 of a file on disk.
pub fn digest_of_file(path: &Path) -> io::Result<Digest> {
    digest_of_stream(BufReader::new(File::open(path)?))
}

// ---------------------------------------------------------------------------
// FileSink
// ---------------------------------------------------------------------------

/// Writes the received file into a directory under its transmitted name, or
/// to a fixed path when one is given.
#[derive(Debug)]
pub struct FileSink {
    dir: PathBuf,
    fixed_path: Option<PathBuf>,
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
}

impl FileSink {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fixed_path: None,
            path: None,
            writer: None,
        }
    }

    /// Ignore the transmitted name and write to `path`.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            dir: PathBuf::new(),
            fixed_path: Some(path.into()),
            path: None,
            writer: None,
        }
    }

    /// Output file, once [`Sink::begin`] has run.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Sink for FileSink {
    fn begin(&mut self, metadata: &Metadata) -> io::Result<()> {
        let path = match &self.fixed_path {
            Some(p) => p.clone(),
            None => self.dir.join(&metadata.name),
        };
        log::info!("[sink] writing {} ({} bytes)", path.display(), metadata.size);
        self.writer = Some(BufWriter::new(File::create(&path)?));
        self.path = Some(path);
        Ok(())
    }

    fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(w) => w.write_all(bytes),
            None => Err(io::Error::other("output file not opened")),
        }
    }

    fn finish(&mut self) -> io::Result<Digest> {
        if let Some(mut w) = self.writer.take() {
            w.flush()?;
            w.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }
        match &self.path {
            Some(path) => digest_of_file(path),
            None => Err(io::Error::other("output file not opened")),
        }
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub metadata: Option<Metadata>,
    pub data: Vec<u8>,
    /// Number of `write_chunk` calls, one per delivered DATA segment.
    pub writes: usize,
    pub finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sink for MemorySink {
    fn begin(&mut self, metadata: &Metadata) -> io::Result<()> {
        self.metadata = Some(metadata.clone());
        Ok(())
    }

    fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.data.extend_from_slice(bytes);
        self.writes += 1;
        Ok(())
    }

    fn finish(&mut self) -> io::Result<Digest> {
        self.finished = true;
        digest_of_stream(&self.data[..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_source_yields_full_chunks() {
        let data: Vec<u8> = (0..10).collect();
        let mut src = &data[..];
        assert_eq!(src.read_chunk(4).unwrap(), Some(vec![0, 1, 2, 3]));
        assert_eq!(src.read_chunk(4).unwrap(), Some(vec![4, 5, 6, 7]));
        assert_eq!(src.read_chunk(4).unwrap(), Some(vec![8, 9]));
        assert_eq!(src.read_chunk(4).unwrap(), None);
    }

    #[test]
    fn file_sink_writes_under_transmitted_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::in_dir(dir.path());
        sink.begin(&Metadata::new("out.bin", 6)).unwrap();
        sink.write_chunk(b"abc").unwrap();
        sink.write_chunk(b"def").unwrap();
        let digest = sink.finish().unwrap();

        let path = dir.path().join("out.bin");
        assert_eq!(sink.path(), Some(path.as_path()));
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
        assert_eq!(digest, digest_of_stream(&b"abcdef"[..]).unwrap());
    }

    #[test]
    fn file_sink_fixed_path_overrides_name() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("chosen.dat");
        let mut sink = FileSink::at_path(&target);
        sink.begin(&Metadata::new("ignored.bin", 1)).unwrap();
        sink.write_chunk(b"z").unwrap();
        sink.finish().unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"z");
        assert!(!dir.path().join("ignored.bin").exists());
    }

    #[test]
    fn file_sink_rejects_writes_before_begin() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::in_dir(dir.path());
        assert!(sink.write_chunk(b"early").is_err());
        assert!(sink.finish().is_err());
    }

    #[test]
    fn memory_sink_digest_matches_contents() {
        let mut sink = MemorySink::new();
        sink.begin(&Metadata::new("m", 2)).unwrap();
        sink.write_chunk(b"hi").unwrap();
        let digest = sink.finish().unwrap();
        assert!(sink.finished);
        assert_eq!(sink.writes, 1);
        assert_eq!(digest, digest_of_stream(&b"hi"[..]).unwrap());
    }
}
