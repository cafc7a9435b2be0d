//! Segment file (§4.A): a fixed-capacity, append-only file holding a
//! contiguous byte range of a single term. Modeled after the simple, direct
//! positional file access `raft::log::Log` uses for its KV engine, adapted to
//! a preallocated fixed-size file addressed by absolute position instead of
//! an encoded key.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// A segment's filename encodes `(prev_term, term, start)`; `prev_term` is
/// implied to equal `term` when the short two-field form is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentId {
    pub prev_term: u64,
    pub term: u64,
    pub start: u64,
}

/// A fixed-capacity, append-only on-disk segment covering the absolute
/// position range `[start, start + capacity)`. Bytes are preallocated
/// (zero-filled) at creation; `filled` tracks how much of the range actually
/// holds data that has been written, which may be less than `capacity`.
pub struct Segment {
    id: SegmentId,
    path: PathBuf,
    capacity: u64,
    filled: u64,
    file: Option<File>,
}

impl Segment {
    /// Creates a new, empty segment file preallocated to `capacity` bytes.
    pub fn create(path: impl Into<PathBuf>, id: SegmentId, capacity: u64) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create_new(true).read(true).write(true).open(&path)?;
        file.set_len(capacity)?;
        Ok(Self { id, path, capacity, filled: 0, file: Some(file) })
    }

    /// Opens an existing segment file, trusting `filled` as reported by the
    /// caller (the owning `TermLog` tracks high-water marks across segments
    /// and is the source of truth on restart).
    pub fn open(path: impl Into<PathBuf>, id: SegmentId, capacity: u64, filled: u64) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self { id, path, capacity, filled, file: Some(file) })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start(&self) -> u64 {
        self.id.start
    }

    pub fn end(&self) -> u64 {
        self.id.start + self.capacity
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn filled_end(&self) -> u64 {
        self.id.start + self.filled
    }

    /// Reopens the underlying file handle if it was closed under memory
    /// pressure (§5 "segments are opened lazily and may be closed ... a
    /// reader/writer carries a handle it can reopen").
    fn ensure_open(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            self.file = Some(OpenOptions::new().read(true).write(true).open(&self.path)?);
        }
        Ok(self.file.as_mut().expect("just ensured open"))
    }

    /// Closes the file handle, releasing the fd without deleting data.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Writes `data` at absolute `position`, which must lie within
    /// `[start, end)` and leave room for the whole write. Returns an error if
    /// the write would exceed segment capacity; callers must fail over to the
    /// next segment in that case.
    pub fn write_at(&mut self, position: u64, data: &[u8]) -> Result<()> {
        assert!(position >= self.id.start, "write before segment start");
        let rel_start = position - self.id.start;
        let rel_end = rel_start + data.len() as u64;
        if rel_end > self.capacity {
            return Err(crate::error::Error::Protocol(format!(
                "write [{position}, {}) exceeds segment capacity ending at {}",
                position + data.len() as u64,
                self.end()
            )));
        }
        let file = self.ensure_open()?;
        file.seek(SeekFrom::Start(rel_start))?;
        file.write_all(data)?;
        if rel_end > self.filled {
            self.filled = rel_end;
        }
        Ok(())
    }

    /// Reads `len` bytes starting at absolute `position`, which must lie
    /// within the filled range.
    pub fn read_at(&mut self, position: u64, len: usize) -> Result<Vec<u8>> {
        assert!(position >= self.id.start && position + len as u64 <= self.filled_end());
        let rel_start = position - self.id.start;
        let mut buf = vec![0u8; len];
        let file = self.ensure_open()?;
        file.seek(SeekFrom::Start(rel_start))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Flushes and fsyncs the file to disk.
    pub fn sync(&mut self) -> Result<()> {
        let file = self.ensure_open()?;
        file.sync_all()?;
        Ok(())
    }

    /// Deletes the segment file. Callers must ensure the segment's entire
    /// range lies below the compaction position first.
    pub fn delete(mut self) -> Result<()> {
        self.close();
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seg_path(dir: &TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn write_read_round_trip() {
        let dir = TempDir::with_prefix("raftcore-segment").unwrap();
        let id = SegmentId { prev_term: 1, term: 1, start: 100 };
        let mut seg = Segment::create(seg_path(&dir, "s1"), id, 1024).unwrap();
        seg.write_at(100, b"hello").unwrap();
        seg.write_at(105, b"world").unwrap();
        assert_eq!(seg.filled_end(), 110);
        assert_eq!(seg.read_at(100, 10).unwrap(), b"helloworld");
    }

    #[test]
    fn write_beyond_capacity_fails() {
        let dir = TempDir::with_prefix("raftcore-segment").unwrap();
        let id = SegmentId { prev_term: 1, term: 1, start: 0 };
        let mut seg = Segment::create(seg_path(&dir, "s1"), id, 4).unwrap();
        assert!(seg.write_at(0, b"12345").is_err());
    }

    #[test]
    fn reopen_after_close_preserves_data() {
        let dir = TempDir::with_prefix("raftcore-segment").unwrap();
        let id = SegmentId { prev_term: 1, term: 1, start: 0 };
        let path = seg_path(&dir, "s1");
        let mut seg = Segment::create(&path, id, 64).unwrap();
        seg.write_at(0, b"abc").unwrap();
        seg.sync().unwrap();
        seg.close();
        assert_eq!(seg.read_at(0, 3).unwrap(), b"abc");

        let mut reopened = Segment::open(&path, id, 64, 3).unwrap();
        assert_eq!(reopened.read_at(0, 3).unwrap(), b"abc");
    }
}
