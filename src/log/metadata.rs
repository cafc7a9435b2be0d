//! The metadata file: a fixed 4 KiB + 64 B layout with two alternating
//! sections, each CRC-32C protected and counter-stamped, so that a crash
//! mid-write to one section always leaves the other section intact (§3, §4.C
//! "Metadata write"/"Recovery", §8 scenario 4).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use crate::encoding::{crc32c, read_u32_le, read_u64_le, write_u32_le, write_u64_le};
use crate::error::{Error, Result};

pub const MAGIC: u64 = 0x491E_C8B1_C5AF_1AAA;
pub const VERSION: u32 = 1;

/// The two alternating sections live at fixed offsets `0` and `4096`
/// (`(counter & 1) << 12`) inside the file; each section's own record is
/// small (counter + fields + CRC), so the file as a whole is the "4 KiB + 64
/// B"-ish ≈4160 bytes of §3/§6, not two back-to-back 4 KiB sections.
const SECTION_STRIDE: u64 = 4096;
const SECTION_LEN: usize = 72;
const FILE_LEN: u64 = SECTION_STRIDE + SECTION_LEN as u64;

const OFF_COUNTER: usize = 0;
const OFF_MAGIC: usize = 8;
const OFF_VERSION: usize = 16;
const OFF_CURRENT_TERM: usize = 20;
const OFF_VOTED_FOR: usize = 28;
const OFF_HIGHEST_PREV_TERM: usize = 36;
const OFF_HIGHEST_TERM: usize = 44;
const OFF_HIGHEST_POSITION: usize = 52;
const OFF_DURABLE_POSITION: usize = 60;
const OFF_CRC: usize = SECTION_LEN - 4;

/// Persisted fields, mirroring `StateLog`'s metadata-latch-guarded state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fields {
    pub counter: u64,
    pub current_term: u64,
    pub voted_for: u64,
    pub highest_prev_term: u64,
    pub highest_term: u64,
    pub highest_position: u64,
    pub durable_position: u64,
}

impl Fields {
    fn encode(&self) -> [u8; SECTION_LEN] {
        let mut buf = [0u8; SECTION_LEN];
        write_u64_le(&mut buf, OFF_COUNTER, self.counter);
        write_u64_le(&mut buf, OFF_MAGIC, MAGIC);
        write_u32_le(&mut buf, OFF_VERSION, VERSION);
        write_u64_le(&mut buf, OFF_CURRENT_TERM, self.current_term);
        write_u64_le(&mut buf, OFF_VOTED_FOR, self.voted_for);
        write_u64_le(&mut buf, OFF_HIGHEST_PREV_TERM, self.highest_prev_term);
        write_u64_le(&mut buf, OFF_HIGHEST_TERM, self.highest_term);
        write_u64_le(&mut buf, OFF_HIGHEST_POSITION, self.highest_position);
        write_u64_le(&mut buf, OFF_DURABLE_POSITION, self.durable_position);
        let crc = crc32c(&buf[..OFF_CRC]);
        write_u32_le(&mut buf, OFF_CRC, crc);
        buf
    }

    fn decode(buf: &[u8; SECTION_LEN]) -> Option<Self> {
        let magic = read_u64_le(buf, OFF_MAGIC);
        if magic != MAGIC {
            return None;
        }
        let crc = read_u32_le(buf, OFF_CRC);
        if crc32c(&buf[..OFF_CRC]) != crc {
            return None;
        }
        Some(Fields {
            counter: read_u64_le(buf, OFF_COUNTER),
            current_term: read_u64_le(buf, OFF_CURRENT_TERM),
            voted_for: read_u64_le(buf, OFF_VOTED_FOR),
            highest_prev_term: read_u64_le(buf, OFF_HIGHEST_PREV_TERM),
            highest_term: read_u64_le(buf, OFF_HIGHEST_TERM),
            highest_position: read_u64_le(buf, OFF_HIGHEST_POSITION),
            durable_position: read_u64_le(buf, OFF_DURABLE_POSITION),
        })
    }
}

/// The double-buffered metadata file. Holds an OS advisory lock for the
/// lifetime of the process, per §5 ("reopening a locked file must fail with a
/// clear error").
pub struct MetadataFile {
    file: File,
    current: Fields,
}

impl MetadataFile {
    /// Opens (creating if absent) the metadata file at `path`, recovering the
    /// most recently fsynced valid section.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        FileExt::try_lock_exclusive(&file).map_err(|_| {
            Error::Io(std::io::Error::other(format!(
                "metadata file {} open by another process",
                path.display()
            )))
        })?;
        if file.metadata()?.len() < FILE_LEN {
            file.set_len(FILE_LEN)?;
        }

        let section_a = Self::read_section(&file, 0)?;
        let section_b = Self::read_section(&file, 1)?;
        let current = match (section_a, section_b) {
            (Some(a), Some(b)) => {
                if a.counter >= b.counter { Self::validate_offset(a, 0)? } else { Self::validate_offset(b, 1)? }
            }
            (Some(a), None) => Self::validate_offset(a, 0)?,
            (None, Some(b)) => Self::validate_offset(b, 1)?,
            (None, None) => Fields::default(),
        };

        Ok(Self { file, current })
    }

    /// A section's counter must agree with the physical offset it was read
    /// from: `(counter & 1) << 12 == section_offset`, i.e. even counters live
    /// at offset 0, odd counters at offset 4096.
    fn validate_offset(fields: Fields, section_index: u64) -> Result<Fields> {
        let actual_offset = section_index * SECTION_STRIDE;
        let expected_offset = (fields.counter & 1) << 12;
        if expected_offset != actual_offset {
            return Err(Error::ChecksumMismatch(format!(
                "metadata section at offset {actual_offset} has counter {} expecting offset {expected_offset}",
                fields.counter
            )));
        }
        Ok(fields)
    }

    fn read_section(file: &File, index: u64) -> Result<Option<Fields>> {
        let mut buf = [0u8; SECTION_LEN];
        let mut file = file.try_clone()?;
        file.seek(SeekFrom::Start(index * SECTION_STRIDE))?;
        match file.read_exact(&mut buf) {
            Ok(()) => Ok(Fields::decode(&buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn fields(&self) -> Fields {
        self.current
    }

    /// Increments the counter, writes the alternating section, computes the
    /// CRC, and fsyncs. Only on success is the in-memory `current` updated,
    /// per §4.C "Only after success are the in-memory ... updated".
    pub fn write(&mut self, mut fields: Fields) -> Result<()> {
        fields.counter = self.current.counter.wrapping_add(1);
        let section_index = fields.counter & 1;
        let buf = fields.encode();
        self.file.seek(SeekFrom::Start(section_index * SECTION_STRIDE))?;
        self.file.write_all(&buf)?;
        self.file.sync_all()?;
        self.current = fields;
        Ok(())
    }
}

impl Drop for MetadataFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_then_reopen_reconstructs_state() {
        let dir = TempDir::with_prefix("raftcore-metadata").unwrap();
        let path = dir.path().join("base.md");
        let mut f = MetadataFile::open(&path).unwrap();
        f.write(Fields { current_term: 5, voted_for: 2, highest_position: 100, ..Default::default() })
            .unwrap();
        drop(f);

        let reopened = MetadataFile::open(&path).unwrap();
        let fields = reopened.fields();
        assert_eq!(fields.current_term, 5);
        assert_eq!(fields.voted_for, 2);
        assert_eq!(fields.highest_position, 100);
    }

    #[test]
    fn alternates_sections_and_survives_truncated_write() {
        let dir = TempDir::with_prefix("raftcore-metadata").unwrap();
        let path = dir.path().join("base.md");
        let mut f = MetadataFile::open(&path).unwrap();
        f.write(Fields { current_term: 1, ..Default::default() }).unwrap(); // counter 1, section 1
        f.write(Fields { current_term: 2, ..Default::default() }).unwrap(); // counter 2, section 0
        drop(f);

        // Simulate a crash mid-write to section 0 (counter 3) by truncating
        // its trailing bytes; section 1 (counter 1) must still be readable
        // and should now lose to nothing since section 0 no longer validates,
        // but section... here we corrupt section 0 directly to simulate a
        // torn write there, leaving the counter-1 section (index 1) valid.
        {
            use std::io::Write as _;
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(SECTION_LEN as u64 - 4)).unwrap();
            file.write_all(&[0xff, 0xff, 0xff, 0xff]).unwrap(); // corrupt section 0's CRC
        }

        let reopened = MetadataFile::open(&path).unwrap();
        assert_eq!(reopened.fields().current_term, 1);
    }

    #[test]
    fn second_open_fails_while_locked() {
        let dir = TempDir::with_prefix("raftcore-metadata").unwrap();
        let path = dir.path().join("base.md");
        let _f = MetadataFile::open(&path).unwrap();
        assert!(MetadataFile::open(&path).is_err());
    }
}
