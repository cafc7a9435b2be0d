//! Term log (§4.B): the ordered set of segments that make up a single Raft
//! term, plus the commit/highest bookkeeping for that term. Idempotent-write
//! and conflict-rejection semantics are carried over from
//! `raft::log::Log::splice` in the teacher engine, generalized from an
//! index-keyed KV log to a byte-position segment log.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::log::segment::{Segment, SegmentId};

/// Default capacity for newly created segments. Real deployments would make
/// this configurable; the spec treats it as an implementation constant.
pub const DEFAULT_SEGMENT_CAPACITY: u64 = 16 * 1024 * 1024;

/// A snapshot of a term log's progress, as returned by `capture_highest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighestInfo {
    pub term: u64,
    pub highest_position: u64,
    pub commit_position: u64,
}

struct Inner {
    /// Segments keyed by their start position.
    segments: BTreeMap<u64, Segment>,
    start: u64,
    /// Exclusive end of this term, or `u64::MAX` if still open.
    end: u64,
    /// Highest contiguous position with data, from `start`.
    highest: u64,
    /// Potential and effective commit positions (effective `<= highest`).
    commit: u64,
}

/// One Raft term's worth of log data: a contiguous (on the committed prefix)
/// run of segments, with its own highest/commit tracking.
pub struct TermLog {
    pub prev_term: u64,
    pub term: u64,
    base_path: std::path::PathBuf,
    segment_capacity: u64,
    inner: Mutex<Inner>,
    commit_cv: Condvar,
}

impl TermLog {
    pub fn new(
        base_path: impl Into<std::path::PathBuf>,
        prev_term: u64,
        term: u64,
        start: u64,
    ) -> Self {
        Self {
            prev_term,
            term,
            base_path: base_path.into(),
            segment_capacity: DEFAULT_SEGMENT_CAPACITY,
            inner: Mutex::new(Inner { segments: BTreeMap::new(), start, end: u64::MAX, highest: start, commit: start }),
            commit_cv: Condvar::new(),
        }
    }

    /// Reconstructs a term log from segments found on disk during recovery
    /// (§4.C), with `end`/`highest`/`commit` computed by the caller from the
    /// recovered segments and persisted metadata.
    pub(crate) fn from_recovered(
        base_path: impl Into<std::path::PathBuf>,
        prev_term: u64,
        term: u64,
        start: u64,
        end: u64,
        segments: BTreeMap<u64, Segment>,
        highest: u64,
        commit: u64,
    ) -> Self {
        Self {
            prev_term,
            term,
            base_path: base_path.into(),
            segment_capacity: DEFAULT_SEGMENT_CAPACITY,
            inner: Mutex::new(Inner { segments, start, end, highest, commit }),
            commit_cv: Condvar::new(),
        }
    }

    pub fn start(&self) -> u64 {
        self.inner.lock().unwrap().start
    }

    pub fn end(&self) -> u64 {
        self.inner.lock().unwrap().end
    }

    pub fn highest_position(&self) -> u64 {
        self.inner.lock().unwrap().highest
    }

    pub fn commit_position(&self) -> u64 {
        self.inner.lock().unwrap().commit
    }

    /// `prevTermAt(p)`: returns this term for `p > start`, and `prev_term`
    /// for `p == start`.
    pub fn prev_term_at(&self, position: u64) -> u64 {
        let inner = self.inner.lock().unwrap();
        if position == inner.start { self.prev_term } else { self.term }
    }

    fn segment_id_for(&self, position: u64) -> SegmentId {
        SegmentId { prev_term: self.prev_term, term: self.term, start: position }
    }

    /// The §6-compliant on-disk path for the segment starting at `start`,
    /// `<base_path>/segment[.<prevTerm>].<term>.<startPos>`.
    pub fn segment_path(&self, prev_term: u64, term: u64, start: u64) -> std::path::PathBuf {
        crate::config::segment_file_name(&self.base_path.join("segment"), prev_term, term, start)
    }

    /// Idempotent write at an absolute position. Overlapping writes with
    /// identical bytes are accepted silently; a conflicting overlap is
    /// rejected if honoring it would force the committed prefix to retreat
    /// (mirrors `Log::splice`'s "refuse to truncate committed changes").
    pub fn write(&self, position: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        let end_pos = position + data.len() as u64;
        if end_pos > inner.end {
            return Err(Error::Protocol(format!(
                "write [{position}, {end_pos}) exceeds term end {}",
                inner.end
            )));
        }

        // Detect conflicts against already-written, committed bytes.
        if position < inner.commit {
            let overlap_end = end_pos.min(inner.commit);
            let existing = Self::read_locked(&mut inner.segments, position, (overlap_end - position) as usize)?;
            let proposed = &data[..(overlap_end - position) as usize];
            if existing.as_deref() != Some(proposed) {
                let below_durable = true; // committed data is always durable-eligible
                return Err(Error::CommitConflict { position, below_durable });
            }
        }

        // Write in segment-sized chunks, creating segments as needed. A
        // single call may span several segments; each chunk is bounded by the
        // capacity-aligned segment covering its start position.
        let mut remaining = data;
        let mut pos = position;
        while !remaining.is_empty() {
            let seg_start = Self::aligned_segment_start(self.segment_capacity, pos);
            if !inner.segments.contains_key(&seg_start) {
                let id = self.segment_id_for(seg_start);
                let path = self.segment_path(id.prev_term, id.term, id.start);
                inner.segments.insert(seg_start, Segment::create(path, id, self.segment_capacity)?);
            }
            let seg = inner.segments.get_mut(&seg_start).expect("just inserted or present");
            let room = (seg.end() - pos) as usize;
            let chunk_len = room.min(remaining.len());
            seg.write_at(pos, &remaining[..chunk_len])?;
            pos += chunk_len as u64;
            remaining = &remaining[chunk_len..];
        }

        // Only advance the contiguous frontier if this write actually abuts
        // it; a write landing past a gap (e.g. out-of-order catch-up data)
        // must not let `commit` skip over the ungapped bytes in between.
        if position <= inner.highest && end_pos > inner.highest {
            inner.highest = end_pos;
        }
        Ok(())
    }

    /// Rounds `position` down to the start of the fixed-size segment that
    /// would contain it, relative to this term's start. All segments in a
    /// term are capacity-aligned to the term's start so that any position can
    /// be mapped to its segment without a table scan.
    fn aligned_segment_start(capacity: u64, position: u64) -> u64 {
        (position / capacity) * capacity
    }

    fn read_locked(segments: &mut BTreeMap<u64, Segment>, position: u64, len: usize) -> Result<Option<Vec<u8>>> {
        if len == 0 {
            return Ok(Some(Vec::new()));
        }
        let Some((&start, seg)) = segments.range(..=position).next_back() else {
            return Ok(None);
        };
        if position + len as u64 > seg.filled_end() || position < start {
            return Ok(None);
        }
        Ok(Some(seg.read_at(position, len)?))
    }

    /// Reads `len` bytes at `position`. Returns `Ok(None)` if the bytes
    /// aren't present (gap or beyond highest), which callers treat as EOF.
    pub fn read(&self, position: u64, len: usize) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().unwrap();
        Self::read_locked(&mut inner.segments, position, len)
    }

    /// Sets a *potential* commit position; the effective commit position
    /// (returned) can never exceed the contiguous highest position.
    pub fn commit(&self, position: u64) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let effective = position.min(inner.highest);
        if effective > inner.commit {
            inner.commit = effective;
            self.commit_cv.notify_all();
        }
        inner.commit
    }

    /// Atomically captures `{term, highest_position, commit_position}`.
    pub fn capture_highest(&self) -> HighestInfo {
        let inner = self.inner.lock().unwrap();
        HighestInfo { term: self.term, highest_position: inner.highest, commit_position: inner.commit }
    }

    /// Nails down `end_position`; any data at/after it is discarded. Fails if
    /// `end_position` would fall below the current commit position.
    pub fn finish_term(&self, end_position: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if end_position < inner.commit {
            return Err(Error::Protocol(format!(
                "finish_term({end_position}) below commit position {}",
                inner.commit
            )));
        }
        inner.end = end_position;
        if inner.highest > end_position {
            inner.highest = end_position;
        }
        // Drop (and delete) segments that start at or beyond the new end.
        let to_drop: Vec<u64> = inner.segments.range(end_position..).map(|(&s, _)| s).collect();
        for start in to_drop {
            if let Some(seg) = inner.segments.remove(&start) {
                let _ = seg.delete();
            }
        }
        Ok(())
    }

    /// Walks `[contig, highest)` for gaps, invoking `cb(start, end)` for each
    /// one found, and returns the advanced contiguous pointer (the highest
    /// position reachable from `contig` without crossing a gap).
    pub fn check_for_missing_data(&self, contig: u64, mut cb: impl FnMut(u64, u64)) -> u64 {
        let inner = self.inner.lock().unwrap();
        let mut cursor = contig;
        for (&start, seg) in inner.segments.range(contig..) {
            if start > cursor {
                cb(cursor, start);
                break;
            }
            let filled_end = seg.filled_end().min(inner.highest);
            if filled_end > cursor {
                cursor = filled_end;
            }
            if seg.filled_end() < seg.end() && seg.end() <= inner.highest {
                // Partially filled segment below highest: gap inside the segment.
                cb(filled_end, seg.end().min(inner.highest));
                break;
            }
        }
        cursor
    }

    /// Raises `start` to at most `position`, deleting segments entirely below
    /// the new start and possibly updating `prev_term` (to this term, since
    /// the old prev_term's byte is no longer retained).
    pub fn compact(&self, position: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let new_start = position.min(inner.highest);
        if new_start <= inner.start {
            return Ok(());
        }
        let to_drop: Vec<u64> = inner
            .segments
            .iter()
            .filter(|(_, seg)| seg.end() <= new_start)
            .map(|(&s, _)| s)
            .collect();
        for start in to_drop {
            if let Some(seg) = inner.segments.remove(&start) {
                let _ = seg.delete();
            }
        }
        inner.start = new_start;
        Ok(())
    }

    /// Fsyncs all filled segments up to the highest position.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for seg in inner.segments.values_mut() {
            seg.sync()?;
        }
        Ok(())
    }

    /// Blocks (with an optional timeout; `None` means wait forever) until the
    /// commit position reaches at least `position`. Returns the commit
    /// position, or `Error::ConfirmationTimeout` if the deadline passed.
    pub fn wait_for_commit(&self, position: u64, timeout: Option<Duration>) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let deadline = timeout.map(|t| Instant::now() + t);
        while inner.commit < position {
            match deadline {
                None => inner = self.commit_cv.wait(inner).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::ConfirmationTimeout);
                    }
                    let (next, timed_out) = self.commit_cv.wait_timeout(inner, deadline - now).unwrap();
                    inner = next;
                    if timed_out.timed_out() && inner.commit < position {
                        return Err(Error::ConfirmationTimeout);
                    }
                }
            }
        }
        Ok(inner.commit)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_log(dir: &TempDir) -> TermLog {
        TermLog::new(dir.path(), 1, 2, 0)
    }

    #[test]
    fn write_commit_read_round_trip() {
        let dir = TempDir::with_prefix("raftcore-termlog").unwrap();
        let log = new_log(&dir);
        log.write(0, b"abcd").unwrap();
        assert_eq!(log.capture_highest().highest_position, 4);
        assert_eq!(log.commit(4), 4);
        assert_eq!(log.read(0, 4).unwrap().unwrap(), b"abcd");
    }

    #[test]
    fn commit_capped_at_highest() {
        let dir = TempDir::with_prefix("raftcore-termlog").unwrap();
        let log = new_log(&dir);
        log.write(0, b"ab").unwrap();
        assert_eq!(log.commit(100), 2);
    }

    #[test]
    fn idempotent_overlapping_write_accepted() {
        let dir = TempDir::with_prefix("raftcore-termlog").unwrap();
        let log = new_log(&dir);
        log.write(0, b"abcd").unwrap();
        log.commit(4);
        // Same bytes again: accepted silently.
        log.write(0, b"abcd").unwrap();
    }

    #[test]
    fn conflicting_committed_write_rejected() {
        let dir = TempDir::with_prefix("raftcore-termlog").unwrap();
        let log = new_log(&dir);
        log.write(0, b"abcd").unwrap();
        log.commit(4);
        let err = log.write(0, b"xxcd").unwrap_err();
        assert!(matches!(err, Error::CommitConflict { .. }));
    }

    #[test]
    fn missing_data_reports_gap() {
        let dir = TempDir::with_prefix("raftcore-termlog").unwrap();
        let log = new_log(&dir);
        log.write(0, b"ab").unwrap();
        log.write(10, b"cd").unwrap();
        let mut gaps = Vec::new();
        log.check_for_missing_data(0, |s, e| gaps.push((s, e)));
        assert_eq!(gaps, vec![(2, 10)]);
    }

    #[test]
    fn wait_for_commit_times_out() {
        let dir = TempDir::with_prefix("raftcore-termlog").unwrap();
        let log = new_log(&dir);
        let err = log.wait_for_commit(1, Some(Duration::from_millis(10))).unwrap_err();
        assert!(matches!(err, Error::ConfirmationTimeout));
    }

    #[test]
    fn finish_term_rejects_below_commit() {
        let dir = TempDir::with_prefix("raftcore-termlog").unwrap();
        let log = new_log(&dir);
        log.write(0, b"abcd").unwrap();
        log.commit(4);
        assert!(log.finish_term(2).is_err());
        assert!(log.finish_term(4).is_ok());
    }
}
