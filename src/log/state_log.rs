//! The state log (§4.C): the union of all term logs plus the metadata file,
//! with the readers-writer/metadata-before-log locking order from §5 and the
//! idempotent `define_term` conflict resolution that generalizes
//! `raft::log::Log::splice`'s "truncate on conflicting, not-yet-committed
//! data" rule from index-keyed entries to byte-position term logs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use crate::config::{parse_segment_file_name, segment_file_name};
use crate::error::{Error, Result};
use crate::log::metadata::{Fields, MetadataFile};
use crate::log::segment::{Segment, SegmentId};
use crate::log::term_log::{HighestInfo, TermLog, DEFAULT_SEGMENT_CAPACITY};

/// Base name segment files are built from inside `base_path`, per §6's
/// `<base>[.<prevTerm>].<term>.<startPos>` convention.
const SEGMENT_BASE_NAME: &str = "segment";

/// Gaps reported by `check_for_missing_data`, one per term log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub start: u64,
    pub end: u64,
}

struct Log {
    /// Term logs keyed by their start position. Access is guarded by a
    /// readers-writer lock so that `capture_highest` (a reader) doesn't block
    /// behind an in-progress write unnecessarily.
    terms: RwLock<BTreeMap<u64, TermLog>>,
}

/// The union of all term logs plus the durable metadata file.
///
/// Locking order is metadata before log (§5, §9): any path that touches both
/// acquires `metadata` first. `StateLog` enforces this by only ever locking
/// `terms` from within the scope that already holds `metadata`, never the
/// reverse.
pub struct StateLog {
    base_path: std::path::PathBuf,
    metadata: std::sync::Mutex<MetadataFile>,
    log: Log,
}

impl StateLog {
    /// Opens (or initializes) the state log rooted at `base_path`, recovering
    /// metadata and any existing term-log segment files, per §4.C
    /// "Recovery".
    pub fn open(base_path: impl Into<std::path::PathBuf>, metadata_path: impl AsRef<std::path::Path>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        let metadata = MetadataFile::open(metadata_path)?;
        let fields = metadata.fields();

        let terms = RwLock::new(BTreeMap::new());
        let state_log = Self { base_path, metadata: std::sync::Mutex::new(metadata), log: Log { terms } };
        state_log.recover(&fields)?;

        // Final commit(durablePosition), per §4.C "Recovery".
        if fields.durable_position > 0 {
            state_log.commit(fields.durable_position);
        }

        Ok(state_log)
    }

    /// §4.C "Recovery": scans `base_path` for existing segment files, groups
    /// them by `(prev_term, term)` into term logs, deletes any whose term
    /// exceeds the persisted `highest_term`, and otherwise reopens every
    /// remaining segment so reads after reopen match reads before the crash.
    /// If nothing is found on disk, creates a primordial term log at
    /// position 0 (first boot).
    ///
    /// Assumes (as the writer does) that a term log's segments are exactly
    /// the capacity-aligned files named for its `(prev_term, term)`, and that
    /// term logs are contiguous: the next term log (by start position) begins
    /// exactly where the previous one's last segment ends.
    fn recover(&self, fields: &Fields) -> Result<()> {
        let mut groups: BTreeMap<(u64, u64), Vec<u64>> = BTreeMap::new();
        for entry in std::fs::read_dir(&self.base_path)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else { continue };
            let Some((prev_term, term, start)) = parse_segment_file_name(&name, SEGMENT_BASE_NAME) else {
                continue;
            };
            groups.entry((prev_term, term)).or_default().push(start);
        }

        if fields.highest_term > 0 {
            let stale: Vec<(u64, u64)> = groups.keys().copied().filter(|&(_, term)| term > fields.highest_term).collect();
            for key @ (prev_term, term) in stale {
                if let Some(starts) = groups.remove(&key) {
                    for start in starts {
                        let path = self.segment_path(prev_term, term, start);
                        let _ = std::fs::remove_file(path);
                    }
                }
            }
        }

        if groups.is_empty() {
            let term = if fields.highest_term > 0 { fields.highest_term } else { 1 };
            let prev_term = if fields.highest_term > 0 { fields.highest_prev_term } else { term };
            let log = TermLog::new(self.base_path.clone(), prev_term, term, 0);
            self.log.terms.write().unwrap().insert(0, log);
            return Ok(());
        }

        let mut ordered: Vec<((u64, u64), Vec<u64>)> = groups.into_iter().collect();
        for (_, starts) in ordered.iter_mut() {
            starts.sort_unstable();
        }
        ordered.sort_by_key(|(_, starts)| starts[0]);

        let mut terms = self.log.terms.write().unwrap();
        for (i, ((prev_term, term), starts)) in ordered.iter().enumerate() {
            let group_start = starts[0];
            let last_seg_start = *starts.last().expect("non-empty group");
            let next_group_start = ordered.get(i + 1).map(|(_, s)| s[0]);
            let is_last_group = next_group_start.is_none();
            let end = next_group_start.unwrap_or(u64::MAX);

            let mut segments = BTreeMap::new();
            for &seg_start in starts {
                let id = SegmentId { prev_term: *prev_term, term: *term, start: seg_start };
                let path = self.segment_path(*prev_term, *term, seg_start);
                let is_last_segment = seg_start == last_seg_start;
                let filled = if !is_last_segment {
                    DEFAULT_SEGMENT_CAPACITY
                } else if is_last_group && *term == fields.highest_term {
                    fields.highest_position.saturating_sub(seg_start).min(DEFAULT_SEGMENT_CAPACITY)
                } else if !is_last_group {
                    end.saturating_sub(seg_start).min(DEFAULT_SEGMENT_CAPACITY)
                } else {
                    DEFAULT_SEGMENT_CAPACITY
                };
                segments.insert(seg_start, Segment::open(path, id, DEFAULT_SEGMENT_CAPACITY, filled)?);
            }

            let highest = segments.values().map(|s| s.filled_end()).max().unwrap_or(group_start);
            let commit = if is_last_group { fields.durable_position.min(highest) } else { end };

            let log = TermLog::from_recovered(self.base_path.clone(), *prev_term, *term, group_start, end, segments, highest, commit);
            terms.insert(group_start, log);
        }

        Ok(())
    }

    fn segment_path(&self, prev_term: u64, term: u64, start: u64) -> PathBuf {
        segment_file_name(&self.base_path.join(SEGMENT_BASE_NAME), prev_term, term, start)
    }

    /// Idempotent registration of a term log starting at `position` with the
    /// given `(prev_term, term)`. Returns `Ok(false)` iff `term` already has
    /// committed data that disagrees, or `term` is behind an existing term
    /// log at the same start.
    pub fn define_term(&self, prev_term: u64, term: u64, position: u64) -> Result<bool> {
        let mut terms = self.log.terms.write().unwrap();

        if let Some(existing) = terms.get(&position) {
            if existing.term == term && existing.prev_term == prev_term {
                return Ok(true); // idempotent match
            }
            if existing.term > term {
                return Ok(false); // existing term log wins
            }
            if existing.commit_position() > existing.start() {
                return Ok(false); // existing term log has committed data
            }
            // Empty conflicting term log: discard it and anything above it.
            let to_remove: Vec<u64> = terms.range(position..).map(|(&s, _)| s).collect();
            for s in to_remove {
                terms.remove(&s);
            }
        }

        terms.insert(position, TermLog::new(self.base_path.clone(), prev_term, term, position));
        Ok(true)
    }

    /// Returns the term log governing `position`, if any (the term log whose
    /// `[start, end)` contains it).
    fn term_log_locked<'a>(terms: &'a BTreeMap<u64, TermLog>, position: u64) -> Option<&'a TermLog> {
        terms.range(..=position).next_back().map(|(_, log)| log).filter(|log| position < log.end())
    }

    pub fn write(&self, prev_term: u64, term: u64, position: u64, data: &[u8]) -> Result<()> {
        let terms = self.log.terms.read().unwrap();
        let log = Self::term_log_locked(&terms, position)
            .ok_or_else(|| Error::Protocol(format!("no term log covers position {position}")))?;
        if log.prev_term_at(position) != prev_term {
            return Err(Error::Protocol(format!(
                "prev_term mismatch at {position}: have {}, got {prev_term}",
                log.prev_term_at(position)
            )));
        }
        if log.term != term {
            return Err(Error::Protocol(format!("term mismatch at {position}: have {}, got {term}", log.term)));
        }
        log.write(position, data)?;

        // Persist the new contiguous highest so a crash right after this
        // write still recovers it (§4.C); the terms lock must be released
        // first, per the metadata-before-log locking order.
        let info = log.capture_highest();
        let log_prev_term = log.prev_term;
        drop(terms);
        self.persist_highest(log_prev_term, info.term, info.highest_position)
    }

    pub fn read(&self, position: u64, len: usize) -> Result<Option<Vec<u8>>> {
        let terms = self.log.terms.read().unwrap();
        let Some(log) = Self::term_log_locked(&terms, position) else { return Ok(None) };
        log.read(position, len)
    }

    /// Finds the commit-bearing term log (the lowest whose `end > highest at
    /// p`) and applies `commit` to it and every later term log in
    /// **descending** order, per §4.C, so that a concurrent `capture_highest`
    /// ascending scan never observes a higher term's commit before a lower
    /// one's.
    pub fn commit(&self, position: u64) {
        let terms = self.log.terms.read().unwrap();
        let applicable: Vec<&TermLog> = terms.range(..=position).map(|(_, l)| l).collect();
        for log in applicable.into_iter().rev() {
            log.commit(position);
        }
    }

    /// Walks term logs ascending, returning the latest `capture_highest`
    /// reached before hitting one whose data doesn't yet extend to the next
    /// term log's start (i.e. the current frontier of contiguous data).
    pub fn capture_highest(&self) -> Option<HighestInfo> {
        let terms = self.log.terms.read().unwrap();
        let mut best: Option<HighestInfo> = None;
        for (&start, log) in terms.range(..) {
            let info = log.capture_highest();
            best = Some(info);
            let next_start = terms.range((start + 1)..).next().map(|(&s, _)| s);
            if let Some(next_start) = next_start {
                if info.highest_position < next_start {
                    break;
                }
            }
        }
        best
    }

    /// Ascending scan collecting gaps across all term logs; remembers (and
    /// returns) the highest fully contiguous position.
    pub fn check_for_missing_data(&self, contig: u64) -> (u64, Vec<Gap>) {
        let terms = self.log.terms.read().unwrap();
        let mut gaps = Vec::new();
        let mut cursor = contig;
        for (&start, log) in terms.range(..) {
            if start > cursor {
                gaps.push(Gap { start: cursor, end: start });
                break;
            }
            let before = cursor;
            cursor = log.check_for_missing_data(cursor.max(log.start()), |s, e| gaps.push(Gap { start: s, end: e }));
            if cursor == before && !gaps.is_empty() {
                break;
            }
        }
        (cursor, gaps)
    }

    /// Verifies the `(term, prev_term)` pair at `position`, fsyncs segments up
    /// to it, and persists a new `durable_position` in the metadata if `p`
    /// exceeds the previous one. Returns the new durable position, or an
    /// error on term mismatch (the Rust translation of the spec's `-1`
    /// sentinel).
    pub fn sync_commit(&self, prev_term: u64, term: u64, position: u64) -> Result<u64> {
        let terms = self.log.terms.read().unwrap();
        // `position` may equal a term log's `end` exactly (the whole term is
        // committed and synced); fall back to the last term log at or before
        // it in that case.
        let log = Self::term_log_locked(&terms, position)
            .or_else(|| terms.range(..=position).next_back().map(|(_, l)| l))
            .ok_or_else(|| Error::Protocol(format!("no term log covers position {position}")))?;
        if log.term != term || log.prev_term != prev_term {
            return Err(Error::Protocol(format!("sync_commit term mismatch at {position}")));
        }
        log.sync()?;
        drop(terms);

        let mut metadata = self.metadata.lock().unwrap();
        let mut fields = metadata.fields();
        if position > fields.durable_position {
            fields.durable_position = position;
            metadata.write(fields)?;
        }
        Ok(metadata.fields().durable_position)
    }

    /// Raises `durable_position` in metadata only, without syncing segments.
    pub fn commit_durable(&self, position: u64) -> Result<()> {
        let mut metadata = self.metadata.lock().unwrap();
        let mut fields = metadata.fields();
        if position > fields.durable_position {
            fields.durable_position = position;
            metadata.write(fields)?;
        }
        Ok(())
    }

    /// Guarded by the metadata latch; increments `current_term` by `inc` and
    /// records `candidate_id` as the vote, fsyncing before returning.
    pub fn increment_current_term(&self, inc: u64, candidate_id: u64) -> Result<u64> {
        let mut metadata = self.metadata.lock().unwrap();
        let mut fields = metadata.fields();
        fields.current_term += inc;
        fields.voted_for = candidate_id;
        metadata.write(fields)?;
        Ok(fields.current_term)
    }

    /// Returns whether `term` is still at or above the persisted current
    /// term (guards against acting on a stale term after a concurrent bump).
    pub fn check_current_term(&self, term: u64) -> bool {
        let metadata = self.metadata.lock().unwrap();
        term >= metadata.fields().current_term
    }

    /// Returns whether `id` is (or may become) the recorded vote for the
    /// current term: unset, or already granted to `id`.
    pub fn check_candidate(&self, id: u64) -> bool {
        let metadata = self.metadata.lock().unwrap();
        let voted_for = metadata.fields().voted_for;
        voted_for == 0 || voted_for == id
    }

    pub fn current_term_and_vote(&self) -> (u64, u64) {
        let metadata = self.metadata.lock().unwrap();
        let f = metadata.fields();
        (f.current_term, f.voted_for)
    }

    pub fn durable_position(&self) -> u64 {
        self.metadata.lock().unwrap().fields().durable_position
    }

    /// Persists `{highest_prev_term, highest_term, highest_position}`
    /// fsyncing before returning, per §3/§4.C.
    pub fn persist_highest(&self, prev_term: u64, term: u64, position: u64) -> Result<()> {
        let mut metadata = self.metadata.lock().unwrap();
        let mut fields = metadata.fields();
        fields.highest_prev_term = prev_term;
        fields.highest_term = term;
        fields.highest_position = position;
        metadata.write(fields)?;
        Ok(())
    }

    pub fn wait_for_commit(&self, position: u64, timeout: Option<Duration>) -> Result<u64> {
        let terms = self.log.terms.read().unwrap();
        let log = Self::term_log_locked(&terms, position)
            .ok_or_else(|| Error::Protocol(format!("no term log covers position {position}")))?;
        log.wait_for_commit(position, timeout)
    }

    pub fn metadata_fields(&self) -> Fields {
        self.metadata.lock().unwrap().fields()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> StateLog {
        StateLog::open(dir.path().join("segs"), dir.path().join("base.md")).unwrap()
    }

    #[test]
    fn define_term_is_idempotent() {
        let dir = TempDir::with_prefix("raftcore-statelog").unwrap();
        let log = open(&dir);
        assert!(log.define_term(1, 2, 4).unwrap());
        assert!(log.define_term(1, 2, 4).unwrap()); // idempotent
    }

    #[test]
    fn define_term_discards_empty_conflicting_term() {
        let dir = TempDir::with_prefix("raftcore-statelog").unwrap();
        let log = open(&dir);
        assert!(log.define_term(2, 3, 4).unwrap()); // stale leader's term, no data written
        assert!(log.define_term(2, 4, 4).unwrap()); // new leader wins, discards term 3
    }

    #[test]
    fn define_term_rejects_against_committed_data() {
        let dir = TempDir::with_prefix("raftcore-statelog").unwrap();
        let log = open(&dir);
        assert!(log.define_term(1, 5, 4).unwrap());
        log.write(1, 5, 4, b"ab").unwrap();
        log.commit(6);
        assert!(!log.define_term(1, 6, 4).unwrap());
    }

    #[test]
    fn write_commit_read_through_term_log() {
        let dir = TempDir::with_prefix("raftcore-statelog").unwrap();
        let log = open(&dir);
        let (prev, term) = { let f = log.metadata_fields(); (f.highest_prev_term, f.highest_term.max(1)) };
        log.define_term(prev, term, 0).unwrap();
        log.write(prev, term, 0, b"hello").unwrap();
        log.commit(5);
        assert_eq!(log.read(0, 5).unwrap().unwrap(), b"hello");
    }

    #[test]
    fn sync_commit_advances_durable_position() {
        let dir = TempDir::with_prefix("raftcore-statelog").unwrap();
        let log = open(&dir);
        let term = log.metadata_fields().highest_term.max(1);
        log.define_term(term, term, 0).unwrap();
        log.write(term, term, 0, b"hi").unwrap();
        log.commit(2);
        let durable = log.sync_commit(term, term, 2).unwrap();
        assert_eq!(durable, 2);
        assert_eq!(log.durable_position(), 2);
    }

    #[test]
    fn increment_current_term_persists() {
        let dir = TempDir::with_prefix("raftcore-statelog").unwrap();
        let log = open(&dir);
        let term = log.increment_current_term(1, 7).unwrap();
        assert_eq!(term, 1);
        assert_eq!(log.current_term_and_vote(), (1, 7));
    }
}
