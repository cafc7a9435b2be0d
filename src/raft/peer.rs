//! Per-remote-member state (§4.H): tracked via independent atomics so the
//! write-timeout supervisor, the controller's commit computation, and the
//! channel manager's reconnect logic never contend on a single mutex.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::raft::role::Role;

/// A non-zero member identifier, stable for the lifetime of the membership.
pub type MemberId = u64;

/// An in-flight snapshot transfer's load score, as reported by
/// `SNAPSHOT_SCORE_REPLY`. Read/written as a pair, hence the dedicated mutex
/// rather than two atomics (a torn read would pair a stale session count with
/// a fresh weight).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotScore {
    pub active_sessions: u32,
    pub weight: u32,
}

/// State tracked for one remote group member.
pub struct Peer {
    pub id: MemberId,
    pub address: SocketAddr,
    role: AtomicU8,
    match_position: AtomicU64,
    sync_match_position: AtomicU64,
    compact_position: AtomicU64,
    group_version: AtomicU64,
    snapshot_score: Mutex<Option<SnapshotScore>>,
}

impl Peer {
    pub fn new(id: MemberId, address: SocketAddr, role: Role) -> Self {
        Self {
            id,
            address,
            role: AtomicU8::new(role.code()),
            match_position: AtomicU64::new(0),
            sync_match_position: AtomicU64::new(0),
            compact_position: AtomicU64::new(0),
            group_version: AtomicU64::new(0),
            snapshot_score: Mutex::new(None),
        }
    }

    pub fn role(&self) -> Role {
        Role::from_code(self.role.load(Ordering::Acquire)).expect("only valid codes are ever stored")
    }

    pub fn set_role(&self, role: Role) {
        self.role.store(role.code(), Ordering::Release);
    }

    /// Mirrors `Role::provides_consensus` for this peer's current role.
    pub fn provides_consensus(&self) -> bool {
        self.role().provides_consensus()
    }

    pub fn match_position(&self) -> u64 {
        self.match_position.load(Ordering::Acquire)
    }

    /// Advances `matchPosition` to `position` if it isn't already ahead (a
    /// late, stale reply from an earlier write must never regress it).
    pub fn advance_match_position(&self, position: u64) {
        self.match_position.fetch_max(position, Ordering::AcqRel);
    }

    pub fn sync_match_position(&self) -> u64 {
        self.sync_match_position.load(Ordering::Acquire)
    }

    pub fn advance_sync_match_position(&self, position: u64) {
        self.sync_match_position.fetch_max(position, Ordering::AcqRel);
    }

    pub fn compact_position(&self) -> u64 {
        self.compact_position.load(Ordering::Acquire)
    }

    pub fn set_compact_position(&self, position: u64) {
        self.compact_position.fetch_max(position, Ordering::AcqRel);
    }

    pub fn group_version(&self) -> u64 {
        self.group_version.load(Ordering::Acquire)
    }

    pub fn set_group_version(&self, version: u64) {
        self.group_version.store(version, Ordering::Release);
    }

    pub fn snapshot_score(&self) -> Option<SnapshotScore> {
        *self.snapshot_score.lock().unwrap()
    }

    pub fn set_snapshot_score(&self, score: SnapshotScore) {
        *self.snapshot_score.lock().unwrap() = Some(score);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[test]
    fn match_position_never_regresses() {
        let peer = Peer::new(2, addr(), Role::Normal);
        peer.advance_match_position(100);
        peer.advance_match_position(50); // stale reply
        assert_eq!(peer.match_position(), 100);
    }

    #[test]
    fn provides_consensus_follows_role() {
        let peer = Peer::new(2, addr(), Role::Observer);
        assert!(!peer.provides_consensus());
        peer.set_role(Role::Standby);
        assert!(peer.provides_consensus());
    }

    #[test]
    fn snapshot_score_defaults_to_none() {
        let peer = Peer::new(2, addr(), Role::Normal);
        assert_eq!(peer.snapshot_score(), None);
        peer.set_snapshot_score(SnapshotScore { active_sessions: 3, weight: 7 });
        assert_eq!(peer.snapshot_score(), Some(SnapshotScore { active_sessions: 3, weight: 7 }));
    }
}
