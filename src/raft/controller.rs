//! Controller (§4.F): the Raft role state machine — elections, vote
//! discipline, commit advancement from quorum match positions, proxying, and
//! catch-up scheduling. Built on top of `StateLog` for persistence and
//! `Peer`/`RangeSet` for per-remote-member bookkeeping.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};
use crate::log::StateLog;
use crate::raft::peer::{MemberId, Peer};
use crate::raft::range_set::RangeSet;
use crate::raft::role::Role;

/// The controller's own role, distinct from a `Peer`'s `Role` (membership
/// role): this tracks Raft leadership state, not group membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerRole {
    Follower,
    Candidate,
    Leader,
    /// Elected by a quorum made entirely of `STANDBY` members; refuses new
    /// client writes until a `NORMAL` member can take over (§4.F).
    InterimLeader,
}

impl ControllerRole {
    fn code(self) -> u8 {
        match self {
            ControllerRole::Follower => 0,
            ControllerRole::Candidate => 1,
            ControllerRole::Leader => 2,
            ControllerRole::InterimLeader => 3,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => ControllerRole::Follower,
            1 => ControllerRole::Candidate,
            2 => ControllerRole::Leader,
            _ => ControllerRole::InterimLeader,
        }
    }
}

/// Bounds for the randomized election timeout (§4.F); concrete durations are
/// picked uniformly within this window on every reset.
#[derive(Debug, Clone, Copy)]
pub struct ElectionTimeoutRange {
    pub min: Duration,
    pub max: Duration,
}

impl Default for ElectionTimeoutRange {
    fn default() -> Self {
        Self { min: Duration::from_millis(500), max: Duration::from_millis(1000) }
    }
}

/// Catch-up bookkeeping and the leader-only volatile state for one peer.
struct PeerState {
    peer: Arc<Peer>,
    /// Ranges this peer is known to be missing, populated from
    /// `QUERY_DATA_REPLY_MISSING` and serviced lazily by a catch-up
    /// responder (§4.F "Catch-up").
    missing: RangeSet,
}

/// Everything the controller needs to track for the local member.
pub struct Controller {
    local_id: MemberId,
    log: Arc<StateLog>,
    role: AtomicU8,
    election_timeout: ElectionTimeoutRange,
    peers: Mutex<BTreeMap<MemberId, PeerState>>,
    /// Members that granted a vote in the current election term. Cleared on
    /// every new `start_election`.
    votes_granted: Mutex<HashSet<MemberId>>,
    /// Whether the local member itself provides consensus (`NORMAL` or
    /// `STANDBY`); used to decide interim vs. full leadership.
    local_provides_consensus: bool,
    local_role: Role,
}

impl Controller {
    pub fn new(local_id: MemberId, log: Arc<StateLog>) -> Self {
        Self::with_role(local_id, log, Role::Normal)
    }

    pub fn with_role(local_id: MemberId, log: Arc<StateLog>, local_role: Role) -> Self {
        Self {
            local_id,
            log,
            role: AtomicU8::new(ControllerRole::Follower.code()),
            election_timeout: ElectionTimeoutRange::default(),
            peers: Mutex::new(BTreeMap::new()),
            votes_granted: Mutex::new(HashSet::new()),
            local_provides_consensus: local_role.provides_consensus(),
            local_role,
        }
    }

    pub fn role(&self) -> ControllerRole {
        ControllerRole::from_code(self.role.load(Ordering::Acquire))
    }

    fn set_role(&self, role: ControllerRole) {
        self.role.store(role.code(), Ordering::Release);
    }

    pub fn add_peer(&self, peer: Arc<Peer>) {
        self.peers.lock().unwrap().insert(peer.id, PeerState { peer, missing: RangeSet::new() });
    }

    /// Picks a uniformly random duration within the election-timeout window;
    /// called whenever the election timer is reset (on granting a vote, on
    /// hearing from a valid leader, or after losing an election).
    pub fn random_election_timeout(&self) -> Duration {
        let mut rng = rand::rng();
        let min = self.election_timeout.min.as_millis() as u64;
        let max = self.election_timeout.max.as_millis() as u64;
        Duration::from_millis(rng.random_range(min..=max))
    }

    /// Starts a new election: bumps `currentTerm`, votes for self, and
    /// returns the `(term, candidate_id, highest_term, highest_position)`
    /// tuple to broadcast as `REQUEST_VOTE`.
    pub fn start_election(&self) -> Result<(u64, MemberId, u64, u64)> {
        self.set_role(ControllerRole::Candidate);
        let term = self.log.increment_current_term(1, self.local_id)?;
        let mut votes = self.votes_granted.lock().unwrap();
        votes.clear();
        if self.local_provides_consensus {
            votes.insert(self.local_id);
        }
        drop(votes);
        let highest = self.log.capture_highest().expect("primordial term log always exists");
        Ok((term, self.local_id, highest.term, highest.highest_position))
    }

    /// A voter's decision on an incoming `REQUEST_VOTE`: grants iff the
    /// candidate's term is strictly ahead of ours and its `(highestTerm,
    /// highestPosition)` is not behind ours (§4.F).
    pub fn decide_vote(
        &self,
        candidate_term: u64,
        candidate_id: MemberId,
        candidate_highest_term: u64,
        candidate_highest_position: u64,
    ) -> (u64, bool) {
        let (current_term, _) = self.log.current_term_and_vote();
        if candidate_term <= current_term {
            return (current_term, false);
        }
        let local_highest = self.log.capture_highest().expect("primordial term log always exists");
        let candidate_behind = candidate_highest_term < local_highest.term
            || (candidate_highest_term == local_highest.term
                && candidate_highest_position < local_highest.highest_position);
        if candidate_behind {
            let _ = self.log.increment_current_term(candidate_term - current_term, 0);
            return (candidate_term, false);
        }
        if !self.log.check_candidate(candidate_id) {
            return (candidate_term, false);
        }
        let new_term = self.log.increment_current_term(candidate_term - current_term, candidate_id).unwrap_or(candidate_term);
        (new_term, true)
    }

    /// Applies a `REQUEST_VOTE_REPLY`. Once a strict majority of
    /// `providesConsensus` members (counting self) has granted in the
    /// current election, becomes leader — or interim leader if every
    /// granting voter (including self, if counted) is `STANDBY`.
    pub fn record_vote(&self, granted_by: MemberId, granted: bool) {
        if !granted || self.role() != ControllerRole::Candidate {
            return;
        }
        let peers = self.peers.lock().unwrap();
        if !peers.get(&granted_by).map(|p| p.peer.provides_consensus()).unwrap_or(false) {
            return;
        }
        let mut votes = self.votes_granted.lock().unwrap();
        votes.insert(granted_by);

        let consensus_total = peers.values().filter(|p| p.peer.provides_consensus()).count()
            + usize::from(self.local_provides_consensus);
        let majority = consensus_total / 2 + 1;
        if votes.len() < majority {
            return;
        }

        let all_standby = (!self.local_provides_consensus || self.local_role == Role::Standby)
            && votes.iter().all(|id| {
                *id == self.local_id || peers.get(id).map(|p| p.peer.role() == Role::Standby).unwrap_or(true)
            });
        drop(votes);
        drop(peers);
        self.set_role(if all_standby { ControllerRole::InterimLeader } else { ControllerRole::Leader });
    }

    pub fn become_follower(&self) {
        self.set_role(ControllerRole::Follower);
    }

    /// Directly sets the controller's role, bypassing the election protocol.
    /// Used by callers that have already determined the outcome through some
    /// other path (tests, or a restart that recovers a known leadership
    /// state from the group file).
    pub fn force_role(&self, role: ControllerRole) {
        self.set_role(role);
    }

    /// A leader-only write entry point. Rejects immediately if this member
    /// isn't (at least) an interim leader, and refuses new writes while
    /// interim (§4.F "STANDBY → interim-leader write refusal").
    pub fn propose_write(&self, prev_term: u64, term: u64, position: u64, data: &[u8]) -> Result<()> {
        match self.role() {
            ControllerRole::Leader => {}
            ControllerRole::InterimLeader => return Err(Error::InterimLeader),
            _ => return Err(Error::NotLeader { leader_hint: None }),
        }
        self.log.write(prev_term, term, position, data)
    }

    /// A follower's handling of `WRITE_DATA`: accepts iff `prevTermAt(pos) ==
    /// prevTerm`, defining the term log on demand. On term mismatch the
    /// caller should report back its own `highestPosition` so the leader can
    /// back off, rather than erroring the connection.
    pub fn accept_write(&self, prev_term: u64, term: u64, position: u64, data: &[u8]) -> Result<()> {
        let (current_term, _) = self.log.current_term_and_vote();
        if term > current_term {
            self.log.increment_current_term(term - current_term, 0)?;
        }
        self.log.define_term(prev_term, term, position)?;
        self.log.write(prev_term, term, position, data)
    }

    /// Leader-side commit advancement: the highest position with a quorum of
    /// `matchPosition >= p` among consensus-providing members (counting
    /// self), restricted to bytes the local highest-term write actually
    /// covers (§4.F "Commit").
    pub fn compute_commit_position(&self, local_highest_position: u64) -> u64 {
        let peers = self.peers.lock().unwrap();
        let mut positions: Vec<u64> = vec![local_highest_position];
        for state in peers.values() {
            if state.peer.provides_consensus() {
                positions.push(state.peer.match_position());
            }
        }
        positions.sort_unstable();
        // Majority-of-N: the position at index `(N-1)/2` from the top is the
        // highest value held by at least a majority.
        let n = positions.len();
        positions[(n - 1) / 2]
    }

    /// Records a peer's acknowledgement of a `WRITE_DATA_REPLY`.
    pub fn record_match_position(&self, peer_id: MemberId, position: u64) {
        if let Some(state) = self.peers.lock().unwrap().get(&peer_id) {
            state.peer.advance_match_position(position);
        }
    }

    /// Records a gap a peer reported via `QUERY_DATA_REPLY_MISSING`, to be
    /// serviced lazily by a catch-up responder.
    pub fn record_missing(&self, peer_id: MemberId, start: u64, end: u64) {
        if let Some(state) = self.peers.lock().unwrap().get(&peer_id) {
            state.missing.insert(start, end);
        }
    }

    /// Pops the next catch-up range to service for `peer_id`, if any.
    pub fn next_catch_up_range(&self, peer_id: MemberId) -> Option<(u64, u64)> {
        let peers = self.peers.lock().unwrap();
        let state = peers.get(&peer_id)?;
        state.missing.take_first().map(|r| (r.start, r.end))
    }

    /// `failover()`: a leader voluntarily steps down. Succeeds iff at least
    /// one consensus peer has caught up to the leader's own highest
    /// position.
    pub fn failover(&self, local_highest_position: u64) -> Result<()> {
        if self.role() != ControllerRole::Leader {
            return Err(Error::NotLeader { leader_hint: None });
        }
        let peers = self.peers.lock().unwrap();
        let ready = peers
            .values()
            .any(|s| s.peer.provides_consensus() && s.peer.match_position() >= local_highest_position);
        if !ready {
            return Err(Error::NoConsensus);
        }
        drop(peers);
        self.become_follower();
        Ok(())
    }

    /// Application-facing `syncCommit(p, timeout)`: blocks until the local
    /// commit position reaches `p`, then requests quorum durability via the
    /// state log's `sync_commit`, returning once this member's own durable
    /// position has advanced. A full quorum-of-`SYNC_COMMIT_REPLY` wait is
    /// the channel manager's responsibility; this method covers the local
    /// half of the contract (§4.F, §4.C).
    pub fn sync_commit(&self, prev_term: u64, term: u64, position: u64, timeout: Option<Duration>) -> Result<u64> {
        self.log.wait_for_commit(position, timeout)?;
        self.log.sync_commit(prev_term, term, position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tempfile::TempDir;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn new_controller(dir: &TempDir) -> Controller {
        let log =
            Arc::new(StateLog::open(dir.path().join("segs"), dir.path().join("base.md")).unwrap());
        Controller::new(1, log)
    }

    #[test]
    fn starts_as_follower() {
        let dir = TempDir::with_prefix("raftcore-controller").unwrap();
        let controller = new_controller(&dir);
        assert_eq!(controller.role(), ControllerRole::Follower);
    }

    #[test]
    fn start_election_becomes_candidate_and_bumps_term() {
        let dir = TempDir::with_prefix("raftcore-controller").unwrap();
        let controller = new_controller(&dir);
        let (term, candidate, _, _) = controller.start_election().unwrap();
        assert_eq!(controller.role(), ControllerRole::Candidate);
        assert_eq!(term, 1);
        assert_eq!(candidate, 1);
    }

    #[test]
    fn decide_vote_rejects_stale_term() {
        let dir = TempDir::with_prefix("raftcore-controller").unwrap();
        let controller = new_controller(&dir);
        controller.log.increment_current_term(5, 9).unwrap();
        let (_, granted) = controller.decide_vote(3, 2, 0, 0);
        assert!(!granted);
    }

    #[test]
    fn decide_vote_grants_when_caller_ahead_and_unvoted() {
        let dir = TempDir::with_prefix("raftcore-controller").unwrap();
        let controller = new_controller(&dir);
        let (term, granted) = controller.decide_vote(5, 2, 1, 0);
        assert!(granted);
        assert_eq!(term, 5);
    }

    #[test]
    fn compute_commit_position_is_majority_of_match_positions() {
        let dir = TempDir::with_prefix("raftcore-controller").unwrap();
        let controller = new_controller(&dir);
        let p2 = Arc::new(Peer::new(2, addr(6001), Role::Normal));
        let p3 = Arc::new(Peer::new(3, addr(6002), Role::Normal));
        p2.advance_match_position(10);
        p3.advance_match_position(4);
        controller.add_peer(p2);
        controller.add_peer(p3);
        // local=8, peers={10,4} -> sorted [4,8,10], majority index (3-1)/2=1 -> 8
        assert_eq!(controller.compute_commit_position(8), 8);
    }

    #[test]
    fn propose_write_rejects_when_not_leader() {
        let dir = TempDir::with_prefix("raftcore-controller").unwrap();
        let controller = new_controller(&dir);
        let err = controller.propose_write(1, 1, 0, b"x").unwrap_err();
        assert!(matches!(err, Error::NotLeader { .. }));
    }

    #[test]
    fn interim_leader_refuses_writes() {
        let dir = TempDir::with_prefix("raftcore-controller").unwrap();
        let controller = new_controller(&dir);
        controller.force_role(ControllerRole::InterimLeader);
        let err = controller.propose_write(1, 1, 0, b"x").unwrap_err();
        assert!(matches!(err, Error::InterimLeader));
    }

    #[test]
    fn failover_requires_a_caught_up_peer() {
        let dir = TempDir::with_prefix("raftcore-controller").unwrap();
        let controller = new_controller(&dir);
        controller.force_role(ControllerRole::Leader);
        let err = controller.failover(100).unwrap_err();
        assert!(matches!(err, Error::NoConsensus));

        let peer = Arc::new(Peer::new(2, addr(6003), Role::Normal));
        peer.advance_match_position(100);
        controller.add_peer(peer);
        controller.failover(100).unwrap();
        assert_eq!(controller.role(), ControllerRole::Follower);
    }
}
