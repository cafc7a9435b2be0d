//! Group file (§4.F, §6): the persisted membership roster, with a two-phase
//! propose/apply protocol for mutations and crash-safe `.new`/`.old` staging
//! modeled after the metadata file's "write fully, fsync, then swap in"
//! discipline.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use itertools::Itertools as _;

use crate::config::parse_address;
use crate::error::{Error, Result};
use crate::raft::message::Opcode;
use crate::raft::peer::MemberId;
use crate::raft::role::Role;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub version: u64,
    pub group_id: u64,
    pub members: BTreeMap<MemberId, (SocketAddr, Role)>,
}

impl Group {
    pub fn new(group_id: u64) -> Self {
        Self { version: 0, group_id, members: BTreeMap::new() }
    }

    /// Renders the text grammar from §6: a tag line, `version=`/`groupId=`,
    /// then one `memberId = address | ROLE` line per member.
    pub fn render(&self) -> String {
        let mut out = String::new();
        writeln!(out, "#raftcore group file").unwrap();
        writeln!(out, "version = {}", self.version).unwrap();
        writeln!(out, "groupId = {}", self.group_id).unwrap();
        let body = self
            .members
            .iter()
            .map(|(id, (addr, role))| format!("{id} = {addr} | {}", role.name()))
            .join("\n");
        if !body.is_empty() {
            writeln!(out, "{body}").unwrap();
        }
        out
    }

    /// Parses the grammar from §6. Unrecognized keys are ignored; a line
    /// that isn't `key = value` is also ignored (lenient, matching the
    /// spec's "unrecognized keys are ignored").
    pub fn parse(text: &str) -> Result<Self> {
        let mut version = None;
        let mut group_id = None;
        let mut members = BTreeMap::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else { continue };
            let key = key.trim();
            let value = value.trim();
            match key {
                "version" => {
                    version = Some(
                        value.parse::<u64>().map_err(|_| Error::Encoding(format!("bad version {value:?}")))?,
                    );
                }
                "groupId" => {
                    group_id = Some(
                        value.parse::<u64>().map_err(|_| Error::Encoding(format!("bad groupId {value:?}")))?,
                    );
                }
                _ => {
                    let Ok(id) = key.parse::<MemberId>() else { continue };
                    let Some((addr_str, role_str)) = value.split_once('|') else { continue };
                    let Ok(addr) = parse_address(addr_str.trim()) else { continue };
                    let Some(role) = Role::parse(role_str.trim()) else { continue };
                    members.insert(id, (addr, role));
                }
            }
        }

        Ok(Self {
            version: version.ok_or_else(|| Error::Encoding("missing version".into()))?,
            group_id: group_id.ok_or_else(|| Error::Encoding("missing groupId".into()))?,
            members,
        })
    }
}

/// A proposed mutation, keyed by its exact serialized bytes so the proposer
/// can register a completion callback against it (§4.G).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Join { member_id: MemberId, address: SocketAddr, role: Role },
    UpdateRole { member_id: MemberId, role: Role },
    Remove { member_id: MemberId },
}

impl Mutation {
    /// Renders the mutation as a single text line, the same grammar style as
    /// [`Group::render`]: `JOIN id addr role`, `ROLE id role`, `REMOVE id`.
    fn render(&self) -> String {
        match self {
            Mutation::Join { member_id, address, role } => format!("JOIN {member_id} {address} {}", role.name()),
            Mutation::UpdateRole { member_id, role } => format!("ROLE {member_id} {}", role.name()),
            Mutation::Remove { member_id } => format!("REMOVE {member_id}"),
        }
    }

    fn parse(text: &str) -> Result<Self> {
        let mut parts = text.split_whitespace();
        let kind = parts.next().ok_or_else(|| Error::Encoding("empty mutation".into()))?;
        let bad = |what: &str| Error::Encoding(format!("bad {kind} {what}"));
        match kind {
            "JOIN" => {
                let member_id =
                    parts.next().and_then(|s| s.parse().ok()).ok_or_else(|| bad("member id"))?;
                let address =
                    parts.next().and_then(|s| parse_address(s).ok()).ok_or_else(|| bad("address"))?;
                let role = parts.next().and_then(Role::parse).ok_or_else(|| bad("role"))?;
                Ok(Mutation::Join { member_id, address, role })
            }
            "ROLE" => {
                let member_id =
                    parts.next().and_then(|s| s.parse().ok()).ok_or_else(|| bad("member id"))?;
                let role = parts.next().and_then(Role::parse).ok_or_else(|| bad("role"))?;
                Ok(Mutation::UpdateRole { member_id, role })
            }
            "REMOVE" => {
                let member_id =
                    parts.next().and_then(|s| s.parse().ok()).ok_or_else(|| bad("member id"))?;
                Ok(Mutation::Remove { member_id })
            }
            other => Err(Error::Encoding(format!("unknown mutation kind {other:?}"))),
        }
    }
}

/// The on-disk group file, with crash-safe staged writes and the §4.G
/// propose/apply protocol: `propose` hands back the exact control-message
/// bytes to send and registers a completion callback against them; `apply`
/// delivers a copy of the resulting group to whichever callback was
/// registered for the bytes it was given.
pub struct GroupFile {
    path: PathBuf,
    current: Group,
    callbacks: Mutex<HashMap<Vec<u8>, crossbeam::channel::Sender<Group>>>,
}

impl GroupFile {
    fn new_path(path: &Path) -> PathBuf {
        let mut p = path.as_os_str().to_owned();
        p.push(".new");
        PathBuf::from(p)
    }

    fn old_path(path: &Path) -> PathBuf {
        let mut p = path.as_os_str().to_owned();
        p.push(".old");
        PathBuf::from(p)
    }

    /// Opens the group file at `path`, recovering from an interrupted update
    /// by preferring `.new` (fully fsynced, renamed pending) then `.old`
    /// (prior version, if both a new rename and cleanup were interrupted).
    pub fn open(path: impl Into<PathBuf>, group_id_if_absent: u64) -> Result<Self> {
        let path = path.into();
        let new_path = Self::new_path(&path);
        let old_path = Self::old_path(&path);

        if new_path.exists() {
            fs::rename(&new_path, &path)?;
        }

        let current = if path.exists() {
            Group::parse(&fs::read_to_string(&path)?)?
        } else if old_path.exists() {
            Group::parse(&fs::read_to_string(&old_path)?)?
        } else {
            Group::new(group_id_if_absent)
        };

        Ok(Self { path, current, callbacks: Mutex::new(HashMap::new()) })
    }

    pub fn current(&self) -> &Group {
        &self.current
    }

    /// Builds the §4.G control-message bytes `{opcode, expectedVersion,
    /// payload}` for `mutation` against the current version, and registers a
    /// completion callback keyed by those exact bytes. The receiver yields a
    /// copy of the resulting group once a matching `apply` succeeds, or
    /// disconnects if this `GroupFile` is dropped first without applying it.
    pub fn propose(&self, mutation: Mutation) -> (Vec<u8>, crossbeam::channel::Receiver<Group>) {
        let message = Self::proposal_bytes(self.current.version, &mutation);
        let (tx, rx) = crossbeam::channel::bounded(1);
        self.callbacks.lock().unwrap().insert(message.clone(), tx);
        (message, rx)
    }

    fn proposal_bytes(expected_version: u64, mutation: &Mutation) -> Vec<u8> {
        let mut buf = vec![Opcode::GroupFile as u8];
        buf.extend_from_slice(&expected_version.to_le_bytes());
        buf.extend_from_slice(mutation.render().as_bytes());
        buf
    }

    /// The inverse of `proposal_bytes`: decodes a received `GROUP_FILE`
    /// command body back into `(expectedVersion, mutation)`.
    pub fn decode_proposal(message: &[u8]) -> Result<(u64, Mutation)> {
        if message.len() < 9 || message[0] != Opcode::GroupFile as u8 {
            return Err(Error::Encoding("malformed group file proposal".into()));
        }
        let expected_version = u64::from_le_bytes(message[1..9].try_into().expect("8-byte slice"));
        let mutation = Mutation::parse(std::str::from_utf8(&message[9..]).map_err(|_| {
            Error::Encoding("group file proposal payload is not UTF-8".into())
        })?)?;
        Ok((expected_version, mutation))
    }

    /// Applies `mutation` iff `expected_version` matches the current
    /// version; writes `<path>.new`, fsyncs, renames the existing file to
    /// `.old`, then renames `.new` into place, per §4.F/§6. On success,
    /// delivers a copy of the resulting group to the callback registered by
    /// `propose` for this exact `(expected_version, mutation)`, if any.
    pub fn apply(&mut self, expected_version: u64, mutation: Mutation) -> Result<u64> {
        if expected_version != self.current.version {
            return Err(Error::VersionMismatch { expected: expected_version, actual: self.current.version });
        }
        let message = Self::proposal_bytes(expected_version, &mutation);

        let mut next = self.current.clone();
        match mutation {
            Mutation::Join { member_id, address, role } => {
                next.members.insert(member_id, (address, role));
            }
            Mutation::UpdateRole { member_id, role } => {
                let Some(entry) = next.members.get_mut(&member_id) else {
                    return Err(Error::Protocol(format!("unknown member {member_id}")));
                };
                entry.1 = role;
            }
            Mutation::Remove { member_id } => {
                next.members.remove(&member_id);
            }
        }
        next.version += 1;

        let new_path = Self::new_path(&self.path);
        fs::write(&new_path, next.render())?;
        {
            let f = fs::File::open(&new_path)?;
            f.sync_all()?;
        }
        if self.path.exists() {
            fs::rename(&self.path, Self::old_path(&self.path))?;
        }
        fs::rename(&new_path, &self.path)?;

        self.current = next;

        if let Some(tx) = self.callbacks.lock().unwrap().remove(&message) {
            let _ = tx.send(self.current.clone());
        }

        Ok(self.current.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn render_then_parse_round_trips() {
        let mut group = Group::new(7);
        group.version = 3;
        group.members.insert(1, ("127.0.0.1:5000".parse().unwrap(), Role::Normal));
        group.members.insert(2, ("127.0.0.1:5001".parse().unwrap(), Role::Observer));

        let parsed = Group::parse(&group.render()).unwrap();
        assert_eq!(parsed, group);
    }

    #[test]
    fn apply_rejects_stale_version() {
        let dir = TempDir::with_prefix("raftcore-group").unwrap();
        let mut file = GroupFile::open(dir.path().join("g"), 1).unwrap();
        let err = file
            .apply(5, Mutation::Join { member_id: 2, address: "127.0.0.1:6000".parse().unwrap(), role: Role::Normal })
            .unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { .. }));
    }

    #[test]
    fn apply_join_then_reopen_recovers_state() {
        let dir = TempDir::with_prefix("raftcore-group").unwrap();
        let path = dir.path().join("g");
        let mut file = GroupFile::open(&path, 1).unwrap();
        let v = file
            .apply(0, Mutation::Join { member_id: 2, address: "127.0.0.1:6000".parse().unwrap(), role: Role::Normal })
            .unwrap();
        assert_eq!(v, 1);

        let reopened = GroupFile::open(&path, 1).unwrap();
        assert_eq!(reopened.current().version, 1);
        assert!(reopened.current().members.contains_key(&2));
    }

    #[test]
    fn propose_then_apply_delivers_callback() {
        let dir = TempDir::with_prefix("raftcore-group").unwrap();
        let mut file = GroupFile::open(dir.path().join("g"), 1).unwrap();

        let mutation =
            Mutation::Join { member_id: 2, address: "127.0.0.1:6000".parse().unwrap(), role: Role::Normal };
        let (message, rx) = file.propose(mutation);

        let (expected_version, decoded) = GroupFile::decode_proposal(&message).unwrap();
        assert_eq!(expected_version, 0);
        assert_eq!(
            decoded,
            Mutation::Join { member_id: 2, address: "127.0.0.1:6000".parse().unwrap(), role: Role::Normal }
        );

        file.apply(expected_version, decoded).unwrap();

        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered.version, 1);
        assert!(delivered.members.contains_key(&2));
    }

    #[test]
    fn apply_without_matching_proposal_does_not_panic() {
        let dir = TempDir::with_prefix("raftcore-group").unwrap();
        let mut file = GroupFile::open(dir.path().join("g"), 1).unwrap();
        let v = file
            .apply(0, Mutation::Join { member_id: 3, address: "127.0.0.1:6001".parse().unwrap(), role: Role::Normal })
            .unwrap();
        assert_eq!(v, 1);
    }

    #[test]
    fn recovers_from_dangling_new_file() {
        let dir = TempDir::with_prefix("raftcore-group").unwrap();
        let path = dir.path().join("g");
        let mut file = GroupFile::open(&path, 1).unwrap();
        file.apply(0, Mutation::Join { member_id: 2, address: "127.0.0.1:6000".parse().unwrap(), role: Role::Normal })
            .unwrap();

        // Simulate a crash after the .new rename-into-place step was missed:
        // copy the current file back to `.new` and delete the primary.
        let new_path = GroupFile::new_path(&path);
        fs::copy(&path, &new_path).unwrap();
        fs::remove_file(&path).unwrap();

        let reopened = GroupFile::open(&path, 1).unwrap();
        assert_eq!(reopened.current().version, 1);
    }
}
