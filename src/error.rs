//! Crate-wide error type. Every fallible operation in `raftcore` returns
//! [`Result`]; there is deliberately only one error enum so that callers never
//! need to match on more than one type to handle a failure from any layer
//! (storage, wire protocol, or consensus).

use std::fmt::Display;

use crate::raft::peer::MemberId;

/// A crate-wide result alias, following the same one-`Result` convention as
/// `raft::log::Log` in the engine this crate is descended from.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// A transport or disk I/O failure. Recoverable: close the socket/reopen
    /// the segment and retry.
    Io(std::io::Error),
    /// A metadata section or connect-header CRC-32C did not match. Fatal for
    /// the file or connection it was read from.
    ChecksumMismatch(String),
    /// A connecting peer's group token or group id didn't match ours.
    JoinRejected(String),
    /// The local log would have to retreat below a position already known to
    /// be durable. `below_durable` distinguishes the fatal case (no restart
    /// fixes it) from the non-fatal one (a restart may recover).
    CommitConflict { position: u64, below_durable: bool },
    /// `wait_for_commit` (or `sync_commit`) exceeded its deadline.
    ConfirmationTimeout,
    /// The waiting thread was interrupted before a deadline or completion.
    ConfirmationInterrupted,
    /// This member is a follower or candidate; cannot take the requested
    /// leader-only action.
    NotLeader { leader_hint: Option<MemberId> },
    /// This member is the interim leader elected by an all-standby quorum and
    /// refuses new client writes until a normal member can take over.
    InterimLeader,
    /// A quorum that `providesConsensus` is not currently reachable.
    NoConsensus,
    /// No leader is currently known.
    NoLeader,
    /// A group-file mutation was proposed against a version that is no longer
    /// current; the proposer should refresh and retry.
    VersionMismatch { expected: u64, actual: u64 },
    /// An address string failed to parse.
    InvalidAddress(String),
    /// A configuration value was missing or invalid.
    Config(String),
    /// A wire message or on-disk record failed to decode (bad length,
    /// truncated buffer, or unrecognized opcode/version).
    Encoding(String),
    /// Generic invariant violation / protocol error with a message, used
    /// sparingly for conditions the spec calls out as "reject" but that don't
    /// warrant a dedicated variant.
    Protocol(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::ChecksumMismatch(what) => write!(f, "checksum mismatch: {what}"),
            Error::JoinRejected(why) => write!(f, "join rejected: {why}"),
            Error::CommitConflict { position, below_durable } => write!(
                f,
                "commit conflict at position {position} ({})",
                if *below_durable { "below durable position, fatal" } else { "restart may recover" }
            ),
            Error::ConfirmationTimeout => write!(f, "confirmation timed out"),
            Error::ConfirmationInterrupted => write!(f, "confirmation wait interrupted"),
            Error::NotLeader { leader_hint } => match leader_hint {
                Some(id) => write!(f, "not leader (hint: member {id})"),
                None => write!(f, "not leader"),
            },
            Error::InterimLeader => write!(f, "interim leader does not accept writes"),
            Error::NoConsensus => write!(f, "no consensus quorum reachable"),
            Error::NoLeader => write!(f, "no leader known"),
            Error::VersionMismatch { expected, actual } => {
                write!(f, "group version mismatch: expected {expected}, got {actual}")
            }
            Error::InvalidAddress(s) => write!(f, "invalid address: {s}"),
            Error::Config(s) => write!(f, "invalid configuration: {s}"),
            Error::Encoding(s) => write!(f, "encoding error: {s}"),
            Error::Protocol(s) => write!(f, "protocol error: {s}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
