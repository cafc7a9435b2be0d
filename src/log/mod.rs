//! The state log (§4.A-C): a durable, position-addressed byte log split into
//! per-term segment files plus a double-buffered metadata file recording the
//! current term, vote, and durability watermarks.

pub mod metadata;
pub mod segment;
pub mod state_log;
pub mod term_log;

pub use state_log::{Gap, StateLog};
pub use term_log::HighestInfo;

/// An absolute byte offset into the replicated log, shared across all terms.
pub type Position = u64;

/// A Raft term/epoch number. Terms are monotonically increasing and never
/// reused.
pub type Term = u64;
