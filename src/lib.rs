//! `raftcore`: a durable, strongly-consistent, ordered byte log replicated
//! with Raft. The log is addressed by absolute byte position rather than
//! entry index; applications frame their own message boundaries on top of
//! the committed stream (see [`framer`]).
//!
//! Layout mirrors the component breakdown of the design this crate
//! implements: [`log`] is the on-disk state log (segments, term logs,
//! metadata), [`raft`] is the consensus layer (controller, wire protocol,
//! channel manager, group file), and [`framer`] is the application-facing
//! message boundary adapter.

pub mod config;
pub mod encoding;
pub mod error;
pub mod framer;
pub mod log;
pub mod logging;
pub mod raft;

pub use config::Config;
pub use error::{Error, Result};
