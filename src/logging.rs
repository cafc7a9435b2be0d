//! Optional `simplelog` wiring for binaries and tests. The library itself
//! only ever calls through the `log` facade (see module docs on individual
//! types); nothing under `src/` outside this module names `simplelog`
//! directly.

use simplelog::{ColorChoice, CombinedLogger, Config, LevelFilter, TermLogger, TerminalMode};

/// Installs a terminal logger at the given level. Intended for binaries and
/// integration tests that want to see Raft role transitions and channel
/// events; library code never calls this itself.
pub fn init(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    CombinedLogger::init(vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )])
}
