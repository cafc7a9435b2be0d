//! Process-wide configuration surface (§6 of the spec). Built with a small
//! validating builder so that a malformed option (a bad address, a missing
//! base file) surfaces as [`Error::Config`]/[`Error::InvalidAddress`] at
//! construction time rather than later, deep inside the channel manager or
//! the state log.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::raft::peer::MemberId;

/// Parses an address of the form `host/a.b.c.d:port` or `a.b.c.d:port`
/// (IPv6 accepted in bracketed form), per §6. The optional `host/` prefix is
/// an advertised hostname hint and is discarded; only the socket address
/// after the slash (or the whole string, if there is no slash) is parsed.
pub fn parse_address(s: &str) -> Result<SocketAddr> {
    let addr_part = match s.rsplit_once('/') {
        Some((_host, rest)) => rest,
        None => s,
    };
    addr_part.parse::<SocketAddr>().map_err(|_| Error::InvalidAddress(s.to_string()))
}

/// Fully validated, immutable configuration for one member process.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_file: PathBuf,
    pub create_file_path: bool,
    pub group_token: u64,
    pub group_token2: Option<u64>,
    pub local_address: SocketAddr,
    pub listen_address: SocketAddr,
    pub members: BTreeMap<MemberId, SocketAddr>,
    pub seeds: Vec<SocketAddr>,
}

impl Config {
    pub fn builder(base_file: impl Into<PathBuf>, local_address: &str) -> Result<ConfigBuilder> {
        let local_address = parse_address(local_address)?;
        Ok(ConfigBuilder {
            base_file: base_file.into(),
            create_file_path: false,
            group_token: 0,
            group_token2: None,
            local_address,
            listen_address: None,
            members: BTreeMap::new(),
            seeds: Vec::new(),
        })
    }

    /// Ensures the parent directory of the base file exists, creating it if
    /// `create_file_path` was requested. Mirrors the `mkdirs` option.
    pub fn ensure_file_path(&self) -> Result<()> {
        if let Some(parent) = self.base_file.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                if self.create_file_path {
                    std::fs::create_dir_all(parent)?;
                } else {
                    return Err(Error::Config(format!(
                        "parent directory {} does not exist (set createFilePath)",
                        parent.display()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn metadata_path(&self) -> PathBuf {
        let mut p = self.base_file.clone();
        append_suffix(&mut p, ".md");
        p
    }

    pub fn group_path(&self) -> PathBuf {
        let mut p = self.base_file.clone();
        append_suffix(&mut p, ".group");
        p
    }

    /// Returns the segment file path for the given (prev_term, term, start).
    /// `prev_term` is omitted from the name when it equals `term`.
    pub fn segment_path(&self, prev_term: u64, term: u64, start: u64) -> PathBuf {
        segment_file_name(&self.base_file, prev_term, term, start)
    }
}

fn append_suffix(path: &mut PathBuf, suffix: &str) {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.set_file_name(name);
}

/// Builds a §6-compliant segment file name `<base>[.<prevTerm>].<term>.<startPos>`
/// next to `base`, omitting `prevTerm` when it equals `term`. Shared between
/// [`Config::segment_path`] and the term log's own segment naming so both
/// follow the same on-disk convention.
pub fn segment_file_name(base: &Path, prev_term: u64, term: u64, start: u64) -> PathBuf {
    let mut p = base.to_path_buf();
    if prev_term == term {
        append_suffix(&mut p, &format!(".{term}.{start}"));
    } else {
        append_suffix(&mut p, &format!(".{prev_term}.{term}.{start}"));
    }
    p
}

/// Parses a file name produced by [`segment_file_name`] back into
/// `(prev_term, term, start)`, given the base name it was built from (e.g.
/// `"segment"`). Returns `None` for anything that doesn't match.
pub fn parse_segment_file_name(file_name: &str, base_name: &str) -> Option<(u64, u64, u64)> {
    let rest = file_name.strip_prefix(base_name)?.strip_prefix('.')?;
    let parts: Vec<&str> = rest.split('.').collect();
    match parts.as_slice() {
        [term, start] => {
            let term: u64 = term.parse().ok()?;
            let start: u64 = start.parse().ok()?;
            Some((term, term, start))
        }
        [prev_term, term, start] => {
            let prev_term: u64 = prev_term.parse().ok()?;
            let term: u64 = term.parse().ok()?;
            let start: u64 = start.parse().ok()?;
            Some((prev_term, term, start))
        }
        _ => None,
    }
}

pub struct ConfigBuilder {
    base_file: PathBuf,
    create_file_path: bool,
    group_token: u64,
    group_token2: Option<u64>,
    local_address: SocketAddr,
    listen_address: Option<SocketAddr>,
    members: BTreeMap<MemberId, SocketAddr>,
    seeds: Vec<SocketAddr>,
}

impl ConfigBuilder {
    pub fn create_file_path(mut self, create: bool) -> Self {
        self.create_file_path = create;
        self
    }

    pub fn group_token(mut self, token: u64) -> Self {
        self.group_token = token;
        self
    }

    pub fn group_token2(mut self, token: u64) -> Self {
        self.group_token2 = Some(token);
        self
    }

    pub fn listen_address(mut self, addr: &str) -> Result<Self> {
        self.listen_address = Some(parse_address(addr)?);
        Ok(self)
    }

    pub fn add_member(mut self, id: MemberId, addr: &str) -> Result<Self> {
        if id == 0 {
            return Err(Error::Config("member id must be non-zero".into()));
        }
        self.members.insert(id, parse_address(addr)?);
        Ok(self)
    }

    pub fn add_seed(mut self, addr: &str) -> Result<Self> {
        self.seeds.push(parse_address(addr)?);
        Ok(self)
    }

    pub fn build(self) -> Result<Config> {
        Ok(Config {
            base_file: self.base_file,
            create_file_path: self.create_file_path,
            group_token: self.group_token,
            group_token2: self.group_token2,
            local_address: self.local_address,
            listen_address: self.listen_address.unwrap_or(self.local_address),
            members: self.members,
            seeds: self.seeds,
        })
    }
}

/// Returns true if `path`'s parent directory exists (helper used by callers
/// that want to check before `Config::ensure_file_path` without a config).
pub fn parent_exists(path: &Path) -> bool {
    path.parent().map(|p| p.as_os_str().is_empty() || p.exists()).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_hinted_addresses() {
        assert_eq!(parse_address("127.0.0.1:9000").unwrap().port(), 9000);
        assert_eq!(parse_address("node1/127.0.0.1:9000").unwrap().port(), 9000);
        assert!(parse_address("not-an-address").is_err());
    }

    #[test]
    fn builds_segment_and_metadata_paths() {
        let cfg = Config::builder("/tmp/x/base", "127.0.0.1:9000").unwrap().build().unwrap();
        assert_eq!(cfg.metadata_path(), PathBuf::from("/tmp/x/base.md"));
        assert_eq!(cfg.group_path(), PathBuf::from("/tmp/x/base.group"));
        assert_eq!(cfg.segment_path(5, 5, 100), PathBuf::from("/tmp/x/base.5.100"));
        assert_eq!(cfg.segment_path(4, 5, 100), PathBuf::from("/tmp/x/base.4.5.100"));
    }

    #[test]
    fn segment_file_name_round_trips_through_parse() {
        assert_eq!(parse_segment_file_name("segment.5.100", "segment"), Some((5, 5, 100)));
        assert_eq!(parse_segment_file_name("segment.4.5.100", "segment"), Some((4, 5, 100)));
        assert_eq!(parse_segment_file_name("other.5.100", "segment"), None);
    }
}
