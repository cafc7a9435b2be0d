//! Member roles (§3 "Roles"): governs voting, proxying, and leadership
//! eligibility for a group member.

/// A member's role in the group, persisted in the group file and replicated
/// via `UPDATE_ROLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    /// Votes, proxies, and can become leader.
    Normal,
    /// Votes and proxies; can only become an `INTERIM_LEADER`.
    Standby,
    /// Proxies writes only; does not vote or lead.
    Proxy,
    /// Receives only.
    Observer,
    /// An observer currently receiving a snapshot.
    Restoring,
}

impl Role {
    /// Numeric code matching the wire protocol's `UPDATE_ROLE` payload and the
    /// group file's `| ROLE` suffix.
    pub fn code(self) -> u8 {
        match self {
            Role::Normal => 0,
            Role::Standby => 1,
            Role::Proxy => 2,
            Role::Observer => 3,
            Role::Restoring => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Role::Normal),
            1 => Some(Role::Standby),
            2 => Some(Role::Proxy),
            3 => Some(Role::Observer),
            4 => Some(Role::Restoring),
            _ => None,
        }
    }

    /// Only `NORMAL` and `STANDBY` vote and count toward quorum.
    pub fn provides_consensus(self) -> bool {
        matches!(self, Role::Normal | Role::Standby)
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::Normal => "NORMAL",
            Role::Standby => "STANDBY",
            Role::Proxy => "PROXY",
            Role::Observer => "OBSERVER",
            Role::Restoring => "RESTORING",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "NORMAL" => Some(Role::Normal),
            "STANDBY" => Some(Role::Standby),
            "PROXY" => Some(Role::Proxy),
            "OBSERVER" => Some(Role::Observer),
            "RESTORING" => Some(Role::Restoring),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(Role::Normal, 0, true; "normal")]
    #[test_case(Role::Standby, 1, true; "standby")]
    #[test_case(Role::Proxy, 2, false; "proxy")]
    #[test_case(Role::Observer, 3, false; "observer")]
    #[test_case(Role::Restoring, 4, false; "restoring")]
    fn role_code_and_consensus(role: Role, code: u8, provides_consensus: bool) {
        assert_eq!(role.code(), code);
        assert_eq!(Role::from_code(code), Some(role));
        assert_eq!(role.provides_consensus(), provides_consensus);
    }

    #[test]
    fn name_round_trips() {
        for role in [Role::Normal, Role::Standby, Role::Proxy, Role::Observer, Role::Restoring] {
            assert_eq!(Role::parse(role.name()), Some(role));
        }
    }

    #[test]
    fn from_code_rejects_unknown() {
        assert_eq!(Role::from_code(200), None);
    }
}
