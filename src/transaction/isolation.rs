//! Isolation levels.

use std::str::FromStr;
use thiserror::Error;

/// The four standard SQL isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Reads may observe other transactions' uncommitted writes.
    ReadUncommitted,
    /// Each read sees data committed at the moment of the read.
    ReadCommitted,
    /// Point reads see a snapshot frozen at begin; scans may admit phantoms.
    RepeatableRead,
    /// Snapshot reads plus commit-time validation of writes, reads and predicates.
    Serializable,
}

impl IsolationLevel {
    pub const ALL: [IsolationLevel; 4] = [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ];

    /// Whether reads are bounded by a snapshot frozen at begin.
    pub fn uses_snapshot(&self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }

    /// Whether reads and scan predicates are recorded for commit validation.
    pub fn tracks_reads(&self) -> bool {
        matches!(self, IsolationLevel::Serializable)
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown isolation level: {0:?}")]
pub struct ParseIsolationLevelError(String);

impl FromStr for IsolationLevel {
    type Err = ParseIsolationLevelError;

    /// Accepts `READ COMMITTED`, `read-committed`, `read_committed` and friends.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                '-' | '_' | ' ' => ' ',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        match normalized.as_str() {
            "READ UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(ParseIsolationLevelError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        for level in IsolationLevel::ALL {
            assert_eq!(level.to_string().parse::<IsolationLevel>(), Ok(level));
        }
        assert_eq!(
            "read-committed".parse::<IsolationLevel>(),
            Ok(IsolationLevel::ReadCommitted)
        );
        assert_eq!(
            "repeatable_read".parse::<IsolationLevel>(),
            Ok(IsolationLevel::RepeatableRead)
        );
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_level_properties() {
        assert!(!IsolationLevel::ReadUncommitted.uses_snapshot());
        assert!(!IsolationLevel::ReadCommitted.uses_snapshot());
        assert!(IsolationLevel::RepeatableRead.uses_snapshot());
        assert!(IsolationLevel::Serializable.uses_snapshot());

        assert!(!IsolationLevel::RepeatableRead.tracks_reads());
        assert!(IsolationLevel::Serializable.tracks_reads());
    }
}
