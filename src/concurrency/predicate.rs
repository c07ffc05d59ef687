//! Scan predicates.

use crate::storage::record::Key;
use std::fmt;
use std::sync::Arc;

type MatchFn = dyn Fn(&str, &[u8]) -> bool + Send + Sync;

/// Selects the rows a scan returns.
///
/// SERIALIZABLE transactions keep every predicate they scan with and test
/// it against rows changed by concurrent commits.
#[derive(Clone)]
pub enum Predicate {
    All,
    Key(Key),
    Prefix(String),
    /// Keys in `start..end`.
    Range { start: Key, end: Key },
    /// Arbitrary test over key and value bytes.
    Custom(Arc<MatchFn>),
}

impl Predicate {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str, &[u8]) -> bool + Send + Sync + 'static,
    {
        Predicate::Custom(Arc::new(f))
    }

    pub fn range(start: impl Into<Key>, end: impl Into<Key>) -> Self {
        Predicate::Range {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Predicate::Prefix(prefix.into())
    }

    pub fn matches(&self, key: &str, value: &[u8]) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Key(k) => k == key,
            Predicate::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Predicate::Range { start, end } => start.as_str() <= key && key < end.as_str(),
            Predicate::Custom(f) => f(key, value),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::All => write!(f, "All"),
            Predicate::Key(k) => write!(f, "Key({k:?})"),
            Predicate::Prefix(p) => write!(f, "Prefix({p:?})"),
            Predicate::Range { start, end } => write!(f, "Range({start:?}..{end:?})"),
            Predicate::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_predicates() {
        assert!(Predicate::All.matches("anything", b""));
        assert!(Predicate::Key("alice".into()).matches("alice", b""));
        assert!(!Predicate::Key("alice".into()).matches("bob", b""));

        let prefix = Predicate::prefix("accounts/");
        assert!(prefix.matches("accounts/alice", b""));
        assert!(!prefix.matches("orders/1", b""));

        let range = Predicate::range("b", "d");
        assert!(!range.matches("a", b""));
        assert!(range.matches("b", b""));
        assert!(range.matches("cz", b""));
        assert!(!range.matches("d", b""));
    }

    #[test]
    fn test_custom_predicate_sees_value() {
        let large = Predicate::custom(|_, value| value.len() > 3);
        assert!(large.matches("k", b"1234"));
        assert!(!large.matches("k", b"12"));
        assert_eq!(format!("{large:?}"), "Custom(..)");
    }
}
