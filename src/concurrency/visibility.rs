//! Version selection per isolation level.
//!
//! A [`ReadView`] captures everything a read needs: who is reading (so a
//! transaction sees its own pending writes) and which committed versions are
//! in range. [`resolve`] applies a view to one row's version chain.

use crate::concurrency::timestamp::Timestamp;
use crate::storage::record::{Version, VersionState};
use crate::transaction::{IsolationLevel, TransactionId};

/// Which versions besides the reader's own pending write are candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityRule {
    /// The newest version that is not discarded, committed or not.
    Latest,
    /// The newest version committed at or before the timestamp.
    CommittedAsOf(Timestamp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadView {
    /// `None` for views that must ignore every pending write.
    pub reader: Option<TransactionId>,
    pub rule: VisibilityRule,
}

impl ReadView {
    /// The view a transaction reads through right now.
    ///
    /// `current` is the published commit counter, sampled once per read so
    /// READ COMMITTED observes a consistent cut.
    pub fn for_transaction(
        reader: TransactionId,
        isolation: IsolationLevel,
        snapshot: Option<Timestamp>,
        current: Timestamp,
    ) -> Self {
        let rule = match isolation {
            IsolationLevel::ReadUncommitted => VisibilityRule::Latest,
            IsolationLevel::ReadCommitted => VisibilityRule::CommittedAsOf(current),
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                VisibilityRule::CommittedAsOf(snapshot.unwrap_or(current))
            }
        };
        Self {
            reader: Some(reader),
            rule,
        }
    }

    /// Committed state as of `ts`, ignoring any pending writes.
    pub fn committed_as_of(ts: Timestamp) -> Self {
        Self {
            reader: None,
            rule: VisibilityRule::CommittedAsOf(ts),
        }
    }

    /// The same reader looking at committed state as of `ts`.
    pub fn with_cutoff(&self, ts: Timestamp) -> Self {
        Self {
            reader: self.reader,
            rule: VisibilityRule::CommittedAsOf(ts),
        }
    }
}

/// Selects the version of `chain` visible through `view`.
///
/// `chain` is ordered oldest first. Discarded versions are never returned. A
/// returned tombstone means the row is deleted as far as the reader can tell.
pub fn resolve<'a>(chain: &'a [Version], view: &ReadView) -> Option<&'a Version> {
    if let Some(reader) = view.reader {
        // At most one pending version per row exists, always at the tail.
        if let Some(own) = chain.last().filter(|v| v.is_pending_write_of(reader)) {
            return Some(own);
        }
    }

    match view.rule {
        VisibilityRule::Latest => chain
            .iter()
            .rev()
            .find(|v| v.state != VersionState::Discarded),
        VisibilityRule::CommittedAsOf(ts) => {
            chain.iter().rev().find(|v| v.committed_at_or_before(ts))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::Payload;
    use bytes::Bytes;

    fn committed(creator: u64, ts: u64, data: &'static [u8]) -> Version {
        let mut v = Version::uncommitted(
            TransactionId::new(creator),
            Payload::Value(Bytes::from_static(data)),
        );
        v.commit(Timestamp::new(ts));
        v
    }

    fn pending(creator: u64, data: &'static [u8]) -> Version {
        Version::uncommitted(
            TransactionId::new(creator),
            Payload::Value(Bytes::from_static(data)),
        )
    }

    fn view(level: IsolationLevel, reader: u64, snapshot: u64, current: u64) -> ReadView {
        ReadView::for_transaction(
            TransactionId::new(reader),
            level,
            Some(Timestamp::new(snapshot)),
            Timestamp::new(current),
        )
    }

    fn data(version: Option<&Version>) -> Option<&[u8]> {
        version.and_then(|v| v.value()).map(|b| b.as_ref())
    }

    #[test]
    fn test_read_uncommitted_sees_pending_write() {
        let chain = vec![committed(1, 1, b"1000"), pending(2, b"800")];

        let v = view(IsolationLevel::ReadUncommitted, 3, 1, 1);
        assert_eq!(data(resolve(&chain, &v)), Some(&b"800"[..]));
    }

    #[test]
    fn test_discarded_versions_are_skipped() {
        let mut rolled_back = pending(2, b"800");
        rolled_back.discard();
        let chain = vec![committed(1, 1, b"1000"), rolled_back];

        for level in IsolationLevel::ALL {
            let v = view(level, 3, 1, 1);
            assert_eq!(data(resolve(&chain, &v)), Some(&b"1000"[..]), "{level}");
        }
    }

    #[test]
    fn test_read_committed_uses_current_counter() {
        let chain = vec![committed(1, 1, b"1000"), committed(2, 4, b"800")];

        let before = view(IsolationLevel::ReadCommitted, 3, 1, 3);
        assert_eq!(data(resolve(&chain, &before)), Some(&b"1000"[..]));

        let after = view(IsolationLevel::ReadCommitted, 3, 1, 4);
        assert_eq!(data(resolve(&chain, &after)), Some(&b"800"[..]));
    }

    #[test]
    fn test_snapshot_levels_ignore_later_commits() {
        let chain = vec![committed(1, 1, b"1000"), committed(2, 4, b"800")];

        for level in [IsolationLevel::RepeatableRead, IsolationLevel::Serializable] {
            let v = view(level, 3, 2, 10);
            assert_eq!(data(resolve(&chain, &v)), Some(&b"1000"[..]));
        }
    }

    #[test]
    fn test_reader_sees_own_pending_write() {
        let chain = vec![committed(1, 1, b"1000"), pending(3, b"800")];

        for level in IsolationLevel::ALL {
            let v = view(level, 3, 1, 1);
            assert_eq!(data(resolve(&chain, &v)), Some(&b"800"[..]), "{level}");
        }

        // Ignored by anonymous views.
        let anonymous = ReadView::committed_as_of(Timestamp::new(1));
        assert_eq!(data(resolve(&chain, &anonymous)), Some(&b"1000"[..]));
    }

    #[test]
    fn test_row_created_after_snapshot_is_absent() {
        let chain = vec![committed(1, 5, b"new")];

        let v = view(IsolationLevel::RepeatableRead, 3, 4, 5);
        assert!(resolve(&chain, &v).is_none());
        assert!(resolve(&chain, &v.with_cutoff(Timestamp::new(5))).is_some());
    }

    #[test]
    fn test_tombstone_is_returned_as_is() {
        let mut delete = Version::uncommitted(TransactionId::new(2), Payload::Tombstone);
        delete.commit(Timestamp::new(2));
        let chain = vec![committed(1, 1, b"1000"), delete];

        let v = view(IsolationLevel::ReadCommitted, 3, 2, 2);
        let found = resolve(&chain, &v).unwrap();
        assert!(found.payload.is_tombstone());
    }
}
