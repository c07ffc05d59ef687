//! Transaction state management.

use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use super::id::TransactionId;
use super::isolation::IsolationLevel;
use crate::concurrency::predicate::Predicate;
use crate::concurrency::timestamp::Timestamp;
use crate::error::{EngineError, Result};
use crate::storage::record::Key;

/// The possible states of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// The transaction is running and accepts operations.
    Active,
    /// Claimed by commit or rollback; no further operations are accepted.
    Preparing,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns true if the transaction is finished (committed or aborted).
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Preparing => write!(f, "Preparing"),
            Self::Committed => write!(f, "Committed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// How a transaction changed a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl WriteKind {
    /// Folds a later write to the same row into an earlier one.
    ///
    /// The result describes the row's change across the whole transaction:
    /// whether it existed before comes from the first write.
    pub fn then(self, later: WriteKind) -> WriteKind {
        match (self, later) {
            (WriteKind::Insert, WriteKind::Update) => WriteKind::Insert,
            (WriteKind::Delete, WriteKind::Insert) => WriteKind::Update,
            (_, later) => later,
        }
    }
}

/// What a SERIALIZABLE transaction read, for commit validation.
#[derive(Debug, Default, Clone)]
pub struct ReadSet {
    /// Rows read by point lookups.
    pub rows: HashSet<Key>,
    /// Scan predicates with the snapshot they were evaluated against.
    pub predicates: Vec<(Predicate, Timestamp)>,
}

/// Information about a transaction.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub isolation: IsolationLevel,
    pub state: TransactionState,
    /// The published commit counter at begin.
    pub start_ts: Timestamp,
    /// Frozen read cutoff; set only for snapshot isolation levels.
    pub snapshot: Option<Timestamp>,
    pub commit_ts: Option<Timestamp>,
    pub read_set: ReadSet,
    /// Rows written, in key order.
    pub write_set: BTreeMap<Key, WriteKind>,
    /// REPEATABLE READ rows first seen through a scan after the snapshot,
    /// with the commit timestamp they were observed at.
    pub pinned: HashMap<Key, Timestamp>,
}

impl TransactionInfo {
    pub fn new(id: TransactionId, isolation: IsolationLevel, start_ts: Timestamp) -> Self {
        Self {
            id,
            isolation,
            state: TransactionState::Active,
            start_ts,
            snapshot: isolation.uses_snapshot().then_some(start_ts),
            commit_ts: None,
            read_set: ReadSet::default(),
            write_set: BTreeMap::new(),
            pinned: HashMap::new(),
        }
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(EngineError::TransactionFinalized(self.id))
        }
    }

    /// Claims the transaction for commit or rollback.
    ///
    /// Only one caller can win the claim; everyone after it gets
    /// `TransactionFinalized`.
    pub fn prepare(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.state = TransactionState::Preparing;
        Ok(())
    }

    pub fn record_write(&mut self, key: Key, kind: WriteKind) {
        self.write_set
            .entry(key)
            .and_modify(|existing| *existing = existing.then(kind))
            .or_insert(kind);
    }

    /// The read cutoff for `key`, honoring REPEATABLE READ pins.
    pub fn cutoff_for(&self, key: &str) -> Option<Timestamp> {
        self.pinned.get(key).copied().or(self.snapshot)
    }

    pub(crate) fn finish(&mut self, outcome: TransactionState, commit_ts: Option<Timestamp>) {
        debug_assert!(outcome.is_finished());
        self.state = outcome;
        self.commit_ts = commit_ts;
    }
}

/// A thread-safe wrapper for transaction information.
#[derive(Debug, Clone)]
pub struct SharedTransactionInfo {
    inner: Arc<Mutex<TransactionInfo>>,
}

impl SharedTransactionInfo {
    pub fn new(info: TransactionInfo) -> Self {
        Self {
            inner: Arc::new(Mutex::new(info)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, TransactionInfo> {
        self.inner.lock()
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Gets a copy of the transaction info.
    pub fn info(&self) -> TransactionInfo {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn info(level: IsolationLevel) -> TransactionInfo {
        TransactionInfo::new(TransactionId::new(1), level, Timestamp::new(4))
    }

    #[test]
    fn test_transaction_state() {
        assert!(TransactionState::Active.is_active());
        assert!(!TransactionState::Active.is_finished());
        assert!(!TransactionState::Preparing.is_active());
        assert!(!TransactionState::Preparing.is_finished());
        assert!(TransactionState::Committed.is_finished());
        assert!(TransactionState::Aborted.is_finished());
        assert_eq!(format!("{}", TransactionState::Preparing), "Preparing");
    }

    #[test]
    fn test_snapshot_only_for_snapshot_levels() {
        assert_eq!(info(IsolationLevel::ReadUncommitted).snapshot, None);
        assert_eq!(info(IsolationLevel::ReadCommitted).snapshot, None);
        assert_eq!(
            info(IsolationLevel::RepeatableRead).snapshot,
            Some(Timestamp::new(4))
        );
        assert_eq!(
            info(IsolationLevel::Serializable).snapshot,
            Some(Timestamp::new(4))
        );
    }

    #[test]
    fn test_prepare_is_single_shot() {
        let mut info = info(IsolationLevel::ReadCommitted);

        info.prepare().unwrap();
        assert_eq!(
            info.prepare(),
            Err(EngineError::TransactionFinalized(TransactionId::new(1)))
        );
        assert!(info.ensure_active().is_err());

        info.finish(TransactionState::Committed, Some(Timestamp::new(5)));
        assert_eq!(info.state, TransactionState::Committed);
        assert_eq!(info.commit_ts, Some(Timestamp::new(5)));
    }

    #[test]
    fn test_write_kinds_fold() {
        let mut info = info(IsolationLevel::Serializable);

        info.record_write("a".into(), WriteKind::Insert);
        info.record_write("a".into(), WriteKind::Update);
        info.record_write("b".into(), WriteKind::Update);
        info.record_write("b".into(), WriteKind::Delete);
        info.record_write("c".into(), WriteKind::Delete);
        info.record_write("c".into(), WriteKind::Insert);

        assert_eq!(info.write_set.get("a"), Some(&WriteKind::Insert));
        assert_eq!(info.write_set.get("b"), Some(&WriteKind::Delete));
        // Deleted and recreated: the row existed before and after.
        assert_eq!(info.write_set.get("c"), Some(&WriteKind::Update));
    }

    #[test]
    fn test_pins_override_snapshot() {
        let mut info = info(IsolationLevel::RepeatableRead);
        info.pinned.insert("new".into(), Timestamp::new(9));

        assert_eq!(info.cutoff_for("new"), Some(Timestamp::new(9)));
        assert_eq!(info.cutoff_for("old"), Some(Timestamp::new(4)));
    }

    #[test]
    fn test_shared_info_claim_race() {
        let shared = SharedTransactionInfo::new(info(IsolationLevel::ReadCommitted));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || shared.lock().prepare().is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(shared.state(), TransactionState::Preparing);
    }
}
