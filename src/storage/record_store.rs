//! In-memory multi-version record store.
//!
//! Rows are kept in a concurrent map from key to a [`RowChain`], a plain
//! vector of versions ordered oldest first. The store holds no policy of its
//! own: version selection is delegated to
//! [`visibility::resolve`](crate::concurrency::visibility::resolve), and
//! writes require the caller to hold the row's write lock.

use crate::concurrency::lock::LockManager;
use crate::concurrency::predicate::Predicate;
use crate::concurrency::timestamp::Timestamp;
use crate::concurrency::visibility::{resolve, ReadView};
use crate::error::{EngineError, Result};
use crate::storage::record::{Key, Payload, Value, Version, VersionState};
use crate::transaction::TransactionId;
use dashmap::DashMap;
use std::collections::HashMap;

/// Version history of a single row.
///
/// Committed versions appear in commit order. At most one uncommitted
/// version exists, always last, because writers hold the row lock until
/// they finish.
#[derive(Debug, Default, Clone)]
pub struct RowChain {
    versions: Vec<Version>,
}

impl RowChain {
    fn write(&mut self, tid: TransactionId, payload: Payload) {
        match self
            .versions
            .last_mut()
            .filter(|v| v.is_pending_write_of(tid))
        {
            Some(pending) => pending.payload = payload,
            None => self.versions.push(Version::uncommitted(tid, payload)),
        }
    }

    fn pending_of(&mut self, tid: TransactionId) -> Option<&mut Version> {
        self.versions
            .last_mut()
            .filter(|v| v.is_pending_write_of(tid))
    }

    /// Drops discarded versions and everything shadowed at `horizon`.
    fn retire(&mut self, horizon: Timestamp) -> usize {
        let before = self.versions.len();
        self.versions.retain(|v| v.state != VersionState::Discarded);
        if let Some(newest_visible) = self
            .versions
            .iter()
            .rposition(|v| v.committed_at_or_before(horizon))
        {
            self.versions.drain(..newest_visible);
        }
        before - self.versions.len()
    }

    /// Whether no reader at or after `horizon` can see anything here.
    fn is_dead(&self, horizon: Timestamp) -> bool {
        match self.versions.as_slice() {
            [] => true,
            [only] => only.payload.is_tombstone() && only.committed_at_or_before(horizon),
            _ => false,
        }
    }
}

/// Outcome of a garbage collection pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub versions_retired: usize,
    pub rows_removed: usize,
    pub commit_records_pruned: usize,
    pub outcomes_forgotten: usize,
}

/// A row produced by [`RecordStore::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedRow {
    pub key: Key,
    pub version: Version,
    /// Absent at the reader's cutoff, admitted from the latest committed state.
    pub phantom: bool,
}

#[derive(Debug, Default)]
pub struct RecordStore {
    rows: DashMap<Key, RowChain>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The version of `key` visible through `view`, tombstones included.
    pub fn get(&self, key: &str, view: &ReadView) -> Option<Version> {
        self.rows
            .get(key)
            .and_then(|chain| resolve(&chain.versions, view).cloned())
    }

    /// Writes `value` as `tid`'s pending version of `key`.
    pub(crate) fn put(
        &self,
        key: &str,
        value: Value,
        tid: TransactionId,
        locks: &LockManager,
    ) -> Result<()> {
        self.install(key, Payload::Value(value), tid, locks)
    }

    /// Writes a tombstone as `tid`'s pending version of `key`.
    pub(crate) fn delete(&self, key: &str, tid: TransactionId, locks: &LockManager) -> Result<()> {
        self.install(key, Payload::Tombstone, tid, locks)
    }

    fn install(
        &self,
        key: &str,
        payload: Payload,
        tid: TransactionId,
        locks: &LockManager,
    ) -> Result<()> {
        if !locks.holds(tid, key) {
            return Err(EngineError::LockConflict {
                key: key.to_string(),
                holder: locks.holder(key),
            });
        }
        self.rows
            .entry(key.to_string())
            .or_default()
            .write(tid, payload);
        Ok(())
    }

    /// Every key with a chain, sorted.
    pub fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.rows.iter().map(|row| row.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Lazily yields the live rows matching `predicate` through `view`.
    ///
    /// The key set is fixed when the scan starts; each row is resolved as the
    /// iterator reaches it.
    pub fn scan(&self, predicate: Predicate, view: ReadView) -> StoreScan<'_> {
        StoreScan {
            store: self,
            keys: self.keys().into_iter(),
            predicate,
            view,
            phantom_view: None,
            pins: HashMap::new(),
        }
    }

    /// Promotes `tid`'s pending versions of `keys` to committed at `ts`.
    pub(crate) fn commit_versions<'k>(
        &self,
        tid: TransactionId,
        keys: impl IntoIterator<Item = &'k Key>,
        ts: Timestamp,
    ) -> usize {
        let mut promoted = 0;
        for key in keys {
            if let Some(mut chain) = self.rows.get_mut(key.as_str()) {
                if let Some(pending) = chain.pending_of(tid) {
                    pending.commit(ts);
                    promoted += 1;
                }
            }
        }
        promoted
    }

    /// Marks `tid`'s pending versions of `keys` as discarded.
    pub(crate) fn discard_versions<'k>(
        &self,
        tid: TransactionId,
        keys: impl IntoIterator<Item = &'k Key>,
    ) -> usize {
        let mut discarded = 0;
        for key in keys {
            if let Some(mut chain) = self.rows.get_mut(key.as_str()) {
                if let Some(pending) = chain.pending_of(tid) {
                    pending.discard();
                    discarded += 1;
                }
            }
        }
        discarded
    }

    /// Retires versions no reader at or after `horizon` can observe.
    ///
    /// `horizon` must not exceed the start timestamp of any live transaction.
    pub fn garbage_collect(&self, horizon: Timestamp) -> GcStats {
        let mut stats = GcStats::default();
        self.rows.retain(|_, chain| {
            stats.versions_retired += chain.retire(horizon);
            if chain.is_dead(horizon) {
                stats.versions_retired += chain.versions.len();
                stats.rows_removed += 1;
                false
            } else {
                true
            }
        });
        stats
    }

    pub fn chain_count(&self) -> usize {
        self.rows.len()
    }

    pub fn total_version_count(&self) -> usize {
        self.rows.iter().map(|row| row.versions.len()).sum()
    }

    /// Copy of the whole chain of `key`, oldest first.
    pub fn versions(&self, key: &str) -> Vec<Version> {
        self.rows
            .get(key)
            .map(|chain| chain.versions.clone())
            .unwrap_or_default()
    }
}

/// Iterator returned by [`RecordStore::scan`].
pub struct StoreScan<'s> {
    store: &'s RecordStore,
    keys: std::vec::IntoIter<Key>,
    predicate: Predicate,
    view: ReadView,
    phantom_view: Option<ReadView>,
    pins: HashMap<Key, Timestamp>,
}

impl StoreScan<'_> {
    /// Admits rows that are absent through the scan's view but live through
    /// `latest`.
    pub fn with_phantoms(mut self, latest: ReadView) -> Self {
        self.phantom_view = Some(latest);
        self
    }

    /// Per-row cutoffs that override the scan view for the given keys.
    pub fn with_pins(mut self, pins: HashMap<Key, Timestamp>) -> Self {
        self.pins = pins;
        self
    }

    fn live(version: Option<Version>) -> Option<Version> {
        version.filter(|v| !v.payload.is_tombstone())
    }
}

impl Iterator for StoreScan<'_> {
    type Item = ScannedRow;

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.keys.by_ref() {
            let view = match self.pins.get(&key) {
                Some(ts) => self.view.with_cutoff(*ts),
                None => self.view,
            };

            let (version, phantom) = match Self::live(self.store.get(&key, &view)) {
                Some(version) => (version, false),
                None => match self.phantom_view {
                    Some(latest) => match Self::live(self.store.get(&key, &latest)) {
                        Some(version) => (version, true),
                        None => continue,
                    },
                    None => continue,
                },
            };

            let matches = version
                .value()
                .is_some_and(|value| self.predicate.matches(&key, value));
            if matches {
                return Some(ScannedRow {
                    key,
                    version,
                    phantom,
                });
            }
        }
        None
    }
}
