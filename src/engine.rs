//! Transactional engine.
//!
//! [`Engine`] ties the record store, transaction registry, lock manager and
//! commit history together behind the operations callers use: begin, read,
//! write, insert, delete, scan, commit and rollback. Nothing outside this
//! module mutates a version chain.

mod commit;

use crate::concurrency::lock::LockManager;
use crate::concurrency::predicate::Predicate;
use crate::concurrency::timestamp::{Timestamp, TimestampOracle};
use crate::concurrency::validation::CommitHistory;
use crate::concurrency::visibility::ReadView;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::storage::record_store::{GcStats, RecordStore, StoreScan};
use crate::storage::{Key, Value};
use crate::transaction::{
    IsolationLevel, SharedTransactionInfo, TransactionId, TransactionInfo, TransactionManager,
    TransactionState, WriteKind,
};
use std::sync::atomic::AtomicU64;

/// Caller-side reference to a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHandle {
    id: TransactionId,
    isolation: IsolationLevel,
}

impl TransactionHandle {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub active_transactions: usize,
    pub version_chains: usize,
    pub total_versions: usize,
    pub commit_records: usize,
    /// Finished transactions whose outcome `Engine::state` still reports.
    pub finished_transactions: usize,
    pub current_timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteIntent {
    Upsert,
    Insert,
    Delete,
}

/// In-memory multi-version transactional record engine.
pub struct Engine {
    config: EngineConfig,
    oracle: TimestampOracle,
    transactions: TransactionManager,
    store: RecordStore,
    locks: LockManager,
    history: CommitHistory,
    commits_since_gc: AtomicU64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_oracle(config, TimestampOracle::new())
    }

    /// Creates an engine around an existing commit counter.
    pub fn with_oracle(config: EngineConfig, oracle: TimestampOracle) -> Self {
        Self {
            transactions: TransactionManager::new(oracle.clone()),
            locks: LockManager::new(config.deadlock_detection),
            store: RecordStore::new(),
            history: CommitHistory::new(),
            commits_since_gc: AtomicU64::new(0),
            oracle,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn begin(&self, isolation: IsolationLevel) -> TransactionHandle {
        let info = self.transactions.begin(isolation);
        let info = info.lock();
        log::debug!("begin {} {} at {}", info.id, isolation, info.start_ts);
        TransactionHandle {
            id: info.id,
            isolation,
        }
    }

    /// Begins a transaction that rolls back when dropped unfinished.
    pub fn transaction(&self, isolation: IsolationLevel) -> Transaction<'_> {
        Transaction {
            engine: self,
            handle: self.begin(isolation),
            finished: false,
        }
    }

    /// Reads the value of `key` visible to `tx`; `None` if absent or deleted.
    pub fn read(&self, tx: &TransactionHandle, key: &str) -> Result<Option<Value>> {
        let info = self.transactions.active(tx.id)?;
        let view = {
            let mut info = info.lock();
            info.ensure_active()?;
            if info.isolation.tracks_reads() {
                info.read_set.rows.insert(key.to_string());
            }
            self.view_for(&info, key)
        };
        Ok(self
            .store
            .get(key, &view)
            .and_then(|version| version.value().cloned()))
    }

    /// Sets `key` to `value`, creating the row if needed.
    pub fn write(
        &self,
        tx: &TransactionHandle,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> Result<()> {
        self.apply_write(tx, key.into(), Some(value.into()), WriteIntent::Upsert)
    }

    /// Creates `key`; fails with `DuplicateKey` if the row exists in its
    /// latest committed state or was written by `tx` itself.
    pub fn insert(
        &self,
        tx: &TransactionHandle,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> Result<()> {
        self.apply_write(tx, key.into(), Some(value.into()), WriteIntent::Insert)
    }

    /// Deletes `key`; fails with `NotFound` if the row is absent from its
    /// latest committed state, or deleted by `tx` itself.
    pub fn delete(&self, tx: &TransactionHandle, key: &str) -> Result<()> {
        self.apply_write(tx, key.to_string(), None, WriteIntent::Delete)
    }

    /// Lazily yields `(key, value)` for rows matching `predicate`, in key order.
    ///
    /// Each call re-evaluates from scratch. Under SERIALIZABLE the predicate
    /// is registered for commit validation; under REPEATABLE READ rows
    /// committed after the snapshot may appear as phantoms.
    pub fn scan(&self, tx: &TransactionHandle, predicate: Predicate) -> Result<Scan<'_>> {
        let info = self.transactions.active(tx.id)?;
        let mut guard = info.lock();
        guard.ensure_active()?;

        let current = self.oracle.current();
        let view = ReadView::for_transaction(guard.id, guard.isolation, guard.snapshot, current);
        let mut rows = self.store.scan(predicate.clone(), view);
        match guard.isolation {
            IsolationLevel::RepeatableRead => {
                rows = rows
                    .with_pins(guard.pinned.clone())
                    .with_phantoms(view.with_cutoff(current));
            }
            IsolationLevel::Serializable => {
                let as_of = guard.snapshot.unwrap_or(guard.start_ts);
                guard.read_set.predicates.push((predicate, as_of));
            }
            IsolationLevel::ReadUncommitted | IsolationLevel::ReadCommitted => {}
        }
        drop(guard);

        Ok(Scan { rows, info })
    }

    /// State of `tx`; `None` once garbage collection has forgotten its outcome.
    pub fn state(&self, tx: &TransactionHandle) -> Option<TransactionState> {
        self.transactions.state(tx.id)
    }

    pub fn current_timestamp(&self) -> Timestamp {
        self.oracle.current()
    }

    pub fn active_transactions(&self) -> Vec<TransactionId> {
        self.transactions.active_transactions()
    }

    /// Retires versions and commit records older than every live snapshot,
    /// and forgets the outcomes of finished transactions.
    ///
    /// Forgotten ids keep failing with `TransactionFinalized`.
    pub fn garbage_collect(&self) -> GcStats {
        let horizon = self.transactions.gc_horizon();
        let mut stats = self.store.garbage_collect(horizon);
        stats.commit_records_pruned = self.history.prune(horizon);
        stats.outcomes_forgotten = self.transactions.cleanup_finished();
        log::debug!(
            "gc at {}: {} versions retired, {} rows removed, {} commit records pruned, {} outcomes forgotten",
            horizon,
            stats.versions_retired,
            stats.rows_removed,
            stats.commit_records_pruned,
            stats.outcomes_forgotten
        );
        stats
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            active_transactions: self.transactions.active_count(),
            version_chains: self.store.chain_count(),
            total_versions: self.store.total_version_count(),
            commit_records: self.history.len(),
            finished_transactions: self.transactions.finished_count(),
            current_timestamp: self.oracle.current(),
        }
    }

    fn view_for(&self, info: &TransactionInfo, key: &str) -> ReadView {
        ReadView::for_transaction(
            info.id,
            info.isolation,
            info.cutoff_for(key),
            self.oracle.current(),
        )
    }

    fn apply_write(
        &self,
        tx: &TransactionHandle,
        key: Key,
        value: Option<Value>,
        intent: WriteIntent,
    ) -> Result<()> {
        let info = self.transactions.active(tx.id)?;
        info.lock().ensure_active()?;

        // May block; no transaction state is held while waiting.
        self.locks
            .acquire(tx.id, &key, Some(self.config.lock_wait_timeout()))?;

        let mut info = info.lock();
        if let Err(err) = info.ensure_active() {
            // Finished by someone else while we waited.
            self.locks.release(tx.id, &key);
            return Err(err);
        }

        // With the lock held no one else has a pending version here, so the
        // latest committed state is exactly what this write replaces.
        let view = self
            .view_for(&info, &key)
            .with_cutoff(self.oracle.current());
        let exists = self
            .store
            .get(&key, &view)
            .is_some_and(|version| !version.payload.is_tombstone());
        let kind = match (intent, exists) {
            (WriteIntent::Insert, true) => return Err(EngineError::DuplicateKey(key)),
            (WriteIntent::Delete, false) => return Err(EngineError::NotFound(key)),
            (WriteIntent::Delete, true) => WriteKind::Delete,
            (_, true) => WriteKind::Update,
            (_, false) => WriteKind::Insert,
        };

        match value {
            Some(value) => self.store.put(&key, value, tx.id, &self.locks)?,
            None => self.store.delete(&key, tx.id, &self.locks)?,
        }
        info.record_write(key, kind);
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Iterator returned by [`Engine::scan`].
///
/// Ends early once its transaction commits or rolls back.
pub struct Scan<'e> {
    rows: StoreScan<'e>,
    info: SharedTransactionInfo,
}

impl Iterator for Scan<'_> {
    type Item = (Key, Value);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let row = self.rows.next()?;
            let mut info = self.info.lock();
            if !info.state.is_active() {
                return None;
            }
            if row.phantom {
                if let Some(ts) = row.version.commit_ts {
                    // Later reads of this row must agree with the scan.
                    info.pinned.entry(row.key.clone()).or_insert(ts);
                }
            }
            drop(info);
            if let Some(value) = row.version.value().cloned() {
                return Some((row.key, value));
            }
        }
    }
}

/// A transaction bound to its engine.
///
/// Rolls back on drop unless committed or rolled back explicitly.
pub struct Transaction<'e> {
    engine: &'e Engine,
    handle: TransactionHandle,
    finished: bool,
}

impl<'e> Transaction<'e> {
    pub fn handle(&self) -> TransactionHandle {
        self.handle
    }

    pub fn id(&self) -> TransactionId {
        self.handle.id
    }

    pub fn read(&self, key: &str) -> Result<Option<Value>> {
        self.engine.read(&self.handle, key)
    }

    pub fn write(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.engine.write(&self.handle, key, value)
    }

    pub fn insert(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        self.engine.insert(&self.handle, key, value)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.engine.delete(&self.handle, key)
    }

    pub fn scan(&self, predicate: Predicate) -> Result<Scan<'e>> {
        self.engine.scan(&self.handle, predicate)
    }

    pub fn commit(mut self) -> Result<Timestamp> {
        self.finished = true;
        self.engine.commit(&self.handle)
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.engine.rollback(&self.handle)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            // Best effort; the transaction may already be finalized.
            let _ = self.engine.rollback(&self.handle);
        }
    }
}
