//! Transaction registry.

use parking_lot::RwLock;
use std::collections::HashMap;

use super::id::{TransactionId, TransactionIdGenerator};
use super::isolation::IsolationLevel;
use super::state::{SharedTransactionInfo, TransactionInfo, TransactionState};
use crate::concurrency::timestamp::{Timestamp, TimestampOracle};
use crate::error::{EngineError, Result};

/// Tracks every live transaction and remembers how finished ones ended.
#[derive(Debug)]
pub struct TransactionManager {
    id_generator: TransactionIdGenerator,
    oracle: TimestampOracle,
    active: RwLock<HashMap<TransactionId, SharedTransactionInfo>>,
    /// Outcomes of finished transactions, until `cleanup_finished`.
    finished: RwLock<HashMap<TransactionId, TransactionState>>,
}

impl TransactionManager {
    pub fn new(oracle: TimestampOracle) -> Self {
        Self {
            id_generator: TransactionIdGenerator::new(),
            oracle,
            active: RwLock::new(HashMap::new()),
            finished: RwLock::new(HashMap::new()),
        }
    }

    /// Starts a transaction at the current commit counter.
    pub fn begin(&self, isolation: IsolationLevel) -> SharedTransactionInfo {
        let id = self.id_generator.next();

        // Sampling the counter under the write lock keeps `gc_horizon`
        // from moving past a transaction that is still registering.
        let mut active = self.active.write();
        let info = TransactionInfo::new(id, isolation, self.oracle.current());
        let shared = SharedTransactionInfo::new(info);
        active.insert(id, shared.clone());
        shared
    }

    /// The record of a transaction that has not been finalized.
    pub fn active(&self, id: TransactionId) -> Result<SharedTransactionInfo> {
        if let Some(info) = self.active.read().get(&id) {
            return Ok(info.clone());
        }
        if self.id_generator.issued(id) {
            Err(EngineError::TransactionFinalized(id))
        } else {
            Err(EngineError::UnknownTransaction(id))
        }
    }

    /// Moves a prepared transaction to its final state.
    pub fn finalize(
        &self,
        id: TransactionId,
        outcome: TransactionState,
        commit_ts: Option<Timestamp>,
    ) -> Result<TransactionInfo> {
        let shared = self
            .active
            .write()
            .remove(&id)
            .ok_or(EngineError::TransactionFinalized(id))?;

        let mut info = shared.lock();
        info.finish(outcome, commit_ts);
        self.finished.write().insert(id, outcome);
        Ok(info.clone())
    }

    /// Current state, or `None` for unknown or cleaned-up transactions.
    pub fn state(&self, id: TransactionId) -> Option<TransactionState> {
        if let Some(info) = self.active.read().get(&id) {
            return Some(info.state());
        }
        self.finished.read().get(&id).copied()
    }

    pub fn active_transactions(&self) -> Vec<TransactionId> {
        let mut ids: Vec<_> = self.active.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    /// Finished transactions whose outcome is still remembered.
    pub fn finished_count(&self) -> usize {
        self.finished.read().len()
    }

    /// The oldest timestamp any live transaction may still read at.
    ///
    /// With nothing live this is the published counter itself.
    pub fn gc_horizon(&self) -> Timestamp {
        let active = self.active.read();
        active
            .values()
            .map(|info| info.lock().start_ts)
            .min()
            .unwrap_or_else(|| self.oracle.current())
    }

    /// Forgets the outcomes of finished transactions.
    ///
    /// Their ids keep failing with `TransactionFinalized`.
    pub fn cleanup_finished(&self) -> usize {
        let mut finished = self.finished.write();
        let count = finished.len();
        finished.clear();
        count
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(TimestampOracle::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn finish(manager: &TransactionManager, id: TransactionId, outcome: TransactionState) {
        manager.active(id).unwrap().lock().prepare().unwrap();
        manager.finalize(id, outcome, None).unwrap();
    }

    #[test]
    fn test_begin_assigns_snapshot() {
        let oracle = TimestampOracle::with_start(7);
        let manager = TransactionManager::new(oracle);

        let rr = manager.begin(IsolationLevel::RepeatableRead).info();
        let rc = manager.begin(IsolationLevel::ReadCommitted).info();

        assert_ne!(rr.id, rc.id);
        assert_eq!(rr.start_ts, Timestamp::new(7));
        assert_eq!(rr.snapshot, Some(Timestamp::new(7)));
        assert_eq!(rc.snapshot, None);
        assert_eq!(manager.active_count(), 2);
    }

    #[test]
    fn test_finalize_is_irreversible() {
        let manager = TransactionManager::default();
        let id = manager.begin(IsolationLevel::Serializable).info().id;

        finish(&manager, id, TransactionState::Committed);

        assert_eq!(manager.state(id), Some(TransactionState::Committed));
        assert_eq!(
            manager.active(id).unwrap_err(),
            EngineError::TransactionFinalized(id)
        );
        assert_eq!(
            manager
                .finalize(id, TransactionState::Aborted, None)
                .unwrap_err(),
            EngineError::TransactionFinalized(id)
        );
        assert_eq!(manager.state(id), Some(TransactionState::Committed));
    }

    #[test]
    fn test_unknown_transaction() {
        let manager = TransactionManager::default();
        let fake = TransactionId::new(999);

        assert_eq!(
            manager.active(fake).unwrap_err(),
            EngineError::UnknownTransaction(fake)
        );
        assert_eq!(manager.state(fake), None);
    }

    #[test]
    fn test_cleanup_keeps_ids_finalized() {
        let manager = TransactionManager::default();
        let id1 = manager.begin(IsolationLevel::ReadCommitted).info().id;
        let id2 = manager.begin(IsolationLevel::ReadCommitted).info().id;
        let id3 = manager.begin(IsolationLevel::ReadCommitted).info().id;

        finish(&manager, id1, TransactionState::Committed);
        finish(&manager, id2, TransactionState::Aborted);

        assert_eq!(manager.finished_count(), 2);
        assert_eq!(manager.cleanup_finished(), 2);
        assert_eq!(manager.finished_count(), 0);
        assert_eq!(manager.state(id1), None);
        assert_eq!(
            manager.active(id1).unwrap_err(),
            EngineError::TransactionFinalized(id1)
        );
        assert_eq!(manager.active_transactions(), vec![id3]);
    }

    #[test]
    fn test_gc_horizon_tracks_oldest_start() {
        let oracle = TimestampOracle::new();
        let manager = TransactionManager::new(oracle.clone());

        oracle.begin_commit().publish();
        let old = manager.begin(IsolationLevel::ReadCommitted).info().id;
        oracle.begin_commit().publish();
        oracle.begin_commit().publish();
        let _young = manager.begin(IsolationLevel::RepeatableRead);

        assert_eq!(manager.gc_horizon(), Timestamp::new(1));
        finish(&manager, old, TransactionState::Committed);
        assert_eq!(manager.gc_horizon(), Timestamp::new(3));
    }

    #[test]
    fn test_concurrent_begin() {
        let manager = Arc::new(TransactionManager::default());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    (0..10)
                        .map(|_| manager.begin(IsolationLevel::ReadCommitted).info().id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all_ids = vec![];
        for handle in handles {
            all_ids.extend(handle.join().unwrap());
        }
        all_ids.sort();
        all_ids.dedup();

        assert_eq!(all_ids.len(), 100);
        assert_eq!(manager.active_count(), 100);
    }
}
