//! Commit and rollback.

use super::Engine;
use crate::concurrency::timestamp::Timestamp;
use crate::concurrency::validation::{validate, CommitRecord, WriteRecord};
use crate::concurrency::visibility::ReadView;
use crate::engine::TransactionHandle;
use crate::error::{EngineError, Result};
use crate::transaction::{IsolationLevel, TransactionInfo, TransactionState};
use std::sync::atomic::Ordering;

impl Engine {
    /// Commits `tx` and returns its commit timestamp.
    ///
    /// All of the transaction's writes become visible together when the
    /// timestamp is published. A SERIALIZABLE transaction that fails
    /// validation is rolled back and reported as `SerializationFailure`.
    pub fn commit(&self, tx: &TransactionHandle) -> Result<Timestamp> {
        let shared = self.transactions.active(tx.id)?;
        let info = {
            let mut info = shared.lock();
            info.prepare()?;
            info.clone()
        };

        let slot = self.oracle.begin_commit();

        if info.isolation == IsolationLevel::Serializable {
            let outcome = validate(&info, &self.history, |key, as_of| {
                self.store
                    .get(key, &ReadView::committed_as_of(as_of))
                    .and_then(|version| version.value().cloned())
            });
            if let Err(conflict) = outcome {
                drop(slot);
                self.abort_prepared(&info)?;
                return Err(EngineError::SerializationFailure {
                    id: tx.id,
                    conflict,
                });
            }
        }

        let commit_ts = slot.timestamp();
        let promoted = self
            .store
            .commit_versions(tx.id, info.write_set.keys(), commit_ts);

        if !info.write_set.is_empty() {
            let as_committed = ReadView::committed_as_of(commit_ts);
            let writes = info
                .write_set
                .iter()
                .map(|(key, kind)| WriteRecord {
                    key: key.clone(),
                    kind: *kind,
                    after: self
                        .store
                        .get(key, &as_committed)
                        .and_then(|version| version.value().cloned()),
                })
                .collect();
            self.history.record(CommitRecord {
                tid: tx.id,
                commit_ts,
                writes,
            });
        }

        self.transactions
            .finalize(tx.id, TransactionState::Committed, Some(commit_ts))?;
        let commit_ts = slot.publish();
        self.locks.release_all(tx.id);

        log::debug!(
            "commit {} at {} ({} versions)",
            tx.id,
            commit_ts,
            promoted
        );
        self.maybe_collect_garbage();
        Ok(commit_ts)
    }

    /// Rolls back `tx`, discarding every version it wrote.
    pub fn rollback(&self, tx: &TransactionHandle) -> Result<()> {
        let shared = self.transactions.active(tx.id)?;
        let info = {
            let mut info = shared.lock();
            info.prepare()?;
            info.clone()
        };
        self.abort_prepared(&info)
    }

    fn abort_prepared(&self, info: &TransactionInfo) -> Result<()> {
        let discarded = self.store.discard_versions(info.id, info.write_set.keys());
        self.transactions
            .finalize(info.id, TransactionState::Aborted, None)?;
        self.locks.release_all(info.id);
        log::debug!("rollback {} ({} versions discarded)", info.id, discarded);
        Ok(())
    }

    fn maybe_collect_garbage(&self) {
        let interval = self.config.gc_interval;
        if interval == 0 {
            return;
        }
        if self.commits_since_gc.fetch_add(1, Ordering::SeqCst) + 1 >= interval {
            self.commits_since_gc.store(0, Ordering::SeqCst);
            self.garbage_collect();
        }
    }
}
