//! SERIALIZABLE commit validation.
//!
//! Every commit leaves a [`CommitRecord`] behind. A committing SERIALIZABLE
//! transaction is checked against the records of everything that committed
//! after its snapshot: if any of them wrote a row it also wrote, a row it
//! read, or a row matching one of its scan predicates, committing would not
//! be equivalent to any serial order and the transaction must abort.

use crate::concurrency::timestamp::Timestamp;
use crate::storage::record::{Key, Value};
use crate::transaction::{TransactionId, TransactionInfo, WriteKind};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::fmt;

/// One row changed by a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub key: Key,
    pub kind: WriteKind,
    /// The committed value; `None` for deletes.
    pub after: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub tid: TransactionId,
    pub commit_ts: Timestamp,
    pub writes: Vec<WriteRecord>,
}

/// Committed write sets in commit order.
///
/// Appended only from inside the commit critical section, so records are
/// sorted by timestamp.
#[derive(Debug, Default)]
pub struct CommitHistory {
    records: RwLock<VecDeque<CommitRecord>>,
}

impl CommitHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: CommitRecord) {
        let mut records = self.records.write();
        debug_assert!(records
            .back()
            .map_or(true, |last| last.commit_ts < record.commit_ts));
        records.push_back(record);
    }

    /// Drops records no live snapshot predates.
    pub fn prune(&self, horizon: Timestamp) -> usize {
        let mut records = self.records.write();
        let keep_from = records.partition_point(|r| r.commit_ts <= horizon);
        records.drain(..keep_from);
        keep_from
    }

    /// Copies of the records committed after `ts`, oldest first.
    pub fn records_after(&self, ts: Timestamp) -> Vec<CommitRecord> {
        let records = self.records.read();
        let start = records.partition_point(|r| r.commit_ts <= ts);
        records.range(start..).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }
}

/// Why a transaction could not be serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// Both transactions wrote the row.
    WriteWrite { key: Key, other: TransactionId },
    /// A row read by point lookup was changed after the snapshot.
    StaleRead { key: Key, other: TransactionId },
    /// A changed row falls under a predicate the transaction scanned.
    Phantom {
        key: Key,
        other: TransactionId,
        predicate: String,
    },
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::WriteWrite { key, other } => {
                write!(f, "{key:?} was also written by {other}")
            }
            Conflict::StaleRead { key, other } => {
                write!(f, "{key:?} was read before {other} changed it")
            }
            Conflict::Phantom {
                key,
                other,
                predicate,
            } => write!(f, "{other} changed {key:?} matching scan {predicate}"),
        }
    }
}

/// Checks `info` against every commit after its snapshot.
///
/// A transaction that wrote nothing is serializable at its snapshot and
/// always passes. `before_image` returns the committed value of a key as of
/// a timestamp, so a delete or update can be tested against the row the
/// scan would have seen. Must run inside the commit critical section.
pub fn validate<F>(
    info: &TransactionInfo,
    history: &CommitHistory,
    before_image: F,
) -> Result<(), Conflict>
where
    F: Fn(&str, Timestamp) -> Option<Value>,
{
    let Some(snapshot) = info.snapshot else {
        return Ok(());
    };
    if info.write_set.is_empty() {
        return Ok(());
    }

    let records = history.records.read();
    let start = records.partition_point(|r| r.commit_ts <= snapshot);

    for record in records.range(start..) {
        for write in &record.writes {
            if info.write_set.contains_key(&write.key) {
                return Err(Conflict::WriteWrite {
                    key: write.key.clone(),
                    other: record.tid,
                });
            }
            if info.read_set.rows.contains(&write.key) {
                return Err(Conflict::StaleRead {
                    key: write.key.clone(),
                    other: record.tid,
                });
            }
            for (predicate, as_of) in &info.read_set.predicates {
                let after_matches = write
                    .after
                    .as_ref()
                    .is_some_and(|v| predicate.matches(&write.key, v));
                // An inserted row had nothing for the scan to see before.
                let matches = after_matches
                    || (write.kind != WriteKind::Insert
                        && before_image(&write.key, *as_of)
                            .is_some_and(|v| predicate.matches(&write.key, &v)));
                if matches {
                    return Err(Conflict::Phantom {
                        key: write.key.clone(),
                        other: record.tid,
                        predicate: format!("{predicate:?}"),
                    });
                }
            }
        }
    }
    Ok(())
}
