//! Versions of keyed records.

use crate::concurrency::timestamp::Timestamp;
use crate::transaction::TransactionId;
use bytes::Bytes;

/// Record key.
pub type Key = String;

/// Opaque record payload.
pub type Value = Bytes;

/// What a version holds: data, or the marker left by a delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Value(Value),
    Tombstone,
}

impl Payload {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Payload::Value(value) => Some(value),
            Payload::Tombstone => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Payload::Tombstone)
    }
}

/// Lifecycle of a single version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionState {
    /// Written by a transaction that has not finished yet.
    Uncommitted,
    /// Made durable in commit order by its creator's commit.
    Committed,
    /// Left behind by a rollback; never visible, retired by GC.
    Discarded,
}

/// One entry in a row's version chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub payload: Payload,
    /// The transaction that wrote this version.
    pub creator: TransactionId,
    /// Set when the creator commits.
    pub commit_ts: Option<Timestamp>,
    pub state: VersionState,
}

impl Version {
    /// A fresh uncommitted version owned by `creator`.
    pub fn uncommitted(creator: TransactionId, payload: Payload) -> Self {
        Self {
            payload,
            creator,
            commit_ts: None,
            state: VersionState::Uncommitted,
        }
    }

    /// Promotes this version to committed at `ts`.
    pub fn commit(&mut self, ts: Timestamp) {
        debug_assert_eq!(self.state, VersionState::Uncommitted);
        self.state = VersionState::Committed;
        self.commit_ts = Some(ts);
    }

    pub fn discard(&mut self) {
        debug_assert_eq!(self.state, VersionState::Uncommitted);
        self.state = VersionState::Discarded;
    }

    /// Whether this is the pending write of `tid`.
    pub fn is_pending_write_of(&self, tid: TransactionId) -> bool {
        self.creator == tid && self.state == VersionState::Uncommitted
    }

    /// Whether this version was committed at or before `ts`.
    pub fn committed_at_or_before(&self, ts: Timestamp) -> bool {
        self.state == VersionState::Committed && self.commit_ts.is_some_and(|c| c <= ts)
    }

    pub fn value(&self) -> Option<&Value> {
        self.payload.value()
    }
}
