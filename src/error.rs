//! Error types.

use crate::concurrency::validation::Conflict;
use crate::storage::record::Key;
use crate::transaction::TransactionId;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by engine operations.
///
/// None of these is fatal to the engine; each concerns only the transaction
/// that received it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("key {0:?} not found")]
    NotFound(Key),

    #[error("key {0:?} already exists")]
    DuplicateKey(Key),

    #[error("write lock on {key:?} is not available (holder: {holder:?})")]
    LockConflict {
        key: Key,
        holder: Option<TransactionId>,
    },

    #[error("gave up on write lock for {key:?} after {waited:?}")]
    LockTimeout { key: Key, waited: Duration },

    #[error("could not serialize {id}: {conflict}")]
    SerializationFailure { id: TransactionId, conflict: Conflict },

    #[error("{0} is already committed or rolled back")]
    TransactionFinalized(TransactionId),

    #[error("{0} was never started by this engine")]
    UnknownTransaction(TransactionId),
}

impl EngineError {
    /// Whether running the transaction again from `begin` may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::LockConflict { .. }
                | EngineError::LockTimeout { .. }
                | EngineError::SerializationFailure { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while loading an [`EngineConfig`](crate::config::EngineConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}
