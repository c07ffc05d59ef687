//! Transaction management module.
//!
//! This module provides the transaction registry for the engine:
//! - Transaction id issuing and isolation levels
//! - Per-transaction state, read sets and write sets
//! - Lifecycle tracking from begin to commit or rollback

pub mod id;
pub mod isolation;
pub mod manager;
pub mod state;

// Re-export commonly used types
pub use id::{TransactionId, TransactionIdGenerator};
pub use isolation::{IsolationLevel, ParseIsolationLevelError};
pub use manager::TransactionManager;
pub use state::{ReadSet, SharedTransactionInfo, TransactionInfo, TransactionState, WriteKind};
