pub mod concurrency;
pub mod config;
pub mod engine;
pub mod error;
pub mod storage;
pub mod transaction;

pub use concurrency::predicate::Predicate;
pub use concurrency::timestamp::Timestamp;
pub use config::EngineConfig;
pub use engine::{Engine, Scan, Transaction, TransactionHandle};
pub use error::{EngineError, Result};
pub use storage::{Key, Value};
pub use transaction::{IsolationLevel, TransactionId, TransactionState};
