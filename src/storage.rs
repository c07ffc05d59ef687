//! Record storage.
//!
//! Keyed records live in memory as chains of versions. A chain keeps every
//! version some live transaction might still read; older ones are retired by
//! garbage collection once no snapshot can reach them.

pub mod record;
pub mod record_store;

pub use record::{Key, Payload, Value, Version, VersionState};
pub use record_store::{GcStats, RecordStore, RowChain, ScannedRow, StoreScan};
