//! Logical timestamps and the global commit counter.
//!
//! Every commit consumes exactly one timestamp. Timestamps are reserved and
//! published from inside a [`CommitSlot`], which doubles as the engine's
//! commit critical section: readers only ever observe the published value,
//! so a commit's versions become visible together.

use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Position in the global commit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a new timestamp with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value of the timestamp.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The timestamp before any commit.
    pub fn min() -> Self {
        Self(0)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ts{}", self.0)
    }
}

/// Owner of the global commit counter.
///
/// Cloning shares the counter and the commit critical section, so one oracle
/// can be injected into several engines that must agree on commit order.
#[derive(Debug, Clone)]
pub struct TimestampOracle {
    /// The last published commit timestamp.
    last_timestamp: Arc<AtomicU64>,
    commit_lock: Arc<Mutex<()>>,
}

impl TimestampOracle {
    /// Creates an oracle whose counter starts at zero.
    pub fn new() -> Self {
        Self::with_start(0)
    }

    /// Creates an oracle with a specific starting value.
    pub fn with_start(start: u64) -> Self {
        Self {
            last_timestamp: Arc::new(AtomicU64::new(start)),
            commit_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The highest published commit timestamp.
    ///
    /// A single atomic load; never blocks behind a commit in progress.
    pub fn current(&self) -> Timestamp {
        Timestamp::new(self.last_timestamp.load(Ordering::SeqCst))
    }

    /// Enters the commit critical section and reserves the next timestamp.
    ///
    /// Blocks while another commit holds the section. Dropping the slot
    /// without calling [`CommitSlot::publish`] leaves the counter untouched.
    pub fn begin_commit(&self) -> CommitSlot<'_> {
        let guard = self.commit_lock.lock();
        let timestamp = self.current().next();
        CommitSlot {
            oracle: self,
            timestamp,
            _guard: guard,
        }
    }
}

impl Default for TimestampOracle {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive right to assign the next commit timestamp.
#[must_use = "a commit slot does nothing unless published"]
pub struct CommitSlot<'a> {
    oracle: &'a TimestampOracle,
    timestamp: Timestamp,
    _guard: MutexGuard<'a, ()>,
}

impl CommitSlot<'_> {
    /// The timestamp this commit will receive once published.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Makes the reserved timestamp current and leaves the critical section.
    pub fn publish(self) -> Timestamp {
        self.oracle
            .last_timestamp
            .store(self.timestamp.value(), Ordering::SeqCst);
        self.timestamp
    }
}
