//! Row write locks.
//!
//! Each row has at most one exclusive holder. Contending writers queue in
//! FIFO order and a released lock is handed straight to the oldest waiter.
//! Reads never take locks.

use crate::error::{EngineError, Result};
use crate::storage::record::Key;
use crate::transaction::TransactionId;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Holder and queue of one row lock.
#[derive(Debug)]
struct LockEntry {
    holder: TransactionId,
    waiters: VecDeque<TransactionId>,
}

/// Wait-for information.
///
/// A transaction blocks on at most one lock at a time, so the wait-for graph
/// is a set of chains: waiter -> key -> holder -> key -> holder ...
#[derive(Debug, Default)]
struct DeadlockDetector {
    waiting_on: HashMap<TransactionId, Key>,
}

impl DeadlockDetector {
    fn start_waiting(&mut self, tid: TransactionId, key: &str) {
        self.waiting_on.insert(tid, key.to_string());
    }

    fn stop_waiting(&mut self, tid: TransactionId) {
        self.waiting_on.remove(&tid);
    }

    /// Whether `waiter` blocking behind `holder` would close a cycle.
    fn would_cause_deadlock(
        &self,
        waiter: TransactionId,
        holder: TransactionId,
        entries: &HashMap<Key, LockEntry>,
    ) -> bool {
        let mut visited = HashSet::new();
        let mut current = holder;

        loop {
            if current == waiter {
                return true;
            }
            if !visited.insert(current) {
                return false;
            }
            match self
                .waiting_on
                .get(&current)
                .and_then(|key| entries.get(key))
            {
                Some(entry) => current = entry.holder,
                None => return false,
            }
        }
    }
}

#[derive(Debug, Default)]
struct LockTable {
    entries: HashMap<Key, LockEntry>,
    held: HashMap<TransactionId, HashSet<Key>>,
    detector: DeadlockDetector,
}

impl LockTable {
    fn grant(&mut self, tid: TransactionId, key: &str) {
        self.held.entry(tid).or_default().insert(key.to_string());
    }

    /// Drops `tid` from the queue of `key` and returns whether it was queued.
    fn abandon_wait(&mut self, tid: TransactionId, key: &str) -> bool {
        self.detector.stop_waiting(tid);
        match self.entries.get_mut(key) {
            Some(entry) => {
                let before = entry.waiters.len();
                entry.waiters.retain(|w| *w != tid);
                before != entry.waiters.len()
            }
            None => false,
        }
    }

    /// Releases `key` if `tid` holds it, handing it to the next waiter.
    ///
    /// Returns true when ownership moved to another transaction.
    fn release(&mut self, tid: TransactionId, key: &str) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.holder != tid {
            return false;
        }
        match entry.waiters.pop_front() {
            Some(next) => {
                entry.holder = next;
                self.grant(next, key);
                true
            }
            None => {
                self.entries.remove(key);
                false
            }
        }
    }
}

/// Exclusive per-row lock manager.
#[derive(Debug)]
pub struct LockManager {
    table: Mutex<LockTable>,
    /// Signalled whenever a lock changes hands.
    handed_off: Condvar,
    detect_deadlocks: bool,
}

impl LockManager {
    pub fn new(detect_deadlocks: bool) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            handed_off: Condvar::new(),
            detect_deadlocks,
        }
    }

    /// Acquires the write lock on `key` for `tid`.
    ///
    /// Re-acquiring a held lock succeeds immediately. Otherwise the caller
    /// blocks up to `timeout` (`None` waits forever). A zero timeout, or a
    /// wait that would deadlock, fails at once with `LockConflict`.
    pub fn acquire(&self, tid: TransactionId, key: &str, timeout: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        let deadline = timeout.map(|t| start + t);
        let mut table = self.table.lock();

        let holder = match table.entries.get(key).map(|e| e.holder) {
            None => {
                table.entries.insert(
                    key.to_string(),
                    LockEntry {
                        holder: tid,
                        waiters: VecDeque::new(),
                    },
                );
                table.grant(tid, key);
                return Ok(());
            }
            Some(holder) if holder == tid => return Ok(()),
            Some(holder) => holder,
        };

        let conflict = || EngineError::LockConflict {
            key: key.to_string(),
            holder: Some(holder),
        };
        if timeout == Some(Duration::ZERO) {
            return Err(conflict());
        }
        if self.detect_deadlocks
            && table
                .detector
                .would_cause_deadlock(tid, holder, &table.entries)
        {
            return Err(conflict());
        }

        log::trace!("{} waiting for lock on {:?} held by {}", tid, key, holder);
        if let Some(entry) = table.entries.get_mut(key) {
            entry.waiters.push_back(tid);
        }
        table.detector.start_waiting(tid, key);

        loop {
            if table.entries.get(key).is_some_and(|e| e.holder == tid) {
                table.detector.stop_waiting(tid);
                return Ok(());
            }

            match deadline {
                Some(deadline) => {
                    if self.handed_off.wait_until(&mut table, deadline).timed_out() {
                        if table.entries.get(key).is_some_and(|e| e.holder == tid) {
                            table.detector.stop_waiting(tid);
                            return Ok(());
                        }
                        table.abandon_wait(tid, key);
                        return Err(EngineError::LockTimeout {
                            key: key.to_string(),
                            waited: start.elapsed(),
                        });
                    }
                }
                None => self.handed_off.wait(&mut table),
            }
        }
    }

    /// Releases one lock held by `tid`.
    pub fn release(&self, tid: TransactionId, key: &str) {
        let mut table = self.table.lock();
        if let Some(keys) = table.held.get_mut(&tid) {
            keys.remove(key);
            if keys.is_empty() {
                table.held.remove(&tid);
            }
        }
        if table.release(tid, key) {
            self.handed_off.notify_all();
        }
    }

    /// Releases every lock held by `tid` and returns how many there were.
    pub fn release_all(&self, tid: TransactionId) -> usize {
        let mut table = self.table.lock();
        let keys = table.held.remove(&tid).unwrap_or_default();

        let mut handed_off = false;
        for key in &keys {
            handed_off |= table.release(tid, key);
        }
        table.detector.stop_waiting(tid);
        drop(table);

        if handed_off {
            self.handed_off.notify_all();
        }
        keys.len()
    }

    pub fn holds(&self, tid: TransactionId, key: &str) -> bool {
        self.holder(key) == Some(tid)
    }

    pub fn holder(&self, key: &str) -> Option<TransactionId> {
        self.table.lock().entries.get(key).map(|e| e.holder)
    }

    /// Keys locked by `tid`, sorted.
    pub fn held_by(&self, tid: TransactionId) -> Vec<Key> {
        let table = self.table.lock();
        let mut keys: Vec<Key> = table
            .held
            .get(&tid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn tx(id: u64) -> TransactionId {
        TransactionId::new(id)
    }

    #[test]
    fn test_basic_acquire_release() {
        let manager = LockManager::default();

        manager.acquire(tx(1), "alice", None).unwrap();
        assert!(manager.holds(tx(1), "alice"));
        // Re-entrant for the holder.
        manager.acquire(tx(1), "alice", Some(Duration::ZERO)).unwrap();

        manager.release(tx(1), "alice");
        assert!(!manager.holds(tx(1), "alice"));
        assert_eq!(manager.holder("alice"), None);
    }

    #[test]
    fn test_zero_timeout_reports_conflict() {
        let manager = LockManager::default();
        manager.acquire(tx(1), "alice", None).unwrap();

        let err = manager
            .acquire(tx(2), "alice", Some(Duration::ZERO))
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::LockConflict {
                key: "alice".to_string(),
                holder: Some(tx(1)),
            }
        );
    }

    #[test]
    fn test_wait_times_out() {
        let manager = LockManager::default();
        manager.acquire(tx(1), "alice", None).unwrap();

        let err = manager
            .acquire(tx(2), "alice", Some(Duration::from_millis(50)))
            .unwrap_err();
        match err {
            EngineError::LockTimeout { key, waited } => {
                assert_eq!(key, "alice");
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // The abandoned request must not be granted later.
        manager.release_all(tx(1));
        assert_eq!(manager.holder("alice"), None);
    }

    #[test]
    fn test_waiter_is_granted_on_release() {
        let manager = Arc::new(LockManager::default());
        let barrier = Arc::new(Barrier::new(2));
        manager.acquire(tx(1), "alice", None).unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                manager.acquire(tx(2), "alice", Some(Duration::from_secs(5)))
            })
        };

        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(manager.release_all(tx(1)), 1);

        waiter.join().unwrap().unwrap();
        assert!(manager.holds(tx(2), "alice"));
        assert_eq!(manager.held_by(tx(2)), vec!["alice".to_string()]);
    }

    #[test]
    fn test_fifo_hand_off() {
        let manager = Arc::new(LockManager::default());
        manager.acquire(tx(1), "alice", None).unwrap();

        let spawn_waiter = |id: u64| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                manager
                    .acquire(tx(id), "alice", Some(Duration::from_secs(5)))
                    .unwrap();
                let holder = manager.holder("alice");
                manager.release_all(tx(id));
                holder
            })
        };

        let second = spawn_waiter(2);
        thread::sleep(Duration::from_millis(30));
        let third = spawn_waiter(3);
        thread::sleep(Duration::from_millis(30));

        manager.release_all(tx(1));
        assert_eq!(second.join().unwrap(), Some(tx(2)));
        assert_eq!(third.join().unwrap(), Some(tx(3)));
        assert_eq!(manager.holder("alice"), None);
    }

    #[test]
    fn test_release_all() {
        let manager = LockManager::default();
        for key in ["a", "b", "c"] {
            manager.acquire(tx(1), key, None).unwrap();
        }
        assert_eq!(manager.held_by(tx(1)).len(), 3);

        assert_eq!(manager.release_all(tx(1)), 3);
        assert!(manager.held_by(tx(1)).is_empty());
        assert_eq!(manager.release_all(tx(1)), 0);
    }

    #[test]
    fn test_deadlock_detection() {
        let manager = Arc::new(LockManager::default());
        manager.acquire(tx(1), "a", None).unwrap();
        manager.acquire(tx(2), "b", None).unwrap();

        // T1 blocks on b behind T2.
        let blocked = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.acquire(tx(1), "b", Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(50));

        // T2 asking for a would close the cycle.
        let err = manager
            .acquire(tx(2), "a", Some(Duration::from_secs(5)))
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::LockConflict {
                key: "a".to_string(),
                holder: Some(tx(1)),
            }
        );

        manager.release_all(tx(2));
        blocked.join().unwrap().unwrap();
        assert!(manager.holds(tx(1), "b"));
    }
}
