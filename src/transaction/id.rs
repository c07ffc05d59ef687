//! Transaction ID generation.

use std::sync::atomic::{AtomicU64, Ordering};

/// A unique identifier for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the inner u64 value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// A thread-safe transaction ID generator.
///
/// IDs are issued in increasing order starting from 1, which lets the
/// registry tell a finished transaction apart from one that never existed
/// without archiving every outcome forever.
#[derive(Debug)]
pub struct TransactionIdGenerator {
    next_id: AtomicU64,
}

impl TransactionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Generates the next unique transaction ID.
    pub fn next(&self) -> TransactionId {
        TransactionId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Whether `id` has been handed out by this generator.
    pub fn issued(&self, id: TransactionId) -> bool {
        id.value() >= 1 && id.value() < self.next_id.load(Ordering::SeqCst)
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_transaction_id_display() {
        assert_eq!(format!("{}", TransactionId::new(123)), "tx123");
    }

    #[test]
    fn test_generator_issues_in_order() {
        let generator = TransactionIdGenerator::new();

        assert!(!generator.issued(TransactionId::new(1)));

        let id1 = generator.next();
        let id2 = generator.next();

        assert_eq!(id1.value(), 1);
        assert_eq!(id2.value(), 2);
        assert!(generator.issued(id1));
        assert!(generator.issued(id2));
        assert!(!generator.issued(TransactionId::new(0)));
        assert!(!generator.issued(TransactionId::new(3)));
    }

    #[test]
    fn test_generator_thread_safety() {
        let generator = Arc::new(TransactionIdGenerator::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let generator = Arc::clone(&generator);
                thread::spawn(move || (0..100).map(|_| generator.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all_ids = vec![];
        for handle in handles {
            all_ids.extend(handle.join().unwrap());
        }

        all_ids.sort();
        all_ids.dedup();
        assert_eq!(all_ids.len(), 1000);
        assert_eq!(all_ids.last().map(|id| id.value()), Some(1000));
    }
}
