//! Concurrency control module.
//!
//! This module implements concurrency control for the engine, including:
//! - The global commit counter and commit critical section
//! - Version visibility per isolation level
//! - Exclusive row write locks with deadlock detection
//! - Predicate tracking and SERIALIZABLE commit validation

pub mod lock;
pub mod predicate;
pub mod timestamp;
pub mod validation;
pub mod visibility;
