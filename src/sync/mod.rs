//! Locking primitives (spec.md §4.1, §4.10): busy-wait spinlocks with
//! matched interrupt-disable nesting, and blocking sleep-locks built
//! on top of them.

pub mod sleeplock;
pub mod spinlock;
