//! Atomic operations on shared lock words.
//!
//! Every helper is sequentially consistent, which on x86-64 compiles down
//! to a single LOCK-prefixed instruction. The locking protocols assume
//! that a read of a field published through one of these operations
//! observes the publishing write.

use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

/// Atomic increment. The delta is applied in two's complement, so a
/// negative value subtracts.
pub fn atomic_increment(word: &AtomicU64, incr: i64) {
    word.fetch_add(incr as u64, SeqCst);
}

/// Atomic bitwise AND.
pub fn atomic_and(word: &AtomicU64, val: u64) {
    word.fetch_and(val, SeqCst);
}

/// Atomic bitwise OR.
pub fn atomic_or(word: &AtomicU64, val: u64) {
    word.fetch_or(val, SeqCst);
}

/// Fetch and add. Returns the value before modification.
pub fn fetch_and_add(word: &AtomicU64, incr: i64) -> u64 {
    word.fetch_add(incr as u64, SeqCst)
}

/// Fetch and store. Unconditionally swaps in `val`, returning the prior
/// value.
pub fn fetch_and_store(word: &AtomicU64, val: u64) -> u64 {
    word.swap(val, SeqCst)
}

/// Compare and swap. If the word equals `old`, set it to `new` and return
/// true; otherwise return false.
pub fn compare_and_swap(word: &AtomicU64, old: u64, new: u64) -> bool {
    word.compare_exchange(old, new, SeqCst, SeqCst).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_fetch() {
        let w = AtomicU64::new(10);
        atomic_increment(&w, 5);
        assert_eq!(w.load(SeqCst), 15);
        atomic_increment(&w, -5);
        assert_eq!(w.load(SeqCst), 10);

        assert_eq!(fetch_and_add(&w, 2), 10);
        assert_eq!(fetch_and_add(&w, -12), 12);
        assert_eq!(w.load(SeqCst), 0);
    }

    #[test]
    fn test_bitwise() {
        let w = AtomicU64::new(0b0101);
        atomic_or(&w, 0b0010);
        assert_eq!(w.load(SeqCst), 0b0111);
        atomic_and(&w, !0b0001);
        assert_eq!(w.load(SeqCst), 0b0110);
    }

    #[test]
    fn test_swap_and_cas() {
        let w = AtomicU64::new(7);
        assert_eq!(fetch_and_store(&w, 9), 7);
        assert!(!compare_and_swap(&w, 7, 1));
        assert!(compare_and_swap(&w, 9, 1));
        assert_eq!(w.load(SeqCst), 1);
    }
}
