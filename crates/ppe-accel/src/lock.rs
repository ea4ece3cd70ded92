//! Ranked Locks
//!
//! Every lock in this crate carries a [`LockRank`]. A thread may only take a
//! lock whose rank is strictly greater than every rank it already holds, so
//! connection locks always come before the admission lock, and prefix slot
//! locks come last. Taking locks out of order panics on the spot instead of
//! deadlocking later against the packet path.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

/// Lock acquisition order, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockRank {
    /// Per-connection acceleration state
    Connection = 1,
    /// Process-wide admission counters
    Admission = 2,
    /// Per-slot prefix table row
    PrefixSlot = 3,
}

thread_local! {
    static HELD: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
}

fn rank_acquire(rank: LockRank) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(&top) = held.iter().max() {
            assert!(
                rank > top,
                "lock order violation: acquiring {:?} while holding {:?}",
                rank,
                top
            );
        }
        held.push(rank);
    });
}

fn rank_release(rank: LockRank) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|r| *r == rank) {
            held.remove(pos);
        }
    });
}

/// Highest rank held by the calling thread
pub fn held_rank() -> Option<LockRank> {
    HELD.with(|held| held.borrow().iter().max().copied())
}

/// Mutex that checks acquisition order against the thread's held ranks
pub struct RankedMutex<T> {
    rank: LockRank,
    inner: Mutex<T>,
}

impl<T> RankedMutex<T> {
    /// Create new ranked mutex
    pub fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: Mutex::new(value),
        }
    }

    /// Acquire, panicking if the calling thread holds an equal or higher rank
    #[inline]
    pub fn lock(&self) -> RankedGuard<'_, T> {
        rank_acquire(self.rank);
        RankedGuard {
            rank: self.rank,
            guard: self.inner.lock(),
        }
    }

    /// Exclusive access without locking
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Rank of this lock
    pub fn rank(&self) -> LockRank {
        self.rank
    }
}

impl<T: fmt::Debug> fmt::Debug for RankedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RankedMutex")
            .field("rank", &self.rank)
            .field("inner", &self.inner)
            .finish()
    }
}

/// Guard for a [`RankedMutex`]; releases its rank on drop
pub struct RankedGuard<'a, T> {
    rank: LockRank,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for RankedGuard<'_, T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedGuard<'_, T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RankedGuard<'_, T> {
    fn drop(&mut self) {
        rank_release(self.rank);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_acquire() {
        let conn = RankedMutex::new(LockRank::Connection, 0u32);
        let adm = RankedMutex::new(LockRank::Admission, 0u32);

        let mut c = conn.lock();
        let mut a = adm.lock();
        *c += 1;
        *a += 1;
        assert_eq!(held_rank(), Some(LockRank::Admission));
        drop(a);
        assert_eq!(held_rank(), Some(LockRank::Connection));
        drop(c);
        assert_eq!(held_rank(), None);
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_reverse_order_panics() {
        let conn = RankedMutex::new(LockRank::Connection, ());
        let adm = RankedMutex::new(LockRank::Admission, ());

        let _a = adm.lock();
        let _c = conn.lock();
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn test_same_rank_nesting_panics() {
        let first = RankedMutex::new(LockRank::PrefixSlot, ());
        let second = RankedMutex::new(LockRank::PrefixSlot, ());

        let _a = first.lock();
        let _b = second.lock();
    }

    #[test]
    fn test_ranks_are_per_thread() {
        let adm = std::sync::Arc::new(RankedMutex::new(LockRank::Admission, ()));
        let _held = adm.lock();

        // Another thread holds nothing, so a connection-rank lock is fine there.
        let handle = std::thread::spawn(|| {
            let conn = RankedMutex::new(LockRank::Connection, ());
            let _c = conn.lock();
            held_rank()
        });
        assert_eq!(handle.join().unwrap(), Some(LockRank::Connection));
    }
}
