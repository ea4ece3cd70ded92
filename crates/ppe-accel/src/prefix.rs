//! Prefix Table Manager
//!
//! Direct-mapped, refcounted NPTv6 prefix rows. The engine sees exactly one
//! install when a row goes 0→1 and exactly one delete when it goes 1→0.
//! Each row's mutex is held across lookup and hardware programming, so two
//! threads acquiring the same free row cannot both install it.

use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ipnetwork::Ipv6Network;

use crate::error::{AccelError, Result};
use crate::hal::PpeHal;
use crate::slot::SlotPool;

struct Inner<H> {
    hal: Arc<H>,
    pool: Arc<SlotPool>,
    installs: AtomicU64,
    removals: AtomicU64,
}

impl<H: PpeHal> Inner<H> {
    fn get_ref(&self, index: u32) {
        // Holders always reference an in-range, installed row.
        if let Ok(slot) = self.pool.prefix(index) {
            let mut slot = slot.lock();
            slot.get();
            tracing::trace!(index, refcount = slot.refcount(), "prefix ref taken");
        }
    }

    fn put_ref(&self, index: u32) -> bool {
        let Ok(slot) = self.pool.prefix(index) else {
            return false;
        };
        let mut slot = slot.lock();
        if !slot.put() {
            tracing::trace!(index, refcount = slot.refcount(), "prefix ref dropped");
            return false;
        }

        tracing::debug!(index, "prefix_del");
        if let Err(status) = self.hal.prefix_del(index) {
            tracing::warn!(index, %status, "prefix delete failed, slot freed anyway");
        }
        self.removals.fetch_add(1, Ordering::Relaxed);
        self.pool.note_prefix_freed();
        true
    }
}

/// Prefix table bound to one engine
pub struct PrefixTable<H> {
    inner: Arc<Inner<H>>,
}

impl<H> Clone for PrefixTable<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: PpeHal> PrefixTable<H> {
    /// Create new table over `pool`
    pub fn new(hal: Arc<H>, pool: Arc<SlotPool>) -> Self {
        Self {
            inner: Arc::new(Inner {
                hal,
                pool,
                installs: AtomicU64::new(0),
                removals: AtomicU64::new(0),
            }),
        }
    }

    /// Take a reference on row `key`, programming the engine if the row is
    /// free.
    ///
    /// A failed install leaves the row untouched.
    pub fn acquire(&self, key: u32, prefix: Ipv6Addr, prefix_len: u8) -> Result<PrefixRef<H>> {
        Ipv6Network::new(prefix, prefix_len)
            .map_err(|e| AccelError::InvalidPrefix(format!("{}/{}: {}", prefix, prefix_len, e)))?;

        let inner = &self.inner;
        let mut slot = inner.pool.prefix(key)?.lock();

        if !slot.is_free() {
            slot.get();
            if slot.installed() != Some((prefix, prefix_len)) {
                tracing::debug!(
                    index = key,
                    installed = ?slot.installed(),
                    requested = %prefix,
                    prefix_len,
                    "prefix row shared with a different prefix"
                );
            }
            tracing::trace!(index = key, refcount = slot.refcount(), "prefix ref taken");
        } else {
            tracing::debug!(index = key, %prefix, prefix_len, "prefix_add");
            if let Err(status) = inner.hal.prefix_add(key, prefix, prefix_len) {
                tracing::warn!(index = key, %prefix, prefix_len, %status, "prefix add failed");
                return Err(AccelError::hw("prefix_add", status));
            }
            slot.init(prefix, prefix_len);
            inner.installs.fetch_add(1, Ordering::Relaxed);
            inner.pool.note_prefix_installed();
        }
        drop(slot);

        Ok(PrefixRef {
            inner: Arc::clone(inner),
            index: key,
            armed: true,
        })
    }

    /// Current refcount of row `index`
    pub fn refcount(&self, index: u32) -> Result<u32> {
        Ok(self.inner.pool.prefix(index)?.lock().refcount())
    }

    /// Hardware installs issued
    pub fn installs(&self) -> u64 {
        self.inner.installs.load(Ordering::Relaxed)
    }

    /// Hardware deletes issued
    pub fn removals(&self) -> u64 {
        self.inner.removals.load(Ordering::Relaxed)
    }

    /// Underlying slot pool
    pub fn pool(&self) -> &Arc<SlotPool> {
        &self.inner.pool
    }
}

/// Owned reference on a prefix row; released on drop
pub struct PrefixRef<H: PpeHal> {
    inner: Arc<Inner<H>>,
    index: u32,
    armed: bool,
}

impl<H: PpeHal> PrefixRef<H> {
    /// Row index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Release now; `true` if the row was freed (and deleted from the engine)
    pub fn release(mut self) -> bool {
        self.armed = false;
        self.inner.put_ref(self.index)
    }
}

impl<H: PpeHal> Clone for PrefixRef<H> {
    fn clone(&self) -> Self {
        self.inner.get_ref(self.index);
        Self {
            inner: Arc::clone(&self.inner),
            index: self.index,
            armed: true,
        }
    }
}

impl<H: PpeHal> Drop for PrefixRef<H> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.put_ref(self.index);
        }
    }
}

impl<H: PpeHal> std::fmt::Debug for PrefixRef<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefixRef").field("index", &self.index).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::MockHal;
    use crate::hal::HwStatus;

    fn table() -> (Arc<MockHal>, PrefixTable<MockHal>) {
        let hal = Arc::new(MockHal::default());
        let pool = Arc::new(SlotPool::new(8, 16));
        (Arc::clone(&hal), PrefixTable::new(hal, pool))
    }

    fn pfx() -> Ipv6Addr {
        "2001:db8:1::".parse().unwrap()
    }

    #[test]
    fn test_shared_prefix_installed_once() {
        let (hal, table) = table();

        let fwd = table.acquire(3, pfx(), 48).unwrap();
        assert_eq!(table.refcount(3).unwrap(), 1);
        let rev = table.acquire(3, pfx(), 48).unwrap();
        assert_eq!(table.refcount(3).unwrap(), 2);
        assert_eq!(MockHal::count(&hal.prefix_adds), 1);

        assert!(!fwd.release());
        assert_eq!(MockHal::count(&hal.prefix_dels), 0);
        drop(rev);
        assert_eq!(MockHal::count(&hal.prefix_dels), 1);
        assert_eq!(table.refcount(3).unwrap(), 0);
        assert_eq!(table.pool().prefixes_in_use(), 0);
    }

    #[test]
    fn test_failed_install_leaves_slot_free() {
        let (hal, table) = table();
        *hal.fail_prefix_add.lock() = Some(HwStatus::Full);

        let err = table.acquire(1, pfx(), 48).unwrap_err();
        assert_eq!(err.hw_status(), Some(HwStatus::Full));
        assert_eq!(table.refcount(1).unwrap(), 0);
        assert_eq!(table.installs(), 0);

        *hal.fail_prefix_add.lock() = None;
        let r = table.acquire(1, pfx(), 48).unwrap();
        assert_eq!(table.installs(), 1);
        assert!(r.release());
    }

    #[test]
    fn test_clone_takes_reference() {
        let (hal, table) = table();
        let a = table.acquire(0, pfx(), 64).unwrap();
        let b = a.clone();
        assert_eq!(table.refcount(0).unwrap(), 2);
        drop(a);
        drop(b);
        assert_eq!(MockHal::count(&hal.prefix_adds), 1);
        assert_eq!(MockHal::count(&hal.prefix_dels), 1);
    }

    #[test]
    fn test_reinstall_after_free() {
        let (hal, table) = table();
        table.acquire(2, pfx(), 48).unwrap().release();
        table.acquire(2, pfx(), 48).unwrap().release();
        assert_eq!(MockHal::count(&hal.prefix_adds), 2);
        assert_eq!(MockHal::count(&hal.prefix_dels), 2);
    }

    #[test]
    fn test_out_of_range_and_invalid() {
        let (_hal, table) = table();
        assert!(matches!(
            table.acquire(8, pfx(), 48),
            Err(AccelError::PrefixIndexOutOfRange(8))
        ));
        assert!(matches!(
            table.acquire(0, pfx(), 129),
            Err(AccelError::InvalidPrefix(_))
        ));
    }

    #[test]
    fn test_concurrent_acquire_installs_once() {
        let (hal, table) = table();
        let refs: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| table.acquire(5, pfx(), 48).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(MockHal::count(&hal.prefix_adds), 1);
        assert_eq!(table.refcount(5).unwrap(), 8);
        drop(refs);
        assert_eq!(MockHal::count(&hal.prefix_dels), 1);
    }
}
