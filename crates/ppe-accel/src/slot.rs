//! Resource Slot Pool
//!
//! Fixed, index-addressed prefix and IID slot arrays sized from the engine's
//! capacity report and allocated once at startup.
//!
//! # Design
//!
//! - Prefix slots are refcounted, one ranked mutex per slot
//! - IID slots carry no refcount, only which directions are programmed
//! - Slots are never reallocated; indices are stable for the pool's lifetime

use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::error::{AccelError, Result};
use crate::lock::{LockRank, RankedMutex};

/// Prefix table row
#[derive(Debug)]
pub struct PrefixSlot {
    index: u32,
    refcount: u32,
    installed: Option<(Ipv6Addr, u8)>,
}

impl PrefixSlot {
    fn new(index: u32) -> Self {
        Self {
            index,
            refcount: 0,
            installed: None,
        }
    }

    /// Row index
    #[inline(always)]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Outstanding references
    #[inline(always)]
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    /// Free iff no references remain
    #[inline(always)]
    pub fn is_free(&self) -> bool {
        self.refcount == 0
    }

    /// Prefix programmed into the engine, if any
    pub fn installed(&self) -> Option<(Ipv6Addr, u8)> {
        self.installed
    }

    /// First reference after a successful hardware install
    pub(crate) fn init(&mut self, prefix: Ipv6Addr, prefix_len: u8) {
        debug_assert!(self.is_free());
        self.refcount = 1;
        self.installed = Some((prefix, prefix_len));
    }

    /// Take another reference on an installed slot
    pub(crate) fn get(&mut self) {
        debug_assert!(!self.is_free());
        self.refcount += 1;
    }

    /// Drop a reference; `true` when it was the last one
    ///
    /// # Panics
    ///
    /// On release of a free slot.
    pub(crate) fn put(&mut self) -> bool {
        assert!(
            self.refcount > 0,
            "prefix slot {} refcount underflow",
            self.index
        );
        self.refcount -= 1;
        if self.refcount == 0 {
            self.installed = None;
            return true;
        }
        false
    }
}

/// IID direction bit: forward flow programmed
pub(crate) const IID_FORWARD: u8 = 0b01;
/// IID direction bit: reverse flow programmed
pub(crate) const IID_REVERSE: u8 = 0b10;

/// IID table row shared by the forward/reverse flow index pair
#[derive(Debug)]
pub struct IidSlot {
    index: u16,
    directions: AtomicU8,
}

impl IidSlot {
    fn new(index: u16) -> Self {
        Self {
            index,
            directions: AtomicU8::new(0),
        }
    }

    /// Row index
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Programmed direction bits
    pub fn directions(&self) -> u8 {
        self.directions.load(Ordering::Acquire)
    }

    /// Free iff no direction is programmed
    pub fn is_free(&self) -> bool {
        self.directions() == 0
    }

    /// Mark `bit` programmed; returns the previous bits
    pub(crate) fn mark(&self, bit: u8) -> u8 {
        self.directions.fetch_or(bit, Ordering::AcqRel)
    }

    /// Mark `bit` cleared; returns the previous bits
    pub(crate) fn clear(&self, bit: u8) -> u8 {
        self.directions.fetch_and(!bit, Ordering::AcqRel)
    }
}

/// Process-wide slot arrays
pub struct SlotPool {
    prefixes: Box<[RankedMutex<PrefixSlot>]>,
    iids: Box<[IidSlot]>,
    prefixes_in_use: AtomicUsize,
}

impl SlotPool {
    /// Create new pool with the engine's table sizes
    pub fn new(prefix_num: u32, iid_num: u16) -> Self {
        let prefixes = (0..prefix_num)
            .map(|i| RankedMutex::new(LockRank::PrefixSlot, PrefixSlot::new(i)))
            .collect();
        let iids = (0..iid_num).map(IidSlot::new).collect();

        tracing::debug!(prefix_num, iid_num, "slot pool allocated");

        Self {
            prefixes,
            iids,
            prefixes_in_use: AtomicUsize::new(0),
        }
    }

    /// Prefix slot by index
    pub fn prefix(&self, index: u32) -> Result<&RankedMutex<PrefixSlot>> {
        self.prefixes
            .get(index as usize)
            .ok_or(AccelError::PrefixIndexOutOfRange(index))
    }

    /// IID slot by index
    pub fn iid(&self, index: u16) -> Result<&IidSlot> {
        self.iids
            .get(index as usize)
            .ok_or(AccelError::IidIndexOutOfRange(u32::from(index)))
    }

    /// Prefix table size
    pub fn prefix_capacity(&self) -> u32 {
        self.prefixes.len() as u32
    }

    /// IID table size
    pub fn iid_capacity(&self) -> u16 {
        self.iids.len() as u16
    }

    /// Prefix slots with a nonzero refcount
    pub fn prefixes_in_use(&self) -> usize {
        self.prefixes_in_use.load(Ordering::Relaxed)
    }

    /// IID slots with at least one direction programmed
    pub fn iids_in_use(&self) -> usize {
        self.iids.iter().filter(|s| !s.is_free()).count()
    }

    pub(crate) fn note_prefix_installed(&self) {
        self.prefixes_in_use.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_prefix_freed(&self) {
        self.prefixes_in_use.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("prefix_capacity", &self.prefix_capacity())
            .field("iid_capacity", &self.iid_capacity())
            .field("prefixes_in_use", &self.prefixes_in_use())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_bounds() {
        let pool = SlotPool::new(4, 8);
        assert_eq!(pool.prefix_capacity(), 4);
        assert_eq!(pool.iid_capacity(), 8);

        assert!(pool.prefix(3).is_ok());
        assert!(matches!(
            pool.prefix(4),
            Err(AccelError::PrefixIndexOutOfRange(4))
        ));
        assert!(matches!(pool.iid(8), Err(AccelError::IidIndexOutOfRange(8))));
    }

    #[test]
    fn test_prefix_slot_refcount() {
        let pool = SlotPool::new(2, 2);
        let mut slot = pool.prefix(1).unwrap().lock();
        assert!(slot.is_free());

        slot.init(Ipv6Addr::LOCALHOST, 48);
        slot.get();
        assert_eq!(slot.refcount(), 2);
        assert_eq!(slot.installed(), Some((Ipv6Addr::LOCALHOST, 48)));

        assert!(!slot.put());
        assert!(slot.put());
        assert!(slot.is_free());
        assert_eq!(slot.installed(), None);
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn test_prefix_slot_underflow_panics() {
        let pool = SlotPool::new(1, 1);
        pool.prefix(0).unwrap().lock().put();
    }

    #[test]
    fn test_iid_slot_directions() {
        let pool = SlotPool::new(1, 4);
        let slot = pool.iid(2).unwrap();

        assert_eq!(slot.mark(IID_FORWARD), 0);
        assert_eq!(slot.mark(IID_REVERSE), IID_FORWARD);
        assert_eq!(pool.iids_in_use(), 1);

        slot.clear(IID_FORWARD);
        assert!(!slot.is_free());
        slot.clear(IID_REVERSE);
        assert!(slot.is_free());
    }
}
