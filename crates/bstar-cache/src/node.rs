//! Cached node slot.

use crate::latch::NodeLatch;
use bstar_common::NodeBuf;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// One node resident in the cache.
///
/// The latch implements the tree's lock protocol. The buffer's own RwLock
/// only protects memory; tree code decides who may modify a node through
/// the latch.
pub struct CachedNode {
    /// Node number on the device.
    num: u32,
    /// Read / Reserve / Write latch.
    latch: NodeLatch,
    /// Node contents.
    buf: RwLock<NodeBuf>,
    /// Number of live references. Modified under the cache table lock.
    refs: AtomicU32,
    /// Kept resident even when unreferenced (header, current root).
    sticky: AtomicBool,
    /// Modified since last written to the device.
    dirty: AtomicBool,
    /// Returned to the allocator. Never written back.
    freed: AtomicBool,
}

impl CachedNode {
    pub(crate) fn new(num: u32, buf: NodeBuf, dirty: bool) -> Self {
        Self {
            num,
            latch: NodeLatch::new(),
            buf: RwLock::new(buf),
            refs: AtomicU32::new(0),
            sticky: AtomicBool::new(false),
            dirty: AtomicBool::new(dirty),
            freed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn num(&self) -> u32 {
        self.num
    }

    #[inline]
    pub fn latch(&self) -> &NodeLatch {
        &self.latch
    }

    #[inline]
    pub fn read_buf(&self) -> RwLockReadGuard<'_, NodeBuf> {
        self.buf.read()
    }

    #[inline]
    pub fn write_buf(&self) -> RwLockWriteGuard<'_, NodeBuf> {
        self.buf.write()
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn add_ref(&self) -> u32 {
        self.refs.fetch_add(1, Ordering::AcqRel)
    }

    /// Drops one reference and returns the remaining count.
    pub(crate) fn drop_ref(&self) -> u32 {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("node {} released more times than it was referenced", self.num);
        }
        prev - 1
    }

    #[inline]
    pub fn is_sticky(&self) -> bool {
        self.sticky.load(Ordering::Acquire)
    }

    pub(crate) fn set_sticky(&self, sticky: bool) {
        self.sticky.store(sticky, Ordering::Release);
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    /// Clears the dirty flag and returns its previous value.
    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    pub(crate) fn set_freed(&self) {
        self.freed.store(true, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for CachedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedNode")
            .field("num", &self.num)
            .field("refs", &self.ref_count())
            .field("sticky", &self.is_sticky())
            .field("dirty", &self.is_dirty())
            .field("freed", &self.is_freed())
            .finish()
    }
}
