//! Node cache.

use crate::latch::LockMode;
use crate::node::CachedNode;
use bstar_common::{BStarError, NodeBuf, NodeDevice, NodeKind, Result};
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Cache of nodes keyed by node number.
///
/// A node stays resident while at least one [`NodeRef`] points at it or it
/// is sticky. When the last reference goes away the node is written back if
/// dirty and evicted.
pub struct NodeCache {
    /// Storage the nodes are read from and written back to.
    device: Arc<dyn NodeDevice>,
    /// Resident nodes.
    table: Mutex<HashMap<u32, Arc<CachedNode>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    writebacks: AtomicU64,
}

impl NodeCache {
    /// Creates an empty cache over `device`.
    pub fn new(device: Arc<dyn NodeDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            table: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writebacks: AtomicU64::new(0),
        })
    }

    /// Returns the underlying device.
    pub fn device(&self) -> &Arc<dyn NodeDevice> {
        &self.device
    }

    /// Number of resident nodes.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Returns true if `num` is resident.
    pub fn contains(&self, num: u32) -> bool {
        self.table.lock().contains_key(&num)
    }

    /// Looks up a node, reading it through from the device on a miss, and
    /// latches it in `mode`.
    ///
    /// A sector whose offset table fails validation is never cached and is
    /// reported as [`BStarError::NodeCorrupted`].
    pub fn find(self: &Arc<Self>, num: u32, mode: LockMode) -> Result<NodeRef> {
        let node = {
            let mut table = self.table.lock();
            match table.get(&num) {
                Some(node) if node.is_freed() => {
                    warn!(node = num, "lookup of a node that has been freed");
                    return Err(BStarError::corrupted(format!("node {} is free", num)));
                }
                Some(node) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    node.add_ref();
                    Arc::clone(node)
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let data = self.device.read_node(num)?;
                    let buf = NodeBuf::from_bytes(data).map_err(|reason| {
                        warn!(node = num, %reason, "rejecting corrupted node");
                        BStarError::NodeCorrupted { node: num, reason }
                    })?;
                    let node = Arc::new(CachedNode::new(num, buf, false));
                    node.add_ref();
                    table.insert(num, Arc::clone(&node));
                    node
                }
            }
        };

        node.latch().acquire(mode);
        Ok(NodeRef {
            cache: Arc::clone(self),
            node,
            mode,
        })
    }

    /// Creates a fresh empty node in the cache, latched for writing.
    ///
    /// The caller must already own `num` in the allocation bitmap. A freed
    /// slot for the same number is replaced.
    pub fn create(self: &Arc<Self>, num: u32, kind: NodeKind, height: u8) -> Result<NodeRef> {
        let node = {
            let mut table = self.table.lock();
            if let Some(existing) = table.get(&num) {
                if !existing.is_freed() && existing.ref_count() > 0 {
                    return Err(BStarError::corrupted(format!(
                        "allocated node {} is still in use",
                        num
                    )));
                }
            }
            let node = Arc::new(CachedNode::new(num, NodeBuf::new(kind, height), true));
            node.add_ref();
            table.insert(num, Arc::clone(&node));
            node
        };

        node.latch().acquire(LockMode::Write);
        Ok(NodeRef {
            cache: Arc::clone(self),
            node,
            mode: LockMode::Write,
        })
    }

    /// Adds a reference to an already referenced node and latches it.
    fn reference(self: &Arc<Self>, node: &Arc<CachedNode>, mode: LockMode) -> NodeRef {
        {
            let _table = self.table.lock();
            node.add_ref();
        }
        node.latch().acquire(mode);
        NodeRef {
            cache: Arc::clone(self),
            node: Arc::clone(node),
            mode,
        }
    }

    /// Drops one reference. Evicts the node once nothing refers to it and
    /// it is not sticky.
    fn release(&self, node: &Arc<CachedNode>, mode: LockMode) {
        node.latch().release(mode);

        let mut table = self.table.lock();
        if node.drop_ref() == 0 && !node.is_sticky() {
            self.evict_locked(&mut table, node);
        }
    }

    /// Removes an unreferenced node from the table, writing it back first if
    /// dirty. A failed write-back leaves the node cached and dirty.
    fn evict_locked(&self, table: &mut HashMap<u32, Arc<CachedNode>>, node: &Arc<CachedNode>) {
        let current = match table.get(&node.num()) {
            Some(current) if Arc::ptr_eq(current, node) => current,
            // replaced by a newer slot for the same number
            _ => return,
        };
        if current.is_dirty() && !current.is_freed() {
            let result = {
                let buf = current.read_buf();
                self.device.write_node(current.num(), buf.as_bytes())
            };
            match result {
                Ok(()) => {
                    current.set_dirty(false);
                    self.writebacks.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!(node = node.num(), error = %e, "write-back on release failed");
                    return;
                }
            }
        }
        table.remove(&node.num());
    }

    /// Keeps a node resident regardless of its reference count.
    pub fn stick(&self, node: &NodeRef) {
        let _table = self.table.lock();
        node.node.set_sticky(true);
    }

    /// Clears the sticky flag. An unreferenced node is evicted.
    pub fn unstick(&self, node: &Arc<CachedNode>) {
        let mut table = self.table.lock();
        node.set_sticky(false);
        if node.ref_count() == 0 {
            self.evict_locked(&mut table, node);
        }
    }

    /// Writes every dirty resident node to the device and syncs it.
    ///
    /// Returns the number of nodes written.
    pub fn flush(&self) -> Result<usize> {
        let dirty: Vec<Arc<CachedNode>> = {
            let table = self.table.lock();
            table
                .values()
                .filter(|n| n.is_dirty() && !n.is_freed())
                .cloned()
                .collect()
        };

        let mut written = 0;
        for node in dirty {
            if !node.take_dirty() {
                continue;
            }
            let result = {
                let buf = node.read_buf();
                self.device.write_node(node.num(), buf.as_bytes())
            };
            if let Err(e) = result {
                node.set_dirty(true);
                return Err(e);
            }
            written += 1;
        }
        self.device.sync()?;
        self.writebacks.fetch_add(written as u64, Ordering::Relaxed);
        debug!(written, "flushed node cache");
        Ok(written)
    }

    /// Returns statistics about the cache.
    pub fn stats(&self) -> CacheStats {
        let table = self.table.lock();
        let mut stats = CacheStats {
            resident: table.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
            ..Default::default()
        };
        for node in table.values() {
            if node.ref_count() > 0 {
                stats.referenced += 1;
            }
            if node.is_dirty() {
                stats.dirty += 1;
            }
            if node.is_sticky() {
                stats.sticky += 1;
            }
        }
        stats
    }
}

/// Statistics about the node cache.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Nodes currently in the table.
    pub resident: usize,
    /// Nodes with at least one live reference.
    pub referenced: usize,
    /// Nodes modified since their last write.
    pub dirty: usize,
    /// Sticky nodes (header, root).
    pub sticky: usize,
    /// Lookups served from the table.
    pub hits: u64,
    /// Lookups that read through to the device.
    pub misses: u64,
    /// Nodes written back by release or flush.
    pub writebacks: u64,
}

/// A counted reference to a cached node together with the latch mode it
/// holds. Dropping the reference releases the latch.
pub struct NodeRef {
    cache: Arc<NodeCache>,
    node: Arc<CachedNode>,
    mode: LockMode,
}

impl NodeRef {
    #[inline]
    pub fn num(&self) -> u32 {
        self.node.num()
    }

    #[inline]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Returns the cached slot.
    pub fn cached(&self) -> &Arc<CachedNode> {
        &self.node
    }

    /// Borrows the node contents.
    pub fn read(&self) -> RwLockReadGuard<'_, NodeBuf> {
        self.node.read_buf()
    }

    /// Borrows the node contents for modification.
    ///
    /// Tree nodes are only modified under a Write latch. Header and map
    /// nodes are modified under the tree's allocation lock instead.
    pub fn write(&self) -> RwLockWriteGuard<'_, NodeBuf> {
        self.node.write_buf()
    }

    /// Writes the descriptor back into the sector and marks the node dirty.
    ///
    /// Must not be called while a guard from [`NodeRef::write`] is alive.
    pub fn commit(&self) {
        self.node.write_buf().sync_descriptor();
        self.node.set_dirty(true);
    }

    /// Changes the held latch mode, blocking as needed.
    pub fn relock(&mut self, mode: LockMode) {
        self.node.latch().transition(self.mode, mode);
        self.mode = mode;
    }

    /// Takes another, unlatched reference to the same node.
    pub fn share(&self) -> NodeRef {
        self.cache.reference(&self.node, LockMode::None)
    }

    /// Marks the node as returned to the allocator. It will not be written
    /// back and is evicted once its last reference is released.
    pub fn mark_freed(&self) {
        self.node.set_freed();
    }

    #[inline]
    pub fn is_freed(&self) -> bool {
        self.node.is_freed()
    }

    /// Releases the reference now.
    pub fn release(self) {
        drop(self);
    }

    /// Returns true if both references point at the same cached slot.
    pub fn same_node(&self, other: &NodeRef) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        self.cache.release(&self.node, self.mode);
    }
}

impl std::fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRef")
            .field("num", &self.num())
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bstar_common::NODE_SIZE;

    /// Minimal in-memory device for cache tests.
    struct VecDevice {
        nodes: Mutex<Vec<Box<[u8; NODE_SIZE]>>>,
        writes: AtomicU64,
        fail_writes: std::sync::atomic::AtomicBool,
    }

    impl VecDevice {
        fn new(count: u32) -> Arc<Self> {
            let nodes = (0..count)
                .map(|_| Box::new(*NodeBuf::new(NodeKind::Leaf, 1).as_bytes()))
                .collect();
            Arc::new(Self {
                nodes: Mutex::new(nodes),
                writes: AtomicU64::new(0),
                fail_writes: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    impl NodeDevice for VecDevice {
        fn read_node(&self, num: u32) -> Result<Box<[u8; NODE_SIZE]>> {
            let nodes = self.nodes.lock();
            nodes
                .get(num as usize)
                .cloned()
                .ok_or(BStarError::NodeOutOfRange { node: num, count: nodes.len() as u32 })
        }

        fn write_node(&self, num: u32, data: &[u8; NODE_SIZE]) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(BStarError::IoError("injected".to_string()));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.nodes.lock()[num as usize] = Box::new(*data);
            Ok(())
        }

        fn node_count(&self) -> u32 {
            self.nodes.lock().len() as u32
        }

        fn extend(&self, _additional: u32) -> Result<u32> {
            Ok(self.node_count())
        }

        fn write_alternate(&self, _data: &[u8; NODE_SIZE]) -> Result<()> {
            Ok(())
        }

        fn read_alternate(&self) -> Result<Option<Box<[u8; NODE_SIZE]>>> {
            Ok(None)
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }

    fn create_test_cache(count: u32) -> (Arc<VecDevice>, Arc<NodeCache>) {
        let device = VecDevice::new(count);
        let cache = NodeCache::new(device.clone());
        (device, cache)
    }

    #[test]
    fn test_find_reads_through_and_evicts() {
        let (_device, cache) = create_test_cache(4);

        let node = cache.find(2, LockMode::Read).unwrap();
        assert_eq!(node.num(), 2);
        assert_eq!(node.read().kind(), NodeKind::Leaf);
        assert!(cache.contains(2));

        drop(node);
        assert!(!cache.contains(2));
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_find_hit_shares_slot() {
        let (_device, cache) = create_test_cache(4);
        let a = cache.find(1, LockMode::Read).unwrap();
        let b = cache.find(1, LockMode::Read).unwrap();
        assert!(a.same_node(&b));
        assert_eq!(a.cached().ref_count(), 2);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_find_out_of_range() {
        let (_device, cache) = create_test_cache(2);
        assert!(matches!(
            cache.find(5, LockMode::Read),
            Err(BStarError::NodeOutOfRange { node: 5, .. })
        ));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_find_rejects_corrupt_node() {
        let (device, cache) = create_test_cache(3);
        let mut bad = NodeBuf::new(NodeKind::Leaf, 1);
        bad.set_offset(0, 100);
        device.nodes.lock()[1] = Box::new(*bad.as_bytes());

        let err = cache.find(1, LockMode::Read).unwrap_err();
        assert!(matches!(err, BStarError::NodeCorrupted { node: 1, .. }));
        assert!(!cache.contains(1));
    }

    #[test]
    fn test_dirty_node_written_back_on_release() {
        let (device, cache) = create_test_cache(4);
        {
            let node = cache.find(3, LockMode::Write).unwrap();
            node.write().set_flink(2);
            node.commit();
        }
        assert_eq!(device.writes.load(Ordering::SeqCst), 1);
        let node = cache.find(3, LockMode::Read).unwrap();
        assert_eq!(node.read().flink(), 2);
    }

    #[test]
    fn test_failed_write_back_keeps_node() {
        let (device, cache) = create_test_cache(4);
        device.fail_writes.store(true, Ordering::SeqCst);
        {
            let node = cache.find(1, LockMode::Write).unwrap();
            node.write().set_blink(3);
            node.commit();
        }
        assert!(cache.contains(1));
        assert_eq!(cache.stats().dirty, 1);

        device.fail_writes.store(false, Ordering::SeqCst);
        assert_eq!(cache.flush().unwrap(), 1);
        assert_eq!(cache.stats().dirty, 0);
    }

    #[test]
    fn test_sticky_node_stays_resident() {
        let (_device, cache) = create_test_cache(4);
        let node = cache.find(0, LockMode::None).unwrap();
        cache.stick(&node);
        let slot = Arc::clone(node.cached());
        drop(node);
        assert!(cache.contains(0));
        assert_eq!(cache.stats().sticky, 1);

        cache.unstick(&slot);
        assert!(!cache.contains(0));
    }

    #[test]
    fn test_create_and_free() {
        let (device, cache) = create_test_cache(4);
        let node = cache.create(2, NodeKind::Index, 2).unwrap();
        assert_eq!(node.mode(), LockMode::Write);
        assert_eq!(node.read().kind(), NodeKind::Index);

        // second create while referenced is rejected
        assert!(cache.create(2, NodeKind::Leaf, 1).is_err());

        node.mark_freed();
        assert!(matches!(
            cache.find(2, LockMode::Read),
            Err(BStarError::TreeCorrupted(_))
        ));
        drop(node);
        assert!(!cache.contains(2));
        // freed nodes are never written back
        assert_eq!(device.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_create_replaces_freed_slot() {
        let (_device, cache) = create_test_cache(4);
        let old = cache.create(1, NodeKind::Leaf, 1).unwrap();
        old.mark_freed();

        let new = cache.create(1, NodeKind::Index, 2).unwrap();
        assert!(!new.same_node(&old));
        drop(old);
        // releasing the stale slot must not evict its replacement
        assert!(cache.contains(1));
        assert_eq!(new.read().kind(), NodeKind::Index);
    }

    #[test]
    fn test_relock_and_share() {
        let (_device, cache) = create_test_cache(4);
        let mut node = cache.find(1, LockMode::Reserve).unwrap();
        let mut reader = node.share();
        reader.relock(LockMode::Read);
        assert_eq!(node.cached().latch().snapshot().readers, 1);
        drop(reader);

        node.relock(LockMode::Write);
        assert!(node.cached().latch().snapshot().exclusive);
        let shared = node.share();
        assert_eq!(shared.mode(), LockMode::None);
        node.relock(LockMode::None);
        assert!(!node.cached().latch().snapshot().reserved);
    }

    #[test]
    fn test_flush_writes_dirty_nodes() {
        let (device, cache) = create_test_cache(4);
        let a = cache.find(1, LockMode::Write).unwrap();
        let b = cache.find(2, LockMode::Write).unwrap();
        a.commit();
        b.commit();
        assert_eq!(cache.flush().unwrap(), 2);
        assert_eq!(device.writes.load(Ordering::SeqCst), 2);
        assert_eq!(cache.flush().unwrap(), 0);
    }
}
