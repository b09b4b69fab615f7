//! Node allocation bitmap.
//!
//! Bit `n` is set when node `n` is in use. Bits 0..2048 live in the header
//! node's map record; each map node chained from the header's forward link
//! covers the next 3952 nodes. Allocation is first-fit from bit 0.
//!
//! Everything here runs with the tree's allocation lock held. Header and map
//! buffers are modified without node latches.

use super::constants::{HEADER_MAP_BITS, HEADER_MAP_RECORD, MAP_NODE_BITS, MAP_NODE_RECORD_SIZE};
use super::records::insert_record;
use super::tree::BTree;
use crate::bits::{clear_bit, count_ones, find_first_zero, set_bit, test_bit};
use bstar_cache::{LockMode, NodeRef};
use bstar_common::{BStarError, NodeKind, Result};
use tracing::debug;

/// Where a node's allocation bit lives.
enum MapRegion {
    /// The header's map record.
    Header,
    /// A map node.
    Node(NodeRef),
}

impl MapRegion {
    fn node(&self) -> Option<&NodeRef> {
        match self {
            MapRegion::Header => None,
            MapRegion::Node(node) => Some(node),
        }
    }
}

/// Nodes of the tree's free count promised to one operation.
///
/// Unused budget is returned when the reservation is dropped.
#[derive(Debug)]
pub(crate) struct Reservation<'t> {
    tree: &'t BTree,
    remaining: u32,
}

impl Reservation<'_> {
    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.remaining > 0 {
            let mut meta = self.tree.meta.lock();
            meta.reserved = meta.reserved.saturating_sub(self.remaining);
        }
    }
}

impl BTree {
    // =========================================================================
    // Reservations
    // =========================================================================

    /// Claims `budget` free nodes, or returns None if fewer are unclaimed.
    pub(crate) fn reserve(&self, budget: u32) -> Option<Reservation<'_>> {
        let mut meta = self.meta.lock();
        let available = meta.header.free_nodes.saturating_sub(meta.reserved);
        if available < budget {
            return None;
        }
        meta.reserved += budget;
        Some(Reservation {
            tree: self,
            remaining: budget,
        })
    }

    /// Allocates a node out of `res` and creates it in the cache, latched
    /// for writing.
    pub(crate) fn new_node(
        &self,
        res: &mut Reservation<'_>,
        kind: NodeKind,
        height: u8,
    ) -> Result<NodeRef> {
        if res.remaining() == 0 {
            return Err(BStarError::Internal(
                "node reservation exhausted".to_string(),
            ));
        }
        let num = {
            let _alloc = self.alloc.lock();
            let num = self.allocate_locked()?;
            self.update_meta(|meta| {
                meta.header.free_nodes -= 1;
                meta.reserved = meta.reserved.saturating_sub(1);
            });
            num
        };
        res.remaining -= 1;
        self.cache.create(num, kind, height)
    }

    /// Returns a node to the allocator. The cached copy is discarded.
    pub(crate) fn free_node(&self, node: &NodeRef) -> Result<()> {
        node.mark_freed();
        let _alloc = self.alloc.lock();
        self.bitop(node.num(), false)?;
        self.update_meta(|meta| meta.header.free_nodes += 1);
        Ok(())
    }

    // =========================================================================
    // Bit operations
    // =========================================================================

    /// Finds the first clear bit, sets it and returns its node number.
    ///
    /// Leaves the free count alone. A full bitmap with free nodes counted
    /// is reported as corruption.
    pub(crate) fn allocate_locked(&self) -> Result<u32> {
        let total = self.total_nodes();

        let limit = total.min(HEADER_MAP_BITS) as usize;
        let found = {
            let mut buf = self.header.write();
            let map = buf.record_mut(HEADER_MAP_RECORD);
            let bit = find_first_zero(map, limit, 0);
            if bit < limit {
                set_bit(map, bit);
                Some(bit as u32)
            } else {
                None
            }
        };
        if let Some(num) = found {
            self.header.commit();
            return Ok(num);
        }

        let mut base = HEADER_MAP_BITS;
        let mut next = self.header.read().flink();
        let mut hops = 0u32;
        while base < total {
            if next == 0 {
                return Err(BStarError::TooFewMapNodes);
            }
            let node = self.fetch_map_node(next)?;
            let limit = (total - base).min(MAP_NODE_BITS) as usize;
            let found = {
                let mut buf = node.write();
                let map = buf.record_mut(0);
                let bit = find_first_zero(map, limit, 0);
                if bit < limit {
                    set_bit(map, bit);
                    Some(base + bit as u32)
                } else {
                    None
                }
            };
            if let Some(num) = found {
                node.commit();
                return Ok(num);
            }
            next = node.read().flink();
            base += MAP_NODE_BITS;
            hops += 1;
            if hops > total {
                return Err(BStarError::corrupted("map node chain does not end"));
            }
        }
        Err(BStarError::corrupted(format!(
            "bitmap is full but {} nodes are counted free",
            self.meta.lock().header.free_nodes
        )))
    }

    /// Sets or clears the bit of node `num`.
    pub(crate) fn bitop(&self, num: u32, set: bool) -> Result<()> {
        let total = self.total_nodes();
        if num >= total {
            return Err(BStarError::NodeOutOfRange { node: num, count: total });
        }
        let (region, bit) = self.locate_bit(num)?;
        let changed = {
            let mut guard = match region.node() {
                Some(node) => node.write(),
                None => self.header.write(),
            };
            let map = match region {
                MapRegion::Header => guard.record_mut(HEADER_MAP_RECORD),
                MapRegion::Node(_) => guard.record_mut(0),
            };
            if test_bit(map, bit) == set {
                false
            } else {
                if set {
                    set_bit(map, bit);
                } else {
                    clear_bit(map, bit);
                }
                true
            }
        };
        if !changed {
            tracing::warn!(node = num, set, "allocation bit already in requested state");
            return Err(BStarError::BitmapCorrupted { node: num, set });
        }
        match region.node() {
            Some(node) => node.commit(),
            None => self.header.commit(),
        }
        Ok(())
    }

    /// Returns whether node `num` is marked in use.
    pub(crate) fn is_allocated(&self, num: u32) -> Result<bool> {
        let total = self.total_nodes();
        if num >= total {
            return Err(BStarError::NodeOutOfRange { node: num, count: total });
        }
        let (region, bit) = self.locate_bit(num)?;
        let allocated = match region {
            MapRegion::Header => test_bit(self.header.read().record(HEADER_MAP_RECORD), bit),
            MapRegion::Node(node) => test_bit(node.read().record(0), bit),
        };
        Ok(allocated)
    }

    /// Counts the set bits over every node backed by storage.
    pub(crate) fn count_allocated(&self) -> Result<u32> {
        let total = self.total_nodes();
        let limit = total.min(HEADER_MAP_BITS) as usize;
        let mut count = count_ones(self.header.read().record(HEADER_MAP_RECORD), limit) as u32;

        let mut base = HEADER_MAP_BITS;
        let mut next = self.header.read().flink();
        while base < total {
            if next == 0 {
                return Err(BStarError::TooFewMapNodes);
            }
            let node = self.fetch_map_node(next)?;
            let limit = (total - base).min(MAP_NODE_BITS) as usize;
            count += count_ones(node.read().record(0), limit) as u32;
            next = node.read().flink();
            base += MAP_NODE_BITS;
        }
        Ok(count)
    }

    /// Finds the map region holding node `num`'s bit and the bit's index
    /// within it.
    fn locate_bit(&self, num: u32) -> Result<(MapRegion, usize)> {
        if num < HEADER_MAP_BITS {
            return Ok((MapRegion::Header, num as usize));
        }
        let index = (num - HEADER_MAP_BITS) / MAP_NODE_BITS;
        let bit = ((num - HEADER_MAP_BITS) % MAP_NODE_BITS) as usize;
        let mut next = self.header.read().flink();
        for _ in 0..index {
            if next == 0 {
                return Err(BStarError::TooFewMapNodes);
            }
            let node = self.fetch_map_node(next)?;
            next = node.read().flink();
        }
        if next == 0 {
            return Err(BStarError::TooFewMapNodes);
        }
        Ok((MapRegion::Node(self.fetch_map_node(next)?), bit))
    }

    fn fetch_map_node(&self, num: u32) -> Result<NodeRef> {
        let node = self.fetch(num, LockMode::None)?;
        {
            let buf = node.read();
            if buf.kind() != NodeKind::Map
                || buf.num_records() != 1
                || buf.record_size(0) != MAP_NODE_RECORD_SIZE
            {
                tracing::warn!(node = num, kind = %buf.kind(), "malformed map node");
                return Err(BStarError::NodeCorrupted {
                    node: num,
                    reason: "not a map node".to_string(),
                });
            }
        }
        Ok(node)
    }

    // =========================================================================
    // Growth
    // =========================================================================

    /// Grows storage by one clump, adding map nodes as needed, and writes
    /// the alternate header.
    pub(crate) fn extend_storage(&self) -> Result<()> {
        let _alloc = self.alloc.lock();
        let old = self.total_nodes();
        let new = self.cache.device().extend(self.config.clump_nodes)?;
        if new <= old {
            debug!(total_nodes = old, "storage cannot grow");
            return Err(BStarError::NoSpace);
        }
        self.update_meta(|meta| {
            meta.header.total_nodes = new;
            meta.header.free_nodes += new - old;
        });
        self.ensure_map_coverage()?;
        self.write_alternate()?;
        debug!(from = old, to = new, "extended node storage");
        Ok(())
    }

    /// Appends map nodes until the bitmap covers every node.
    ///
    /// A new map node takes the first number it covers and marks itself in
    /// use.
    pub(crate) fn ensure_map_coverage(&self) -> Result<()> {
        let total = self.total_nodes();
        let mut coverage = HEADER_MAP_BITS;
        let mut last: Option<NodeRef> = None;
        let mut next = self.header.read().flink();
        while next != 0 {
            let node = self.fetch_map_node(next)?;
            next = node.read().flink();
            coverage += MAP_NODE_BITS;
            last = Some(node);
            if coverage > total.saturating_add(MAP_NODE_BITS) {
                return Err(BStarError::corrupted("map node chain does not end"));
            }
        }

        while coverage < total {
            let num = coverage;
            let mut node = self.cache.create(num, NodeKind::Map, 0)?;
            {
                let mut buf = node.write();
                let mut map = vec![0u8; MAP_NODE_RECORD_SIZE];
                set_bit(&mut map, 0);
                if !insert_record(&mut buf, 0, &map) {
                    return Err(BStarError::Internal("map record does not fit".to_string()));
                }
            }
            node.commit();
            node.relock(LockMode::None);

            match &last {
                Some(prev) => {
                    prev.write().set_flink(num);
                    prev.commit();
                }
                None => {
                    self.header.write().set_flink(num);
                    self.header.commit();
                }
            }
            self.update_meta(|meta| meta.header.free_nodes -= 1);
            debug!(node = num, covers_from = coverage, "added map node");

            coverage += MAP_NODE_BITS;
            last = Some(node);
        }
        Ok(())
    }

    /// Checks the map chain on open: every link is a map node, the chain
    /// has no cycle and covers every node.
    pub(crate) fn check_map_chain(&self) -> Result<()> {
        let total = self.total_nodes();
        let mut coverage = HEADER_MAP_BITS;
        let mut seen = Vec::new();
        let mut next = self.header.read().flink();
        while next != 0 {
            if seen.contains(&next) {
                return Err(BStarError::corrupted(format!(
                    "map node chain revisits node {}",
                    next
                )));
            }
            seen.push(next);
            let node = self.fetch_map_node(next)?;
            next = node.read().flink();
            coverage = coverage.saturating_add(MAP_NODE_BITS);
        }
        if coverage < total {
            return Err(BStarError::TooFewMapNodes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::memory::MemDevice;
    use crate::BTree;
    use bstar_common::{BStarError, NodeKind, TreeConfig};
    use std::sync::Arc;

    fn config(initial: u32, clump: u32) -> TreeConfig {
        TreeConfig {
            key_len: 8,
            clump_nodes: clump,
            initial_nodes: initial,
            write_alternate: true,
        }
    }

    #[test]
    fn test_first_fit_allocation() {
        let tree = BTree::create(Arc::new(MemDevice::new()), config(8, 8)).unwrap();
        let mut res = tree.reserve(3).unwrap();
        let a = tree.new_node(&mut res, NodeKind::Leaf, 1).unwrap();
        let b = tree.new_node(&mut res, NodeKind::Leaf, 1).unwrap();
        assert_eq!(a.num(), 1);
        assert_eq!(b.num(), 2);
        assert_eq!(res.remaining(), 1);
        assert_eq!(tree.stats().free_nodes, 5);

        tree.free_node(&a).unwrap();
        drop(a);
        assert_eq!(tree.stats().free_nodes, 6);
        assert!(!tree.is_allocated(1).unwrap());

        // the lowest clear bit is reused
        let c = tree.new_node(&mut res, NodeKind::Leaf, 1).unwrap();
        assert_eq!(c.num(), 1);
    }

    #[test]
    fn test_reservation_returned_on_drop() {
        let tree = BTree::create(Arc::new(MemDevice::new()), config(8, 8)).unwrap();
        {
            let _res = tree.reserve(7).unwrap();
            assert!(tree.reserve(1).is_none());
        }
        assert!(tree.reserve(7).is_some());
        assert!(tree.reserve(8).is_none());
    }

    #[test]
    fn test_exhausted_reservation() {
        let tree = BTree::create(Arc::new(MemDevice::new()), config(8, 8)).unwrap();
        let mut res = tree.reserve(0).unwrap();
        assert!(matches!(
            tree.new_node(&mut res, NodeKind::Leaf, 1),
            Err(BStarError::Internal(_))
        ));
    }

    #[test]
    fn test_bitop_rejects_repeat() {
        let tree = BTree::create(Arc::new(MemDevice::new()), config(8, 8)).unwrap();
        let _alloc = tree.alloc.lock();
        tree.bitop(3, true).unwrap();
        assert!(matches!(
            tree.bitop(3, true),
            Err(BStarError::BitmapCorrupted { node: 3, set: true })
        ));
        tree.bitop(3, false).unwrap();
        assert!(matches!(
            tree.bitop(3, false),
            Err(BStarError::BitmapCorrupted { node: 3, set: false })
        ));
        assert!(matches!(
            tree.bitop(8, true),
            Err(BStarError::NodeOutOfRange { node: 8, count: 8 })
        ));
    }

    #[test]
    fn test_extend_storage() {
        let device = Arc::new(MemDevice::new());
        let tree = BTree::create(device.clone(), config(4, 6)).unwrap();
        let before = device.alternate_writes();
        tree.extend_storage().unwrap();
        let stats = tree.stats();
        assert_eq!(stats.total_nodes, 10);
        assert_eq!(stats.free_nodes, 9);
        assert_eq!(device.alternate_writes(), before + 1);
    }

    #[test]
    fn test_extend_at_limit() {
        let device = Arc::new(MemDevice::with_limit(4));
        let tree = BTree::create(device, config(4, 6)).unwrap();
        assert!(matches!(tree.extend_storage(), Err(BStarError::NoSpace)));
        assert_eq!(tree.stats().total_nodes, 4);
    }

    #[test]
    fn test_map_nodes_added_past_header_coverage() {
        let device = Arc::new(MemDevice::new());
        let tree = BTree::create(device.clone(), config(2040, 16)).unwrap();
        assert_eq!(tree.header.read().flink(), 0);

        tree.extend_storage().unwrap();
        // 2056 nodes need one map node, placed at the first uncovered number
        assert_eq!(tree.header.read().flink(), 2048);
        assert!(tree.is_allocated(2048).unwrap());
        let stats = tree.stats();
        assert_eq!(stats.total_nodes, 2056);
        assert_eq!(stats.free_nodes, 2056 - 2);
        assert_eq!(tree.count_allocated().unwrap(), 2);

        tree.check_map_chain().unwrap();
        tree.close().unwrap();
        let tree = BTree::open(device, config(2040, 16)).unwrap();
        assert!(tree.is_allocated(2048).unwrap());
    }

    #[test]
    fn test_allocation_spills_into_map_node() {
        let device = Arc::new(MemDevice::new());
        let tree = BTree::create(device, config(2040, 16)).unwrap();
        tree.extend_storage().unwrap();
        {
            let _alloc = tree.alloc.lock();
            for num in 1..2048 {
                tree.bitop(num, true).unwrap();
            }
            assert_eq!(tree.allocate_locked().unwrap(), 2049);
        }
    }
}
