//! In-memory node device.

use bstar_common::{BStarError, NodeDevice, Result, NODE_SIZE};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

/// Node storage held entirely in RAM.
///
/// Node numbers map directly to Vec indices. Used for tests and trees that
/// do not outlive the process.
pub struct MemDevice {
    /// Nodes stored by node number (index = node number).
    nodes: RwLock<Vec<Box<[u8; NODE_SIZE]>>>,
    /// Backup header.
    alternate: Mutex<Option<Box<[u8; NODE_SIZE]>>>,
    /// Growth ceiling.
    max_nodes: u32,
    reads: AtomicU64,
    writes: AtomicU64,
    alternate_writes: AtomicU64,
}

impl MemDevice {
    /// Creates an empty device with no growth limit.
    pub fn new() -> Self {
        Self::with_limit(u32::MAX)
    }

    /// Creates an empty device that refuses to grow past `max_nodes`.
    pub fn with_limit(max_nodes: u32) -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            alternate: Mutex::new(None),
            max_nodes,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            alternate_writes: AtomicU64::new(0),
        }
    }

    /// Number of node reads served.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of node writes accepted.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of backup header writes.
    pub fn alternate_writes(&self) -> u64 {
        self.alternate_writes.load(Ordering::Relaxed)
    }

    /// Overwrites a stored node directly, bypassing any cache. Meant for
    /// corrupting a tree on purpose in tests.
    pub fn poke(&self, num: u32, data: &[u8; NODE_SIZE]) -> Result<()> {
        let mut nodes = self.nodes.write();
        let count = nodes.len() as u32;
        let node = nodes
            .get_mut(num as usize)
            .ok_or(BStarError::NodeOutOfRange { node: num, count })?;
        node.copy_from_slice(data);
        Ok(())
    }
}

impl Default for MemDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeDevice for MemDevice {
    fn read_node(&self, num: u32) -> Result<Box<[u8; NODE_SIZE]>> {
        let nodes = self.nodes.read();
        self.reads.fetch_add(1, Ordering::Relaxed);
        nodes
            .get(num as usize)
            .cloned()
            .ok_or(BStarError::NodeOutOfRange {
                node: num,
                count: nodes.len() as u32,
            })
    }

    fn write_node(&self, num: u32, data: &[u8; NODE_SIZE]) -> Result<()> {
        let mut nodes = self.nodes.write();
        let count = nodes.len() as u32;
        let node = nodes
            .get_mut(num as usize)
            .ok_or(BStarError::NodeOutOfRange { node: num, count })?;
        node.copy_from_slice(data);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn node_count(&self) -> u32 {
        self.nodes.read().len() as u32
    }

    fn extend(&self, additional: u32) -> Result<u32> {
        let mut nodes = self.nodes.write();
        let current = nodes.len() as u32;
        let target = current.saturating_add(additional).min(self.max_nodes);
        for _ in current..target {
            nodes.push(Box::new([0u8; NODE_SIZE]));
        }
        Ok(target.max(current))
    }

    fn write_alternate(&self, data: &[u8; NODE_SIZE]) -> Result<()> {
        *self.alternate.lock() = Some(Box::new(*data));
        self.alternate_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_alternate(&self) -> Result<Option<Box<[u8; NODE_SIZE]>>> {
        Ok(self.alternate.lock().clone())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_device_extend_and_access() {
        let device = MemDevice::new();
        assert_eq!(device.node_count(), 0);
        assert_eq!(device.extend(3).unwrap(), 3);

        let mut data = [0u8; NODE_SIZE];
        data[5] = 9;
        device.write_node(2, &data).unwrap();
        assert_eq!(device.read_node(2).unwrap()[5], 9);
        assert_eq!(device.reads(), 1);
        assert_eq!(device.writes(), 1);
    }

    #[test]
    fn test_mem_device_out_of_range() {
        let device = MemDevice::new();
        device.extend(1).unwrap();
        assert!(matches!(
            device.read_node(1),
            Err(BStarError::NodeOutOfRange { node: 1, count: 1 })
        ));
        assert!(device.write_node(4, &[0u8; NODE_SIZE]).is_err());
    }

    #[test]
    fn test_mem_device_limit() {
        let device = MemDevice::with_limit(5);
        assert_eq!(device.extend(4).unwrap(), 4);
        assert_eq!(device.extend(4).unwrap(), 5);
        assert_eq!(device.extend(4).unwrap(), 5);
    }

    #[test]
    fn test_mem_device_alternate() {
        let device = MemDevice::new();
        assert!(device.read_alternate().unwrap().is_none());
        device.write_alternate(&[1u8; NODE_SIZE]).unwrap();
        assert_eq!(device.alternate_writes(), 1);
        assert_eq!(device.read_alternate().unwrap().unwrap()[0], 1);
    }

    #[test]
    fn test_mem_device_poke() {
        let device = MemDevice::new();
        device.extend(2).unwrap();
        device.poke(1, &[7u8; NODE_SIZE]).unwrap();
        assert_eq!(device.read_node(1).unwrap()[0], 7);
        // poke is not counted as a write
        assert_eq!(device.writes(), 0);
    }
}
