//! B*-tree layout constants.

use bstar_common::{NODE_CAPACITY, NODE_SIZE};

// Header node layout

/// Header record: tree metadata followed by reserved space.
pub const HEADER_RECORD_SIZE: usize = 106;

/// Second header-node record, reserved.
pub const HEADER_RESERVED_SIZE: usize = 128;

/// Map record carried by the header node itself.
pub const HEADER_MAP_SIZE: usize = 256;

/// Nodes tracked by the header's map record.
pub const HEADER_MAP_BITS: u32 = (HEADER_MAP_SIZE * 8) as u32;

/// Record index of the map record within the header node.
pub const HEADER_MAP_RECORD: usize = 2;

// Map nodes

/// Single record of a map node: every byte a map node can hold.
pub const MAP_NODE_RECORD_SIZE: usize = NODE_SIZE - 14 - 2 * 2;

/// Nodes tracked by one map node: 494 * 8.
pub const MAP_NODE_BITS: u32 = (MAP_NODE_RECORD_SIZE * 8) as u32;

// Fill thresholds

/// Half the usable space of a node. A non-root node whose free space would
/// exceed this after a removal is underflowing.
pub const HALF_NODE: usize = NODE_CAPACITY / 2;

/// Largest leaf record accepted, so that two records plus their offset
/// entries always fit in one node.
pub const MAX_RECORD_SIZE: usize = HALF_NODE - 2;

/// Size of a child node number in an index record.
pub const CHILD_PTR_SIZE: usize = 4;

/// Deepest tree supported. Heights are stored in a byte.
pub const MAX_DEPTH: u16 = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_node_fits() {
        // three records plus four offset entries fill the node exactly
        let used = 14 + HEADER_RECORD_SIZE + HEADER_RESERVED_SIZE + HEADER_MAP_SIZE + 2 * 4;
        assert_eq!(used, NODE_SIZE);
    }

    #[test]
    fn test_map_node_fits() {
        assert_eq!(MAP_NODE_RECORD_SIZE, 494);
        assert_eq!(MAP_NODE_BITS, 3952);
        assert_eq!(HEADER_MAP_BITS, 2048);
    }

    #[test]
    fn test_fill_thresholds() {
        assert_eq!(HALF_NODE, 248);
        assert_eq!(MAX_RECORD_SIZE, 246);
        assert!(2 * (MAX_RECORD_SIZE + 2) <= NODE_CAPACITY);
    }
}
