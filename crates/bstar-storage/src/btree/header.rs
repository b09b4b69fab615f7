//! Header node: tree metadata record plus the first slice of the bitmap.

use super::constants::{HEADER_MAP_SIZE, HEADER_RECORD_SIZE, HEADER_RESERVED_SIZE};
use super::records::insert_record;
use bstar_common::{BStarError, NodeBuf, NodeKind, Result, NODE_SIZE};

/// Tree metadata persisted as record 0 of node 0.
///
/// Layout (106 bytes, big-endian):
/// - depth: 2 bytes
/// - root: 4 bytes
/// - records: 4 bytes
/// - first_leaf: 4 bytes
/// - last_leaf: 4 bytes
/// - node_size: 2 bytes
/// - key_len: 2 bytes
/// - total_nodes: 4 bytes
/// - free_nodes: 4 bytes
/// - reserved: 76 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderRecord {
    /// Number of levels, 0 for an empty tree.
    pub depth: u16,
    /// Root node number, 0 for an empty tree.
    pub root: u32,
    /// Number of leaf records.
    pub records: u32,
    /// Leftmost leaf.
    pub first_leaf: u32,
    /// Rightmost leaf.
    pub last_leaf: u32,
    /// Node size, always 512.
    pub node_size: u16,
    /// Maximum key length.
    pub key_len: u16,
    /// Nodes backed by storage.
    pub total_nodes: u32,
    /// Nodes clear in the bitmap.
    pub free_nodes: u32,
}

impl HeaderRecord {
    /// Metadata of a freshly created, empty tree.
    pub fn new(key_len: u16, total_nodes: u32, free_nodes: u32) -> Self {
        Self {
            node_size: NODE_SIZE as u16,
            key_len,
            total_nodes,
            free_nodes,
            ..Default::default()
        }
    }

    /// Serializes the record.
    pub fn to_bytes(&self) -> [u8; HEADER_RECORD_SIZE] {
        let mut buf = [0u8; HEADER_RECORD_SIZE];
        buf[0..2].copy_from_slice(&self.depth.to_be_bytes());
        buf[2..6].copy_from_slice(&self.root.to_be_bytes());
        buf[6..10].copy_from_slice(&self.records.to_be_bytes());
        buf[10..14].copy_from_slice(&self.first_leaf.to_be_bytes());
        buf[14..18].copy_from_slice(&self.last_leaf.to_be_bytes());
        buf[18..20].copy_from_slice(&self.node_size.to_be_bytes());
        buf[20..22].copy_from_slice(&self.key_len.to_be_bytes());
        buf[22..26].copy_from_slice(&self.total_nodes.to_be_bytes());
        buf[26..30].copy_from_slice(&self.free_nodes.to_be_bytes());
        // bytes 30-105 are reserved (already zeroed)
        buf
    }

    /// Deserializes the record.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != HEADER_RECORD_SIZE {
            return Err(BStarError::NodeCorrupted {
                node: 0,
                reason: format!("header record is {} bytes", buf.len()),
            });
        }
        let u16_at = |p: usize| u16::from_be_bytes([buf[p], buf[p + 1]]);
        let u32_at = |p: usize| u32::from_be_bytes([buf[p], buf[p + 1], buf[p + 2], buf[p + 3]]);
        Ok(Self {
            depth: u16_at(0),
            root: u32_at(2),
            records: u32_at(6),
            first_leaf: u32_at(10),
            last_leaf: u32_at(14),
            node_size: u16_at(18),
            key_len: u16_at(20),
            total_nodes: u32_at(22),
            free_nodes: u32_at(26),
        })
    }

    /// Checks the counters against each other and against `node_count`
    /// nodes of backing storage.
    pub fn validate(&self, node_count: u32) -> Result<()> {
        let corrupt = |reason: String| Err(BStarError::NodeCorrupted { node: 0, reason });
        if self.node_size as usize != NODE_SIZE {
            return Err(BStarError::NodeSizeMismatch {
                expected: NODE_SIZE,
                actual: self.node_size as usize,
            });
        }
        if self.total_nodes > node_count {
            return corrupt(format!(
                "header claims {} nodes, storage holds {}",
                self.total_nodes, node_count
            ));
        }
        if self.free_nodes >= self.total_nodes {
            return corrupt(format!(
                "{} free of {} nodes",
                self.free_nodes, self.total_nodes
            ));
        }
        let empty = self.depth == 0;
        if empty != (self.root == 0) || empty != (self.first_leaf == 0) || empty != (self.last_leaf == 0) {
            return corrupt("depth, root and leaf pointers disagree".to_string());
        }
        if empty && self.records != 0 {
            return corrupt(format!("empty tree claims {} records", self.records));
        }
        for (name, num) in [("root", self.root), ("first leaf", self.first_leaf), ("last leaf", self.last_leaf)] {
            if num >= self.total_nodes {
                return corrupt(format!("{} {} out of range", name, num));
            }
        }
        Ok(())
    }
}

/// Lays out a header node: metadata, reserved record and the header map
/// record with the header's own bit set.
pub fn init_header_node(buf: &mut NodeBuf, header: &HeaderRecord) {
    buf.reset(NodeKind::Header, 0);
    let mut map = [0u8; HEADER_MAP_SIZE];
    map[0] = 0x80;
    let placed = insert_record(buf, 0, &header.to_bytes())
        && insert_record(buf, 1, &[0u8; HEADER_RESERVED_SIZE])
        && insert_record(buf, 2, &map);
    debug_assert!(placed, "header records always fit");
}

/// Reads the metadata out of a header node, checking its shape.
pub fn read_header_node(buf: &NodeBuf) -> Result<HeaderRecord> {
    if buf.kind() != NodeKind::Header {
        return Err(BStarError::NodeCorrupted {
            node: 0,
            reason: format!("node 0 is a {} node", buf.kind()),
        });
    }
    if buf.num_records() != 3
        || buf.record_size(0) != HEADER_RECORD_SIZE
        || buf.record_size(1) != HEADER_RESERVED_SIZE
        || buf.record_size(2) != HEADER_MAP_SIZE
    {
        return Err(BStarError::NodeCorrupted {
            node: 0,
            reason: "unexpected header record layout".to_string(),
        });
    }
    HeaderRecord::from_bytes(buf.record(0))
}

/// Writes `header` into an existing header node.
pub fn write_header_node(buf: &mut NodeBuf, header: &HeaderRecord) {
    buf.record_mut(0).copy_from_slice(&header.to_bytes());
}
