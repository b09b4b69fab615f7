//! On-disk node format.
//!
//! Every node is exactly [`NODE_SIZE`] bytes:
//!
//! ```text
//! +------------+---------------------------+-----------+----------------+
//! | descriptor | records (packed, sorted)  | free      | offset table   |
//! | 14 bytes   | grows ->                  |           | <- grows       |
//! +------------+---------------------------+-----------+----------------+
//! ```
//!
//! The offset table holds `num_records + 1` big-endian u16 entries stored
//! backwards from the end of the node. Entry `i` is the start of record `i`;
//! entry `num_records` is the offset just past the last record. Entry 0 is
//! always [`DESCRIPTOR_SIZE`].

use crate::error::{BStarError, Result};
use serde::{Deserialize, Serialize};

/// Node size in bytes. Fixed for every tree.
pub const NODE_SIZE: usize = 512;

/// Size of the node descriptor in bytes.
pub const DESCRIPTOR_SIZE: usize = 14;

/// Free space of an empty node: everything except the descriptor and the
/// single offset entry an empty node carries.
pub const NODE_CAPACITY: usize = NODE_SIZE - DESCRIPTOR_SIZE - 2;

/// Node kinds, stored in the descriptor's kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeKind {
    /// Non-leaf node holding key / child node number pairs.
    Index = 0x00,
    /// Node 0, tree-wide metadata.
    Header = 0x01,
    /// Holds a slice of the node allocation bitmap.
    Map = 0x02,
    /// Height-1 node holding key / data pairs.
    Leaf = 0xFF,
}

impl NodeKind {
    /// Parses a kind byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(NodeKind::Index),
            0x01 => Some(NodeKind::Header),
            0x02 => Some(NodeKind::Map),
            0xFF => Some(NodeKind::Leaf),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeKind::Index => "index",
            NodeKind::Header => "header",
            NodeKind::Map => "map",
            NodeKind::Leaf => "leaf",
        };
        f.write_str(name)
    }
}

/// Node descriptor at the start of every node.
///
/// Layout (14 bytes, big-endian):
/// - flink: 4 bytes (next node at the same height, 0 if none)
/// - blink: 4 bytes (previous node at the same height, 0 if none)
/// - kind: 1 byte
/// - height: 1 byte
/// - num_records: 2 bytes
/// - reserved: 2 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub flink: u32,
    pub blink: u32,
    pub kind: NodeKind,
    pub height: u8,
    pub num_records: u16,
}

impl NodeDescriptor {
    /// Creates a descriptor for an empty, unlinked node.
    pub fn new(kind: NodeKind, height: u8) -> Self {
        Self {
            flink: 0,
            blink: 0,
            kind,
            height,
            num_records: 0,
        }
    }

    /// Serializes the descriptor.
    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        buf[0..4].copy_from_slice(&self.flink.to_be_bytes());
        buf[4..8].copy_from_slice(&self.blink.to_be_bytes());
        buf[8] = self.kind as u8;
        buf[9] = self.height;
        buf[10..12].copy_from_slice(&self.num_records.to_be_bytes());
        // bytes 12-13 are reserved (already zeroed)
        buf
    }

    /// Deserializes a descriptor. Fails on an unknown kind byte.
    pub fn from_bytes(buf: &[u8]) -> std::result::Result<Self, String> {
        if buf.len() < DESCRIPTOR_SIZE {
            return Err(format!("descriptor truncated to {} bytes", buf.len()));
        }
        let kind = NodeKind::from_u8(buf[8]).ok_or_else(|| format!("unknown node kind {:#04x}", buf[8]))?;
        Ok(Self {
            flink: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            blink: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            kind,
            height: buf[9],
            num_records: u16::from_be_bytes([buf[10], buf[11]]),
        })
    }
}

/// In-memory image of one node: the parsed descriptor plus the raw sector.
///
/// Record and offset-table edits go straight to the sector. Descriptor
/// edits stay in `desc` until [`NodeBuf::sync_descriptor`] writes them back.
#[derive(Clone)]
pub struct NodeBuf {
    desc: NodeDescriptor,
    data: Box<[u8; NODE_SIZE]>,
}

impl std::fmt::Debug for NodeBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBuf")
            .field("desc", &self.desc)
            .field("free_space", &self.free_space())
            .finish()
    }
}

impl NodeBuf {
    /// Creates an empty node of the given kind.
    pub fn new(kind: NodeKind, height: u8) -> Self {
        let mut node = Self {
            desc: NodeDescriptor::new(kind, height),
            data: Box::new([0u8; NODE_SIZE]),
        };
        node.set_offset(0, DESCRIPTOR_SIZE);
        node.sync_descriptor();
        node
    }

    /// Parses and validates a sector read from storage.
    pub fn from_bytes(data: Box<[u8; NODE_SIZE]>) -> std::result::Result<Self, String> {
        let desc = NodeDescriptor::from_bytes(&data[..])?;
        let node = Self { desc, data };
        node.validate()?;
        Ok(node)
    }

    /// Checks the offset table: entry 0 equals the descriptor size, entries
    /// never decrease, and the last record ends before the table begins.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let n = self.desc.num_records as usize;
        if DESCRIPTOR_SIZE + 2 * (n + 1) > NODE_SIZE {
            return Err(format!("record count {} cannot fit in a node", n));
        }
        if self.offset(0) != DESCRIPTOR_SIZE {
            return Err(format!("first record offset {} is not {}", self.offset(0), DESCRIPTOR_SIZE));
        }
        let mut prev = DESCRIPTOR_SIZE;
        for i in 1..=n {
            let off = self.offset(i);
            if off < prev {
                return Err(format!("offset table decreases at entry {} ({} < {})", i, off, prev));
            }
            prev = off;
        }
        if prev > NODE_SIZE - 2 * (n + 1) {
            return Err(format!("records end at {}, overlapping the offset table", prev));
        }
        Ok(())
    }

    /// Returns the in-memory descriptor.
    #[inline]
    pub fn descriptor(&self) -> &NodeDescriptor {
        &self.desc
    }

    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.desc.kind
    }

    #[inline]
    pub fn height(&self) -> u8 {
        self.desc.height
    }

    #[inline]
    pub fn num_records(&self) -> usize {
        self.desc.num_records as usize
    }

    #[inline]
    pub fn flink(&self) -> u32 {
        self.desc.flink
    }

    #[inline]
    pub fn blink(&self) -> u32 {
        self.desc.blink
    }

    pub fn set_flink(&mut self, flink: u32) {
        self.desc.flink = flink;
    }

    pub fn set_blink(&mut self, blink: u32) {
        self.desc.blink = blink;
    }

    pub fn set_height(&mut self, height: u8) {
        self.desc.height = height;
    }

    /// Sets the record count. The caller keeps the offset table consistent.
    pub fn set_num_records(&mut self, n: usize) {
        debug_assert!(n <= u16::MAX as usize);
        self.desc.num_records = n as u16;
    }

    /// Writes the descriptor fields into the sector.
    pub fn sync_descriptor(&mut self) {
        let bytes = self.desc.to_bytes();
        self.data[..DESCRIPTOR_SIZE].copy_from_slice(&bytes);
    }

    /// Reads offset-table entry `i`.
    #[inline]
    pub fn offset(&self, i: usize) -> usize {
        let pos = NODE_SIZE - 2 * (i + 1);
        u16::from_be_bytes([self.data[pos], self.data[pos + 1]]) as usize
    }

    /// Writes offset-table entry `i`.
    #[inline]
    pub fn set_offset(&mut self, i: usize, value: usize) {
        let pos = NODE_SIZE - 2 * (i + 1);
        self.data[pos..pos + 2].copy_from_slice(&(value as u16).to_be_bytes());
    }

    /// Size of record `i` in bytes.
    #[inline]
    pub fn record_size(&self, i: usize) -> usize {
        self.offset(i + 1) - self.offset(i)
    }

    /// Returns record `i`.
    pub fn record(&self, i: usize) -> &[u8] {
        &self.data[self.offset(i)..self.offset(i + 1)]
    }

    /// Returns record `i` for in-place modification.
    pub fn record_mut(&mut self, i: usize) -> &mut [u8] {
        let (start, end) = (self.offset(i), self.offset(i + 1));
        &mut self.data[start..end]
    }

    /// Bytes available for new records, counting the offset entry each
    /// record needs.
    pub fn free_space(&self) -> usize {
        let n = self.num_records();
        NODE_SIZE
            .saturating_sub(self.offset(n))
            .saturating_sub(2 * (n + 1))
    }

    /// Bytes taken by records and their offset entries.
    pub fn used_space(&self) -> usize {
        NODE_CAPACITY - self.free_space()
    }

    /// Raw sector contents.
    pub fn as_bytes(&self) -> &[u8; NODE_SIZE] {
        &self.data
    }

    /// Raw sector contents for bulk record moves.
    pub fn bytes_mut(&mut self) -> &mut [u8; NODE_SIZE] {
        &mut self.data
    }

    /// Clears the node back to an empty node of the given kind.
    pub fn reset(&mut self, kind: NodeKind, height: u8) {
        self.data.fill(0);
        self.desc = NodeDescriptor::new(kind, height);
        self.set_offset(0, DESCRIPTOR_SIZE);
        self.sync_descriptor();
    }
}

/// A child node number that has been checked against the tree's node count.
///
/// Node 0 is the header and can never be a child, so zero is rejected along
/// with anything at or past the live node count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildLink(u32);

impl ChildLink {
    /// Validates a raw link read from an index record or sibling pointer.
    pub fn new(raw: u32, node_count: u32) -> Result<Self> {
        if raw == 0 {
            return Err(BStarError::corrupted("link to node 0"));
        }
        if raw >= node_count {
            return Err(BStarError::NodeOutOfRange {
                node: raw,
                count: node_count,
            });
        }
        Ok(Self(raw))
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }
}
