//! B*-tree storage engine.
//!
//! This crate provides:
//! - File and in-memory node devices
//! - Bit scanning for the allocation bitmap
//! - The B*-tree itself: search, insert with node splits, delete with
//!   merging and balancing, ordered scans and verification

pub mod bits;
mod btree;
mod disk;
mod memory;

pub use btree::{
    compare_bytes, BTree, HeaderRecord, KeyCompare, Scan, TreeReport, TreeStats, MAX_RECORD_SIZE,
};
pub use disk::{FileDevice, FileDeviceConfig};
pub use memory::MemDevice;

pub use bstar_cache::CacheStats;
pub use bstar_common::{BStarError, NodeDevice, Result, TreeConfig};
