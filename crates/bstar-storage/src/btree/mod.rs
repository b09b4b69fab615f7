//! Disk-resident B*-tree over 512-byte nodes.
//!
//! ## Node layout
//!
//! ```text
//! +----------------------+ 0
//! | flink: u32           |
//! | blink: u32           |
//! | kind: u8, height: u8 |
//! | num_records: u16     | 14 (DESCRIPTOR_SIZE)
//! +----------------------+
//! | record 0             |
//! | record 1             |
//! | ...                  |
//! +----------------------+
//! | free space           |
//! +----------------------+
//! | offset[n] ... [0]    | 512, growing down
//! +----------------------+
//! ```
//!
//! Node 0 is the header: tree metadata plus the first 2048 bits of the
//! allocation bitmap. Map nodes chained from its forward link hold the
//! rest. Leaves sit at height 1 and are doubly linked in key order; index
//! nodes above them hold one fixed-size record per child, keyed by the
//! child's first key.
//!
//! ## Concurrency
//!
//! Searches latch nodes hand over hand. Mutations descend in Reserve mode
//! and keep only the ancestors an update can reach. Anything that writes
//! more than one leaf takes the tree's reshape lock first.
//! Leaf walks hold one latch at a time and check the reshape sequence to
//! tell a concurrent split or merge from a broken link.

// Submodules
pub mod bitmap;
pub mod constants;
pub mod delete;
pub mod header;
pub mod insert;
pub mod path;
pub mod records;
pub mod scan;
pub mod search;
pub mod tree;
pub mod types;
pub mod verify;

// Re-exports for public API
pub use constants::MAX_RECORD_SIZE;
pub use header::HeaderRecord;
pub use scan::Scan;
pub use tree::{BTree, TreeStats};
pub use types::{compare_bytes, KeyCompare};
pub use verify::TreeReport;
