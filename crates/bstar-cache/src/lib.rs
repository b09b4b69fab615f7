//! Node cache for the B*-tree engine.
//!
//! This crate provides in-memory node caching with:
//! - Read / Reserve / Write latches per node
//! - Reference counting with eviction on last release
//! - Sticky nodes that stay resident while the tree is open
//! - Dirty tracking with write-back on eviction and flush

mod cache;
mod latch;
mod node;

pub use cache::{CacheStats, NodeCache, NodeRef};
pub use latch::{LatchSnapshot, LockMode, NodeLatch};
pub use node::CachedNode;
