//! Storage device abstraction.

use crate::error::Result;
use crate::node::NODE_SIZE;

/// Node-addressed storage that a tree lives on.
///
/// Node numbers run from 0 to `node_count() - 1`. Implementations must be
/// safe to call from multiple threads; the node cache serializes access to
/// any single node.
pub trait NodeDevice: Send + Sync {
    /// Reads one node.
    fn read_node(&self, num: u32) -> Result<Box<[u8; NODE_SIZE]>>;

    /// Writes one node.
    fn write_node(&self, num: u32, data: &[u8; NODE_SIZE]) -> Result<()>;

    /// Number of nodes currently backed by storage.
    fn node_count(&self) -> u32;

    /// Grows storage by up to `additional` zeroed nodes and returns the new
    /// node count. Returning the old count means no growth was possible.
    fn extend(&self, additional: u32) -> Result<u32>;

    /// Writes the backup copy of the header node.
    fn write_alternate(&self, data: &[u8; NODE_SIZE]) -> Result<()>;

    /// Reads the backup copy of the header node, if one was ever written.
    fn read_alternate(&self) -> Result<Option<Box<[u8; NODE_SIZE]>>>;

    /// Forces written nodes to stable storage.
    fn sync(&self) -> Result<()>;
}
