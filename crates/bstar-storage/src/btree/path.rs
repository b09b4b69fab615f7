//! Search path: the chain of node references from the root to a leaf.
//!
//! Level 0 is the root. A node at level `l` has height `depth - l`. While
//! descending, each element's flags decide whether its ancestors are still
//! needed; ancestors no update could reach are released early.

use super::constants::{HALF_NODE, MAX_DEPTH};
use super::tree::BTree;
use super::types::{index_record_size, PathFlags};
use bstar_cache::{LockMode, NodeRef};
use bstar_common::{BStarError, NodeBuf, NodeKind, Result};
use tracing::warn;

/// What the caller will do with the located record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Intent {
    /// Read or rewrite in place.
    Read,
    /// Insert a leaf record of `size` bytes.
    Insert { size: usize },
    /// Remove the located leaf record.
    Delete,
}

impl Intent {
    /// Flags that require ancestors to stay latched.
    pub fn keep(self) -> PathFlags {
        match self {
            Intent::Read => PathFlags::empty(),
            Intent::Insert { .. } => PathFlags::FIRST | PathFlags::OVERFLOW,
            Intent::Delete => PathFlags::FIRST | PathFlags::UNDERFLOW,
        }
    }
}

/// One level of a search path.
#[derive(Debug)]
pub(crate) struct PathElem {
    pub num: u32,
    /// None once released.
    pub node: Option<NodeRef>,
    /// Selected record.
    pub record: usize,
    /// Every key in the node is greater than the target.
    pub before_first: bool,
    pub flags: PathFlags,
}

#[derive(Debug)]
pub(crate) struct SearchPath<'t> {
    pub tree: &'t BTree,
    pub elems: Vec<PathElem>,
    pub mode: LockMode,
    pub intent: Intent,
    pub depth: u16,
}

impl<'t> SearchPath<'t> {
    /// Latches the root in `mode` and starts a path at it.
    ///
    /// Retries while the root moves underneath the caller.
    pub fn init(tree: &'t BTree, intent: Intent, mode: LockMode) -> Result<Self> {
        loop {
            let (root, depth) = tree.root_and_depth();
            if depth == 0 {
                return Err(BStarError::EmptyTree);
            }
            if depth > MAX_DEPTH {
                return Err(BStarError::corrupted(format!("tree depth {} too large", depth)));
            }
            let node = match tree.fetch(root, mode) {
                Ok(node) => node,
                Err(e) => {
                    if tree.root_and_depth() != (root, depth) {
                        continue;
                    }
                    return Err(e);
                }
            };
            if tree.root_and_depth() != (root, depth) {
                continue;
            }
            check_node(&node.read(), root, depth, 0)?;
            return Ok(Self {
                tree,
                elems: vec![PathElem {
                    num: root,
                    node: Some(node),
                    record: 0,
                    before_first: false,
                    flags: PathFlags::empty(),
                }],
                mode,
                intent,
                depth,
            });
        }
    }

    /// Starts a read path at the tree's first leaf.
    pub fn first_leaf(tree: &'t BTree) -> Result<Self> {
        loop {
            let header = tree.meta_snapshot();
            if header.depth == 0 {
                return Err(BStarError::EmptyTree);
            }
            let node = match tree.fetch(header.first_leaf, LockMode::Read) {
                Ok(node) => node,
                Err(e) => {
                    if tree.meta_snapshot().first_leaf != header.first_leaf {
                        continue;
                    }
                    return Err(e);
                }
            };
            let current = tree.meta_snapshot();
            if current.first_leaf != header.first_leaf || current.depth != header.depth {
                continue;
            }
            {
                let buf = node.read();
                if buf.kind() != NodeKind::Leaf || buf.blink() != 0 {
                    return Err(BStarError::NodeCorrupted {
                        node: header.first_leaf,
                        reason: "first leaf is not a leftmost leaf".to_string(),
                    });
                }
            }
            return Ok(Self {
                tree,
                elems: vec![PathElem {
                    num: header.first_leaf,
                    node: Some(node),
                    record: 0,
                    before_first: false,
                    flags: PathFlags::empty(),
                }],
                mode: LockMode::Read,
                intent: Intent::Read,
                depth: header.depth,
            });
        }
    }

    // =========================================================================
    // Descent
    // =========================================================================

    /// Fetches `child` under the path's mode and appends it.
    ///
    /// A child already on the path is a cycle.
    pub fn advance(&mut self, child: u32) -> Result<()> {
        if self.elems.iter().any(|e| e.num == child) {
            warn!(node = child, "cycle in search path");
            self.release_all();
            return Err(BStarError::corrupted(format!(
                "node {} appears twice in a search path",
                child
            )));
        }
        let level = self.elems.len();
        if level >= self.depth as usize {
            self.release_all();
            return Err(BStarError::corrupted("search path deeper than the tree"));
        }
        let node = match self.tree.fetch(child, self.mode) {
            Ok(node) => node,
            Err(e) => {
                self.release_all();
                return Err(e);
            }
        };
        let checked = check_node(&node.read(), child, self.depth, level);
        if let Err(e) = checked {
            drop(node);
            self.release_all();
            return Err(e);
        }
        self.elems.push(PathElem {
            num: child,
            node: Some(node),
            record: 0,
            before_first: false,
            flags: PathFlags::empty(),
        });
        Ok(())
    }

    /// Computes the bottom element's flags from its selected record and
    /// releases every ancestor if none of them matter to the intent.
    pub fn settle(&mut self) -> Result<()> {
        let level = self.elems.len() - 1;
        let flags = {
            let elem = &self.elems[level];
            let node = self.node(level)?;
            let buf = node.read();
            compute_flags(&buf, elem, self.intent, self.tree.key_len())
        };
        self.elems[level].flags = flags;
        if !flags.intersects(self.intent.keep()) {
            self.release_above(level);
        }
        Ok(())
    }

    // =========================================================================
    // Access
    // =========================================================================

    pub fn leaf_level(&self) -> usize {
        self.elems.len() - 1
    }

    /// Returns the node held at `level`.
    pub fn node(&self, level: usize) -> Result<&NodeRef> {
        match self.elems.get(level).and_then(|e| e.node.as_ref()) {
            Some(node) => Ok(node),
            None => {
                warn!(level, "missing parent in search path");
                Err(BStarError::corrupted(format!(
                    "missing parent at level {} of search path",
                    level
                )))
            }
        }
    }

    /// Returns the bottom node and its selected record.
    pub fn leaf(&self) -> Result<(&NodeRef, usize)> {
        let level = self.leaf_level();
        Ok((self.node(level)?, self.elems[level].record))
    }

    /// Returns true if node `num` is held anywhere on the path.
    pub fn holds(&self, num: u32) -> bool {
        self.elems.iter().any(|e| e.num == num && e.node.is_some())
    }

    /// Number of nodes still latched.
    pub fn retained(&self) -> usize {
        self.elems.iter().filter(|e| e.node.is_some()).count()
    }

    /// Level of the topmost latched node.
    pub fn top(&self) -> usize {
        self.elems
            .iter()
            .position(|e| e.node.is_some())
            .unwrap_or(self.elems.len())
    }

    // =========================================================================
    // Locking
    // =========================================================================

    /// Releases every level above `level`, top down.
    pub fn release_above(&mut self, level: usize) {
        for elem in self.elems.iter_mut().take(level) {
            if let Some(node) = elem.node.take() {
                node.release();
            }
        }
    }

    /// Releases every node on the path.
    pub fn release_all(&mut self) {
        for elem in self.elems.iter_mut() {
            if let Some(node) = elem.node.take() {
                node.release();
            }
        }
    }

    /// Upgrades every retained node from `level` down to the leaf to Write,
    /// releasing anything above `level` first.
    pub fn lock_from(&mut self, level: usize) {
        self.release_above(level);
        for elem in self.elems.iter_mut().skip(level) {
            if let Some(node) = elem.node.as_mut() {
                node.relock(LockMode::Write);
            }
        }
    }

    /// Upgrades every retained node to Write, top down.
    pub fn lock_all(&mut self) {
        let top = self.top();
        self.lock_from(top);
    }

    /// Upgrades only the leaf to Write.
    pub fn lock_leaf(&mut self) {
        let level = self.leaf_level();
        if let Some(node) = self.elems[level].node.as_mut() {
            node.relock(LockMode::Write);
        }
    }
}

/// Checks that `buf` is the kind and height expected at `level` of a tree
/// `depth` levels deep.
fn check_node(buf: &NodeBuf, num: u32, depth: u16, level: usize) -> Result<()> {
    let height = depth as usize - level;
    let expected = if height == 1 {
        NodeKind::Leaf
    } else {
        NodeKind::Index
    };
    if buf.kind() != expected || buf.height() as usize != height {
        warn!(node = num, kind = %buf.kind(), height = buf.height(), "unexpected node in tree");
        return Err(BStarError::NodeCorrupted {
            node: num,
            reason: format!(
                "expected a {} node at height {}, found {} at height {}",
                expected,
                height,
                buf.kind(),
                buf.height()
            ),
        });
    }
    if buf.num_records() == 0 {
        warn!(node = num, "empty node in tree");
        return Err(BStarError::NodeCorrupted {
            node: num,
            reason: "node holds no records".to_string(),
        });
    }
    Ok(())
}

/// Flags for an element whose selected record is already known.
fn compute_flags(buf: &NodeBuf, elem: &PathElem, intent: Intent, key_len: usize) -> PathFlags {
    let mut flags = PathFlags::empty();
    let leaf = buf.kind() == NodeKind::Leaf;
    let free = buf.free_space();
    let index_size = index_record_size(key_len);
    match intent {
        Intent::Read => {}
        Intent::Insert { size } => {
            let first = if leaf {
                elem.before_first
            } else {
                elem.record == 0
            };
            if first {
                flags.insert(PathFlags::FIRST);
            }
            let needed = if leaf { size } else { index_size };
            if free < needed + 2 {
                flags.insert(PathFlags::OVERFLOW);
            }
        }
        Intent::Delete => {
            if elem.record == 0 {
                flags.insert(PathFlags::FIRST);
            }
            let removed = if leaf {
                buf.record_size(elem.record)
            } else {
                index_size
            };
            if free + removed + 2 > HALF_NODE {
                flags.insert(PathFlags::UNDERFLOW);
            }
        }
    }
    flags
}
