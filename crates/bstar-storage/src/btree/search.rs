//! Descent from the root to the leaf holding a key, and the successor walk
//! along the leaf chain.

use super::path::{Intent, SearchPath};
use super::tree::BTree;
use super::types::{check_record, index_child, record_key};
use bstar_cache::LockMode;
use bstar_common::{BStarError, NodeKind, Result};
use std::cmp::Ordering;
use tracing::warn;

/// Result of a search.
#[derive(Debug)]
pub(crate) struct Located<'t> {
    /// Path down to the leaf. The leaf element selects the record with the
    /// greatest key not above the target.
    pub path: SearchPath<'t>,
    /// The leaf record's key equals the target.
    pub exact: bool,
}

/// Where a key falls within one node.
struct Position {
    record: usize,
    exact: bool,
    before_first: bool,
}

/// Finds the record with the greatest key not above `key`.
///
/// With `exact`, anything but an equal key is [`BStarError::KeyNotFound`].
/// Without it, a key below every key in the tree selects record 0 of the
/// first leaf with `before_first` set.
pub(crate) fn find<'t>(
    tree: &'t BTree,
    key: &[u8],
    intent: Intent,
    mode: LockMode,
    exact: bool,
) -> Result<Located<'t>> {
    tree.check_key(key)?;
    let mut path = SearchPath::init(tree, intent, mode)?;
    loop {
        let level = path.leaf_level();
        let pos = {
            let node = path.node(level)?;
            let buf = node.read();
            locate(tree, &buf, node.num(), key)?
        };

        if pos.before_first && exact {
            return Err(BStarError::KeyNotFound);
        }
        let elem = &mut path.elems[level];
        elem.record = pos.record;
        elem.before_first = pos.before_first;
        path.settle()?;

        if level + 1 == path.depth as usize {
            if exact && !pos.exact {
                return Err(BStarError::KeyNotFound);
            }
            return Ok(Located {
                path,
                exact: pos.exact,
            });
        }

        let child = {
            let node = path.node(level)?;
            let buf = node.read();
            index_child(buf.record(pos.record))
        };
        path.advance(child)?;
    }
}

/// Reverse linear scan for the last record whose key is not above `key`.
fn locate(
    tree: &BTree,
    buf: &bstar_common::NodeBuf,
    num: u32,
    key: &[u8],
) -> Result<Position> {
    let index = buf.kind() == NodeKind::Index;
    let n = buf.num_records();
    for i in (0..n).rev() {
        let rec = buf.record(i);
        check_record(num, rec, tree.key_len(), index)?;
        match tree.compare.compare(record_key(rec), key) {
            Ordering::Greater => continue,
            ord => {
                return Ok(Position {
                    record: i,
                    exact: ord == Ordering::Equal,
                    before_first: false,
                })
            }
        }
    }
    if buf.blink() != 0 {
        warn!(node = num, "key sorts before every key of a node with a left sibling");
        return Err(BStarError::NodeCorrupted {
            node: num,
            reason: "parent key is greater than the node's first key".to_string(),
        });
    }
    Ok(Position {
        record: 0,
        exact: false,
        before_first: true,
    })
}

/// Outcome of a [`successor`] walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// The leaf element now selects the target record.
    Moved,
    /// Ran off the last leaf.
    End,
    /// A split or merge moved the next leaf while no latch was held. Every
    /// node in `path` has been released; search again from the last key.
    Stale,
}

/// Moves the leaf element of `path` forward by `count` records, following
/// forward links across leaves.
///
/// The current leaf is released before the next one is fetched, since merges
/// latch siblings right to left. A bad link seen while the tree was being
/// reshaped is reported as [`Step::Stale`]; with no reshape in between it is
/// corruption.
pub(crate) fn successor(path: &mut SearchPath<'_>, count: usize) -> Result<Step> {
    let level = path.leaf_level();
    let mut target = path.elems[level].record + count;
    loop {
        let (num, n, flink) = {
            let node = path.node(level)?;
            let buf = node.read();
            (node.num(), buf.num_records(), buf.flink())
        };
        if target < n {
            let elem = &mut path.elems[level];
            elem.record = target;
            elem.before_first = false;
            return Ok(Step::Moved);
        }
        target -= n;
        if flink == num {
            warn!(node = num, "leaf links to itself");
            return Err(BStarError::NodeCorrupted {
                node: num,
                reason: "forward link points at itself".to_string(),
            });
        }
        if flink == 0 {
            return Ok(Step::End);
        }

        let seq = path.tree.reshape_seq();
        if let Some(node) = path.elems[level].node.take() {
            node.release();
        }
        let next = match path.tree.fetch(flink, path.mode) {
            Ok(next) => next,
            Err(e) if e.is_corruption() && path.tree.reshaped_since(seq) => {
                path.release_all();
                return Ok(Step::Stale);
            }
            Err(e) => return Err(e),
        };
        let mismatch = {
            let buf = next.read();
            if buf.kind() != NodeKind::Leaf || buf.blink() != num {
                Some(format!(
                    "{} node with back link {} follows leaf {}",
                    buf.kind(),
                    buf.blink(),
                    num
                ))
            } else {
                None
            }
        };
        if let Some(reason) = mismatch {
            next.release();
            if path.tree.reshaped_since(seq) {
                path.release_all();
                return Ok(Step::Stale);
            }
            return Err(BStarError::NodeCorrupted { node: flink, reason });
        }
        let elem = &mut path.elems[level];
        elem.num = flink;
        elem.node = Some(next);
        elem.record = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemDevice;
    use bstar_common::TreeConfig;
    use std::sync::Arc;

    fn tree_with(keys: &[u32]) -> BTree {
        let config = TreeConfig {
            key_len: 4,
            clump_nodes: 16,
            initial_nodes: 16,
            write_alternate: false,
        };
        let tree = BTree::create(Arc::new(MemDevice::new()), config).unwrap();
        for k in keys {
            tree.insert(&k.to_be_bytes(), &[0u8; 120]).unwrap();
        }
        tree
    }

    fn leaf_key(located: &Located<'_>) -> Vec<u8> {
        let (node, record) = located.path.leaf().unwrap();
        let buf = node.read();
        record_key(buf.record(record)).to_vec()
    }

    #[test]
    fn test_find_empty_tree() {
        let tree = tree_with(&[]);
        assert!(matches!(
            find(&tree, b"k", Intent::Read, LockMode::Read, false),
            Err(BStarError::EmptyTree)
        ));
    }

    #[test]
    fn test_find_exact_and_predecessor() {
        let tree = tree_with(&[10, 20, 30, 40, 50, 60, 70]);
        assert!(tree.depth() > 1);

        let located = find(&tree, &30u32.to_be_bytes(), Intent::Read, LockMode::Read, true).unwrap();
        assert!(located.exact);
        assert_eq!(leaf_key(&located), 30u32.to_be_bytes());
        drop(located);

        let located = find(&tree, &35u32.to_be_bytes(), Intent::Read, LockMode::Read, false).unwrap();
        assert!(!located.exact);
        assert_eq!(leaf_key(&located), 30u32.to_be_bytes());
        drop(located);

        assert!(matches!(
            find(&tree, &35u32.to_be_bytes(), Intent::Read, LockMode::Read, true),
            Err(BStarError::KeyNotFound)
        ));
    }

    #[test]
    fn test_find_before_first_key() {
        let tree = tree_with(&[10, 20, 30, 40, 50]);
        let located = find(&tree, &5u32.to_be_bytes(), Intent::Read, LockMode::Read, false).unwrap();
        let level = located.path.leaf_level();
        assert!(located.path.elems[level].before_first);
        assert_eq!(located.path.elems[level].record, 0);
        assert_eq!(located.path.elems[level].num, tree.stats().first_leaf);
        drop(located);

        assert!(matches!(
            find(&tree, &5u32.to_be_bytes(), Intent::Read, LockMode::Read, true),
            Err(BStarError::KeyNotFound)
        ));
    }

    #[test]
    fn test_read_path_keeps_only_leaf() {
        let tree = tree_with(&[10, 20, 30, 40, 50, 60, 70]);
        let located = find(&tree, &40u32.to_be_bytes(), Intent::Read, LockMode::Read, true).unwrap();
        assert_eq!(located.path.retained(), 1);
        assert_eq!(located.path.elems.len(), tree.depth() as usize);
    }

    #[test]
    fn test_successor_crosses_leaves() {
        let keys = [10u32, 20, 30, 40, 50, 60, 70];
        let tree = tree_with(&keys);
        let mut path = SearchPath::first_leaf(&tree).unwrap();
        let mut seen = Vec::new();
        loop {
            {
                let (node, record) = path.leaf().unwrap();
                let buf = node.read();
                seen.push(record_key(buf.record(record)).to_vec());
            }
            match successor(&mut path, 1).unwrap() {
                Step::Moved => {}
                Step::End => break,
                Step::Stale => panic!("no reshape ran"),
            }
        }
        let expected: Vec<Vec<u8>> = keys.iter().map(|k| k.to_be_bytes().to_vec()).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_successor_by_count() {
        let tree = tree_with(&[10, 20, 30, 40, 50, 60, 70]);
        let mut path = SearchPath::first_leaf(&tree).unwrap();
        assert_eq!(successor(&mut path, 5).unwrap(), Step::Moved);
        let (node, record) = path.leaf().unwrap();
        assert_eq!(record_key(node.read().record(record)), 60u32.to_be_bytes());
        drop(path);

        let mut path = SearchPath::first_leaf(&tree).unwrap();
        assert_eq!(successor(&mut path, 7).unwrap(), Step::End);
    }

    #[test]
    fn test_successor_bad_link_during_reshape_is_stale() {
        let tree = tree_with(&[10, 20, 30, 40, 50, 60, 70]);
        let first = tree.stats().first_leaf;
        let second = {
            let node = tree.fetch(first, LockMode::Read).unwrap();
            let flink = node.read().flink();
            node.release();
            flink
        };
        {
            let node = tree.fetch(second, LockMode::Write).unwrap();
            node.write().set_blink(999);
            node.commit();
        }

        let guard = tree.lock_reshape();
        let mut path = SearchPath::first_leaf(&tree).unwrap();
        assert_eq!(successor(&mut path, 3).unwrap(), Step::Stale);
        assert_eq!(path.retained(), 0);
        drop(path);
        drop(guard);

        let mut path = SearchPath::first_leaf(&tree).unwrap();
        assert!(matches!(
            successor(&mut path, 3),
            Err(BStarError::NodeCorrupted { node, .. }) if node == second
        ));
    }
}
