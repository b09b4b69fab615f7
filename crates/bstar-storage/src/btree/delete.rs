//! Deletion: leaf removal, then merge, balance or splice of underflowing
//! nodes on the way up, and root collapse.

use super::constants::HALF_NODE;
use super::path::{Intent, SearchPath};
use super::records::{balance, remove_record, shift_left, shift_right};
use super::search;
use super::tree::{BTree, ReshapeGuard};
use super::types::{index_child, record_key, set_index_key};
use bstar_cache::{LockMode, NodeRef};
use bstar_common::{BStarError, NodeKind, Result, NODE_CAPACITY};
use tracing::{debug, warn};

/// A neighbor of the node being fixed, under the same parent.
struct Sibling {
    node: NodeRef,
    free: usize,
}

impl BTree {
    /// Removes `key` and its data.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_key(key)?;
        let mut reshape: Option<ReshapeGuard<'_>> = None;
        loop {
            let located = match search::find(self, key, Intent::Delete, LockMode::Reserve, true) {
                Ok(located) => located,
                Err(BStarError::EmptyTree) => return Err(BStarError::KeyNotFound),
                Err(e) => return Err(e),
            };
            let mut path = located.path;
            let level = path.leaf_level();
            let (record, flags) = {
                let elem = &path.elems[level];
                (elem.record, elem.flags)
            };
            let simple = if level == 0 {
                path.node(level)?.read().num_records() > 1
            } else {
                flags.is_empty()
            };

            if simple {
                path.lock_leaf();
                let node = path.node(level)?;
                {
                    let mut buf = node.write();
                    remove_record(&mut buf, record);
                }
                node.commit();
                drop(path);
                self.update_meta(|meta| meta.header.records -= 1);
                return Ok(());
            }

            if reshape.is_none() {
                drop(path);
                reshape = Some(self.lock_reshape());
                continue;
            }

            path.lock_all();
            {
                let node = path.node(level)?;
                {
                    let mut buf = node.write();
                    remove_record(&mut buf, record);
                }
                node.commit();
            }
            self.rebalance(&path, level, record == 0)?;
            drop(path);
            self.update_meta(|meta| meta.header.records -= 1);
            return Ok(());
        }
    }

    /// Walks up from `level` after a removal, fixing underflowing nodes and
    /// stale parent keys.
    pub(crate) fn rebalance(&self, path: &SearchPath<'_>, level: usize, first_changed: bool) -> Result<()> {
        let mut level = level;
        let mut first_changed = first_changed;
        loop {
            if level == 0 {
                return self.collapse_root(path);
            }
            let node = path.node(level)?;
            let (n, free) = {
                let buf = node.read();
                (buf.num_records(), buf.free_space())
            };
            let underflow = free > HALF_NODE;
            if !underflow && !first_changed {
                return Ok(());
            }
            let parent = path.node(level - 1)?;
            let prec = path.elems[level - 1].record;

            if n == 0 {
                self.splice_out(node, &[])?;
                {
                    let mut buf = parent.write();
                    remove_record(&mut buf, prec);
                }
                parent.commit();
                first_changed = prec == 0;
                level -= 1;
                continue;
            }

            if !underflow {
                self.update_parent_keys(path, level)?;
                return Ok(());
            }

            let (left, right) = self.siblings(path, level)?;
            let merge_into = match (&left, &right) {
                (Some(l), Some(r)) => Some(if r.free > l.free { r } else { l }),
                (Some(l), None) => Some(l),
                (None, Some(r)) => Some(r),
                (None, None) => None,
            };
            let Some(target) = merge_into else {
                warn!(node = node.num(), "underflowing node has no siblings");
                return Err(BStarError::NodeCorrupted {
                    node: node.num(),
                    reason: "no siblings?".to_string(),
                });
            };

            if free + target.free >= NODE_CAPACITY {
                let into_left = left
                    .as_ref()
                    .map_or(false, |l| l.node.same_node(&target.node));
                if into_left {
                    {
                        let mut left_buf = target.node.write();
                        let mut buf = node.write();
                        shift_left(&mut left_buf, &mut buf, n);
                    }
                    target.node.commit();
                    node.commit();
                    first_changed = false;
                } else {
                    {
                        let mut buf = node.write();
                        let mut right_buf = target.node.write();
                        shift_right(&mut buf, &mut right_buf, 0);
                    }
                    node.commit();
                    target.node.commit();
                    self.set_parent_key(parent, prec + 1, &target.node)?;
                    first_changed = prec == 0;
                }
                debug!(node = node.num(), into = target.node.num(), "merged node");
                let held: Vec<&NodeRef> = [&left, &right]
                    .into_iter()
                    .flatten()
                    .map(|s| &s.node)
                    .collect();
                self.splice_out(node, &held)?;
                {
                    let mut buf = parent.write();
                    remove_record(&mut buf, prec);
                }
                parent.commit();
                level -= 1;
                continue;
            }

            match (&left, &right) {
                (None, Some(right)) => {
                    let moved = {
                        let mut buf = node.write();
                        let mut right_buf = right.node.write();
                        balance(&mut buf, &mut right_buf)
                    };
                    node.commit();
                    right.node.commit();
                    if moved.changed_right_first() {
                        self.set_parent_key(parent, prec + 1, &right.node)?;
                    }
                    debug!(node = node.num(), right = right.node.num(), ?moved, "balanced with right");
                    if first_changed {
                        self.update_parent_keys(path, level)?;
                    }
                }
                (Some(left), _) => {
                    let moved = {
                        let mut left_buf = left.node.write();
                        let mut buf = node.write();
                        balance(&mut left_buf, &mut buf)
                    };
                    left.node.commit();
                    node.commit();
                    if moved.changed_right_first() || first_changed {
                        self.set_parent_key(parent, prec, node)?;
                    }
                    debug!(node = node.num(), left = left.node.num(), ?moved, "balanced with left");
                }
                (None, None) => unreachable!("merge target found above"),
            }
            return Ok(());
        }
    }

    /// Fetches the neighbors of the node at `level` that share its parent,
    /// with their free space. Both are latched for writing.
    fn siblings(&self, path: &SearchPath<'_>, level: usize) -> Result<(Option<Sibling>, Option<Sibling>)> {
        let node = path.node(level)?;
        let parent = path.node(level - 1)?;
        let prec = path.elems[level - 1].record;
        let (blink, flink) = {
            let buf = node.read();
            (buf.blink(), buf.flink())
        };
        let (left_num, right_num) = {
            let buf = parent.read();
            let n = buf.num_records();
            if prec >= n || index_child(buf.record(prec)) != node.num() {
                return Err(BStarError::corrupted(format!(
                    "parent {} does not point at node {}",
                    parent.num(),
                    node.num()
                )));
            }
            let left = (prec > 0).then(|| index_child(buf.record(prec - 1)));
            let right = (prec + 1 < n).then(|| index_child(buf.record(prec + 1)));
            (left, right)
        };

        let fetch_sibling = |num: u32, expected: u32, side: &str| -> Result<Sibling> {
            if num != expected {
                warn!(node = node.num(), sibling = num, side, "sibling link mismatch");
                return Err(BStarError::NodeCorrupted {
                    node: node.num(),
                    reason: format!("{} link {} disagrees with parent's {}", side, expected, num),
                });
            }
            if path.holds(num) {
                warn!(node = num, "sibling already in search path");
                return Err(BStarError::corrupted(format!(
                    "sibling {} of node {} is already in the search path",
                    num,
                    node.num()
                )));
            }
            let sibling = self.fetch(num, LockMode::Write)?;
            let free = {
                let buf = sibling.read();
                let (sib_blink, sib_flink) = (buf.blink(), buf.flink());
                let back = if side == "left" { sib_flink } else { sib_blink };
                if back != node.num() || buf.kind() != node.read().kind() {
                    return Err(BStarError::NodeCorrupted {
                        node: num,
                        reason: format!("{} sibling does not link back to {}", side, node.num()),
                    });
                }
                buf.free_space()
            };
            Ok(Sibling { node: sibling, free })
        };

        let left = match left_num {
            Some(num) => Some(fetch_sibling(num, blink, "left")?),
            None => None,
        };
        let right = match right_num {
            Some(num) => Some(fetch_sibling(num, flink, "right")?),
            None => None,
        };
        Ok((left, right))
    }

    /// Rewrites parent record `record` with the first key of `child`.
    fn set_parent_key(&self, parent: &NodeRef, record: usize, child: &NodeRef) -> Result<()> {
        let key = {
            let buf = child.read();
            if buf.num_records() == 0 {
                return Err(BStarError::Internal(format!("node {} is empty", child.num())));
            }
            record_key(buf.record(0)).to_vec()
        };
        {
            let mut buf = parent.write();
            set_index_key(buf.record_mut(record), &key);
        }
        parent.commit();
        Ok(())
    }

    /// Unlinks an emptied node from its level's sibling chain and frees it.
    ///
    /// `held` are nodes this thread already latched for writing.
    fn splice_out(&self, node: &NodeRef, held: &[&NodeRef]) -> Result<()> {
        let (blink, flink, leaf) = {
            let buf = node.read();
            (buf.blink(), buf.flink(), buf.kind() == NodeKind::Leaf)
        };

        if blink != 0 {
            let fetched;
            let left = match held.iter().find(|n| n.num() == blink) {
                Some(n) => *n,
                None => {
                    fetched = self.fetch(blink, LockMode::Write)?;
                    &fetched
                }
            };
            left.write().set_flink(flink);
            left.commit();
        } else if leaf {
            self.update_meta(|meta| meta.header.first_leaf = flink);
        }

        if flink != 0 {
            let fetched;
            let right = match held.iter().find(|n| n.num() == flink) {
                Some(n) => *n,
                None => {
                    fetched = self.fetch(flink, LockMode::Write)?;
                    &fetched
                }
            };
            right.write().set_blink(blink);
            right.commit();
        } else if leaf {
            self.update_meta(|meta| meta.header.last_leaf = blink);
        }

        self.free_node(node)?;
        debug!(node = node.num(), "removed empty node");
        Ok(())
    }

    /// Frees an empty root, or replaces an index root holding a single
    /// record with its child, as often as needed.
    fn collapse_root(&self, path: &SearchPath<'_>) -> Result<()> {
        let root = path.node(0)?;
        if root.read().num_records() == 0 {
            self.free_node(root)?;
            self.update_meta(|meta| {
                let header = &mut meta.header;
                header.depth = 0;
                header.root = 0;
                header.first_leaf = 0;
                header.last_leaf = 0;
            });
            self.set_root(None);
            debug!(node = root.num(), "tree is empty");
            return Ok(());
        }

        let mut current = root.share();
        loop {
            let child_num = {
                let buf = current.read();
                if buf.kind() != NodeKind::Index || buf.num_records() != 1 {
                    return Ok(());
                }
                index_child(buf.record(0))
            };
            let held = path
                .elems
                .iter()
                .find(|e| e.num == child_num)
                .and_then(|e| e.node.as_ref());
            let child = match held {
                Some(node) => node.share(),
                None => self.fetch(child_num, LockMode::Write)?,
            };
            {
                let buf = child.read();
                if buf.blink() != 0 || buf.flink() != 0 {
                    warn!(node = child_num, "only child of the root has siblings");
                    return Err(BStarError::NodeCorrupted {
                        node: child_num,
                        reason: "only child of the root is linked to siblings".to_string(),
                    });
                }
            }
            self.free_node(&current)?;
            self.update_meta(|meta| {
                meta.header.root = child_num;
                meta.header.depth -= 1;
            });
            self.set_root(Some(&child));
            debug!(old = current.num(), root = child_num, "tree lost a level");
            current = child;
        }
    }
}
