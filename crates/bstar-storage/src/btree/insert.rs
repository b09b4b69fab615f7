//! Insertion: leaf insert, node split, separator propagation and root
//! growth.

use super::bitmap::Reservation;
use super::constants::MAX_DEPTH;
use super::path::{Intent, SearchPath};
use super::records::{choose_split, insert_record, shift_right};
use super::search;
use super::tree::{BTree, ReshapeGuard};
use super::types::{build_index_record, build_leaf_record, record_key, set_index_key, PathFlags};
use bstar_cache::{LockMode, NodeRef};
use bstar_common::{BStarError, NodeKind, Result};
use tracing::debug;

impl BTree {
    /// Inserts `data` under `key`. The key must not be present.
    pub fn insert(&self, key: &[u8], data: &[u8]) -> Result<()> {
        self.check_key(key)?;
        let record = build_leaf_record(key, data);
        self.check_record_size(record.len())?;

        let mut reshape: Option<ReshapeGuard<'_>> = None;
        loop {
            if self.depth() == 0 {
                if reshape.is_none() {
                    reshape = Some(self.lock_reshape());
                }
                if self.depth() == 0 {
                    return self.create_root_leaf(&record);
                }
            }

            let intent = Intent::Insert { size: record.len() };
            let located = match search::find(self, key, intent, LockMode::Reserve, false) {
                Ok(located) => located,
                Err(BStarError::EmptyTree) => continue,
                Err(e) => return Err(e),
            };
            if located.exact {
                return Err(BStarError::DuplicateKey);
            }
            let mut path = located.path;
            let level = path.leaf_level();
            let (pos, flags) = {
                let elem = &path.elems[level];
                let pos = if elem.before_first { 0 } else { elem.record + 1 };
                (pos, elem.flags)
            };

            if !flags.intersects(PathFlags::FIRST | PathFlags::OVERFLOW) {
                path.lock_leaf();
                let node = path.node(level)?;
                let placed = {
                    let mut buf = node.write();
                    insert_record(&mut buf, pos, &record)
                };
                if !placed {
                    return Err(BStarError::Internal(format!(
                        "leaf {} has no room for a record that fit during search",
                        node.num()
                    )));
                }
                node.commit();
                drop(path);
                self.update_meta(|meta| meta.header.records += 1);
                return Ok(());
            }

            if reshape.is_none() {
                drop(path);
                reshape = Some(self.lock_reshape());
                continue;
            }

            let budget = if flags.contains(PathFlags::OVERFLOW) {
                path.retained() as u32 + 1
            } else {
                0
            };
            let mut res = match self.reserve(budget) {
                Some(res) => res,
                None => {
                    drop(path);
                    self.extend_storage()?;
                    continue;
                }
            };

            path.lock_all();
            self.insert_at(&mut path, level, pos, &record, &mut res)?;
            drop(path);
            self.update_meta(|meta| meta.header.records += 1);
            return Ok(());
        }
    }

    /// Creates a single-leaf root holding `record`.
    fn create_root_leaf(&self, record: &[u8]) -> Result<()> {
        let mut res = loop {
            match self.reserve(1) {
                Some(res) => break res,
                None => self.extend_storage()?,
            }
        };
        let node = self.new_node(&mut res, NodeKind::Leaf, 1)?;
        {
            let mut buf = node.write();
            if !insert_record(&mut buf, 0, record) {
                return Err(BStarError::Internal("record does not fit an empty leaf".to_string()));
            }
        }
        node.commit();
        let num = node.num();
        self.update_meta(|meta| {
            let header = &mut meta.header;
            header.depth = 1;
            header.root = num;
            header.first_leaf = num;
            header.last_leaf = num;
            header.records = 1;
        });
        self.set_root(Some(&node));
        debug!(root = num, "created root leaf");
        Ok(())
    }

    /// Inserts `rec` as record `pos` of the node at `level`, splitting it if
    /// it does not fit.
    pub(crate) fn insert_at(
        &self,
        path: &mut SearchPath<'_>,
        level: usize,
        pos: usize,
        rec: &[u8],
        res: &mut Reservation<'_>,
    ) -> Result<()> {
        let placed = {
            let node = path.node(level)?;
            let placed = {
                let mut buf = node.write();
                insert_record(&mut buf, pos, rec)
            };
            if placed {
                node.commit();
            }
            placed
        };
        if !placed {
            return self.split(path, level, pos, rec, res);
        }
        if pos == 0 {
            self.update_parent_keys(path, level)?;
        }
        Ok(())
    }

    /// Splits the node at `level` into itself and a new right neighbor,
    /// placing `rec` at `pos`, then inserts the separator one level up.
    fn split(
        &self,
        path: &mut SearchPath<'_>,
        level: usize,
        pos: usize,
        rec: &[u8],
        res: &mut Reservation<'_>,
    ) -> Result<()> {
        let node = path.node(level)?;
        let (kind, height, old_flink) = {
            let buf = node.read();
            (buf.kind(), buf.height(), buf.flink())
        };
        let neighbor = if old_flink != 0 {
            Some(self.fetch(old_flink, LockMode::Write)?)
        } else {
            None
        };
        let right = self.new_node(res, kind, height)?;

        let placed = {
            let mut left_buf = node.write();
            let mut right_buf = right.write();
            let mut sizes: Vec<usize> = (0..left_buf.num_records())
                .map(|i| left_buf.record_size(i) + 2)
                .collect();
            sizes.insert(pos, rec.len() + 2);
            let split = choose_split(&sizes);
            let placed = if pos < split {
                shift_right(&mut left_buf, &mut right_buf, split - 1);
                insert_record(&mut left_buf, pos, rec)
            } else {
                shift_right(&mut left_buf, &mut right_buf, split);
                insert_record(&mut right_buf, pos - split, rec)
            };
            right_buf.set_blink(node.num());
            right_buf.set_flink(old_flink);
            left_buf.set_flink(right.num());
            placed
        };
        node.commit();
        right.commit();
        if !placed {
            return Err(BStarError::Internal(format!(
                "split of node {} left no room for the new record",
                node.num()
            )));
        }

        match &neighbor {
            Some(nb) => {
                nb.write().set_blink(right.num());
                nb.commit();
            }
            None if kind == NodeKind::Leaf => {
                let num = right.num();
                self.update_meta(|meta| meta.header.last_leaf = num);
            }
            None => {}
        }
        drop(neighbor);
        debug!(node = node.num(), right = right.num(), height, "split node");

        if pos == 0 {
            self.update_parent_keys(path, level)?;
        }

        let separator = {
            let buf = right.read();
            build_index_record(record_key(buf.record(0)), right.num(), self.key_len())
        };
        if level == 0 {
            let left = path.node(level)?.share();
            return self.grow_root(&left, &right, res);
        }
        drop(right);
        let parent_pos = path.elems[level - 1].record + 1;
        self.insert_at(path, level - 1, parent_pos, &separator, res)
    }

    /// Puts a new index root above `left` and `right`.
    fn grow_root(&self, left: &NodeRef, right: &NodeRef, res: &mut Reservation<'_>) -> Result<()> {
        let depth = self.depth();
        let height = left.read().height();
        if depth >= MAX_DEPTH {
            return Err(BStarError::corrupted(format!("tree depth would exceed {}", MAX_DEPTH)));
        }
        let root = self.new_node(res, NodeKind::Index, height + 1)?;
        {
            let left_buf = left.read();
            let right_buf = right.read();
            let mut root_buf = root.write();
            let key_len = self.key_len();
            let first = build_index_record(record_key(left_buf.record(0)), left.num(), key_len);
            let second = build_index_record(record_key(right_buf.record(0)), right.num(), key_len);
            if !(insert_record(&mut root_buf, 0, &first) && insert_record(&mut root_buf, 1, &second)) {
                return Err(BStarError::Internal("index records do not fit a new root".to_string()));
            }
        }
        root.commit();
        let num = root.num();
        self.update_meta(|meta| {
            meta.header.root = num;
            meta.header.depth = depth + 1;
        });
        self.set_root(Some(&root));
        debug!(root = num, depth = depth + 1, "tree grew a level");
        Ok(())
    }

    /// Copies the first key of the node at `level` into its parent's record,
    /// continuing upward while that record is its parent's first.
    pub(crate) fn update_parent_keys(&self, path: &SearchPath<'_>, level: usize) -> Result<()> {
        let mut level = level;
        while level > 0 {
            let key = {
                let node = path.node(level)?;
                let buf = node.read();
                record_key(buf.record(0)).to_vec()
            };
            let parent = path.node(level - 1)?;
            let record = path.elems[level - 1].record;
            {
                let mut buf = parent.write();
                set_index_key(buf.record_mut(record), &key);
            }
            parent.commit();
            if record != 0 {
                break;
            }
            level -= 1;
        }
        Ok(())
    }
}
