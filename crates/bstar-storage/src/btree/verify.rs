//! Full structural check of a tree.

use super::constants::{HALF_NODE, MAX_DEPTH};
use super::tree::BTree;
use super::types::{check_record, index_child, record_key};
use bstar_cache::LockMode;
use bstar_common::{BStarError, NodeKind, Result};
use std::cmp::Ordering;
use tracing::warn;

/// What [`BTree::verify`] found in a consistent tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeReport {
    pub depth: u16,
    pub records: u64,
    pub leaf_nodes: u32,
    pub index_nodes: u32,
    pub map_nodes: u32,
    /// Nodes marked in use in the bitmap.
    pub allocated: u32,
    /// Non-root leaves with more than half their space free.
    pub underfull_leaves: u32,
}

fn fail(reason: String) -> BStarError {
    warn!(%reason, "verification failed");
    BStarError::TreeCorrupted(reason)
}

impl BTree {
    /// Walks every level of the tree and the allocation bitmap.
    ///
    /// Structural changes are held off for the duration. Leaf-only updates
    /// running at the same time can make the record count disagree, so
    /// exact results need a quiet tree.
    pub fn verify(&self) -> Result<TreeReport> {
        let _reshape = self.reshape.lock();
        let header = self.meta_snapshot();
        let mut report = TreeReport {
            depth: header.depth,
            ..Default::default()
        };
        let mut reachable: Vec<u32> = Vec::new();

        if header.depth > MAX_DEPTH {
            return Err(fail(format!("depth {} too large", header.depth)));
        }

        // each entry: node number and the key its parent holds for it
        let mut level_nodes: Vec<(u32, Option<Vec<u8>>)> = if header.depth == 0 {
            Vec::new()
        } else {
            vec![(header.root, None)]
        };
        for level in 0..header.depth as usize {
            let height = header.depth as usize - level;
            let leaf_level = height == 1;
            let mut next_level = Vec::new();
            let mut prev_num = 0u32;
            let mut prev_key: Option<Vec<u8>> = None;

            for (i, (num, parent_key)) in level_nodes.iter().enumerate() {
                if reachable.contains(num) {
                    return Err(fail(format!("node {} reached twice", num)));
                }
                reachable.push(*num);
                let node = self.fetch(*num, LockMode::Read)?;
                let buf = node.read();
                buf.validate()
                    .map_err(|reason| fail(format!("node {}: {}", num, reason)))?;

                let expected = if leaf_level {
                    NodeKind::Leaf
                } else {
                    NodeKind::Index
                };
                if buf.kind() != expected || buf.height() as usize != height {
                    return Err(fail(format!(
                        "node {} is {} at height {}, expected {} at height {}",
                        num,
                        buf.kind(),
                        buf.height(),
                        expected,
                        height
                    )));
                }
                let n = buf.num_records();
                if n == 0 {
                    return Err(fail(format!("node {} is empty", num)));
                }
                if buf.blink() != prev_num {
                    return Err(fail(format!(
                        "node {} links back to {}, expected {}",
                        num,
                        buf.blink(),
                        prev_num
                    )));
                }
                let next_num = level_nodes.get(i + 1).map_or(0, |(n, _)| *n);
                if buf.flink() != next_num {
                    return Err(fail(format!(
                        "node {} links forward to {}, expected {}",
                        num,
                        buf.flink(),
                        next_num
                    )));
                }

                for r in 0..n {
                    let rec = buf.record(r);
                    check_record(*num, rec, self.key_len(), !leaf_level)?;
                    let key = record_key(rec);
                    if let Some(prev) = &prev_key {
                        if self.compare.compare(prev, key) != Ordering::Less {
                            return Err(fail(format!("keys out of order at node {} record {}", num, r)));
                        }
                    }
                    if r == 0 {
                        if let Some(parent_key) = parent_key {
                            if self.compare.compare(parent_key, key) != Ordering::Equal {
                                return Err(fail(format!(
                                    "parent key of node {} differs from its first key",
                                    num
                                )));
                            }
                        }
                    }
                    if !leaf_level {
                        next_level.push((index_child(rec), Some(key.to_vec())));
                    }
                    prev_key = Some(key.to_vec());
                }

                if leaf_level {
                    report.leaf_nodes += 1;
                    report.records += n as u64;
                    if level > 0 && buf.free_space() > HALF_NODE {
                        report.underfull_leaves += 1;
                    }
                } else {
                    report.index_nodes += 1;
                }
                prev_num = *num;
            }

            if leaf_level {
                let first = level_nodes.first().map_or(0, |(n, _)| *n);
                let last = level_nodes.last().map_or(0, |(n, _)| *n);
                if first != header.first_leaf || last != header.last_leaf {
                    return Err(fail(format!(
                        "leaf chain runs {}..{}, header says {}..{}",
                        first, last, header.first_leaf, header.last_leaf
                    )));
                }
            }
            level_nodes = next_level;
        }

        if report.records != header.records as u64 {
            return Err(fail(format!(
                "found {} records, header says {}",
                report.records, header.records
            )));
        }

        self.verify_bitmap(&reachable, &mut report)?;
        Ok(report)
    }

    fn verify_bitmap(&self, reachable: &[u32], report: &mut TreeReport) -> Result<()> {
        let _alloc = self.alloc.lock();
        let header = self.meta_snapshot();

        let mut used = vec![0u32];
        let mut next = self.header.read().flink();
        while next != 0 {
            if used.contains(&next) {
                return Err(fail(format!("map chain revisits node {}", next)));
            }
            used.push(next);
            let node = self.fetch(next, LockMode::None)?;
            let flink = node.read().flink();
            next = flink;
        }
        report.map_nodes = (used.len() - 1) as u32;
        used.extend_from_slice(reachable);

        for &num in &used {
            if !self.is_allocated(num)? {
                return Err(fail(format!("node {} is in use but free in the bitmap", num)));
            }
        }
        let allocated = self.count_allocated()?;
        report.allocated = allocated;
        if allocated != header.total_nodes - header.free_nodes {
            return Err(fail(format!(
                "{} nodes allocated, header counts {} of {} free",
                allocated, header.free_nodes, header.total_nodes
            )));
        }
        if allocated as usize != used.len() {
            return Err(fail(format!(
                "{} nodes allocated but {} in use",
                allocated,
                used.len()
            )));
        }
        Ok(())
    }
}
