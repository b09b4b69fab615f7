//! Ordered iteration over the leaf chain.

use super::path::{Intent, SearchPath};
use super::search::{find, successor, Step};
use super::tree::BTree;
use super::types::{leaf_data, record_key};
use bstar_cache::LockMode;
use bstar_common::{BStarError, Result};
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::VecDeque;
use tracing::trace;

#[derive(Debug, Clone)]
enum Start {
    First,
    From(Bytes),
}

/// Ordered scan over `(key, data)` pairs.
///
/// The scan copies out one leaf at a time and holds no latch between calls
/// to `next`, so the tree may be modified while it is alive. It is not a
/// snapshot: after a leaf is consumed the scan resumes from the first key
/// greater than the last one returned, and sees whatever the tree holds at
/// that moment.
pub struct Scan<'t> {
    tree: &'t BTree,
    start: Start,
    last_key: Option<Bytes>,
    buffered: VecDeque<(Bytes, Bytes)>,
    done: bool,
}

impl BTree {
    /// Scans every record in key order.
    pub fn iter(&self) -> Scan<'_> {
        Scan::new(self, Start::First)
    }

    /// Scans records with keys not below `key`, in key order.
    pub fn range_from(&self, key: &[u8]) -> Scan<'_> {
        Scan::new(self, Start::From(Bytes::copy_from_slice(key)))
    }
}

impl<'t> Scan<'t> {
    fn new(tree: &'t BTree, start: Start) -> Self {
        Self {
            tree,
            start,
            last_key: None,
            buffered: VecDeque::new(),
            done: false,
        }
    }

    /// Positions a read path at the first record to return, or None at the
    /// end of the tree.
    fn start_path(&self) -> Result<Option<SearchPath<'t>>> {
        match (&self.last_key, &self.start) {
            (Some(last), _) => seek(self.tree, last, false),
            (None, Start::From(key)) => seek(self.tree, key, true),
            (None, Start::First) => match SearchPath::first_leaf(self.tree) {
                Ok(path) => Ok(Some(path)),
                Err(BStarError::EmptyTree) => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    /// Copies the rest of the current leaf into the buffer.
    fn fill(&mut self) -> Result<bool> {
        let path = match self.start_path()? {
            Some(path) => path,
            None => return Ok(false),
        };
        let (node, record) = path.leaf()?;
        let buf = node.read();
        for i in record..buf.num_records() {
            let rec = buf.record(i);
            self.buffered.push_back((
                Bytes::copy_from_slice(record_key(rec)),
                Bytes::copy_from_slice(leaf_data(rec)),
            ));
        }
        Ok(!self.buffered.is_empty())
    }
}

impl Iterator for Scan<'_> {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffered.is_empty() {
            if self.done {
                return None;
            }
            match self.fill() {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        let (key, data) = self.buffered.pop_front()?;
        self.last_key = Some(key.clone());
        Some(Ok((key, data)))
    }
}

/// Finds the first record whose key is above `key`, or not below it when
/// `inclusive`.
///
/// Searches again if a concurrent split or merge moves the next leaf while
/// the walk is between leaves.
fn seek<'t>(tree: &'t BTree, key: &[u8], inclusive: bool) -> Result<Option<SearchPath<'t>>> {
    loop {
        let located = match find(tree, key, Intent::Read, LockMode::Read, false) {
            Ok(located) => located,
            Err(BStarError::EmptyTree) => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut path = located.path;
        let before_first = path.elems[path.leaf_level()].before_first;
        if before_first || (located.exact && inclusive) {
            return Ok(Some(path));
        }
        match successor(&mut path, 1)? {
            Step::Moved if past(tree, &path, key)? => return Ok(Some(path)),
            Step::End => return Ok(None),
            Step::Moved | Step::Stale => {
                trace!("leaf chain moved under scan, searching again");
                continue;
            }
        }
    }
}

/// True if the record selected by `path` sorts after `key`. A leaf freed and
/// reused while the walk held no latch can pass the link checks but not this.
fn past(tree: &BTree, path: &SearchPath<'_>, key: &[u8]) -> Result<bool> {
    let (node, record) = path.leaf()?;
    let buf = node.read();
    Ok(tree.compare.compare(record_key(buf.record(record)), key) == Ordering::Greater)
}
