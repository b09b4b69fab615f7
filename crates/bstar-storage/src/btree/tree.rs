//! Tree lifecycle and point operations.

use super::header::{init_header_node, read_header_node, write_header_node, HeaderRecord};
use super::path::Intent;
use super::constants::HALF_NODE;
use super::records::{remove_record, replace_record};
use super::search;
use super::types::{build_leaf_record, compare_bytes, leaf_data, KeyCompare};
use bstar_cache::{CacheStats, LockMode, NodeCache, NodeRef};
use bstar_common::{BStarError, ChildLink, NodeDevice, NodeKind, Result, TreeConfig};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Header fields plus the in-memory count of nodes promised to in-flight
/// inserts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TreeMeta {
    pub header: HeaderRecord,
    pub reserved: u32,
}

/// Disk-resident B*-tree over a [`NodeDevice`].
///
/// Keys are ordered by a caller-supplied [`KeyCompare`]. All operations take
/// `&self` and may run from many threads at once.
pub struct BTree {
    /// Node cache over the device.
    pub(crate) cache: Arc<NodeCache>,
    /// Key ordering.
    pub(crate) compare: Arc<dyn KeyCompare>,
    /// Effective configuration. `key_len` always matches the header.
    pub(crate) config: TreeConfig,
    /// Node 0, resident for the life of the tree.
    pub(crate) header: NodeRef,
    /// Current root, resident while it is the root.
    pub(crate) root: Mutex<Option<NodeRef>>,
    /// Authoritative copy of the header record.
    pub(crate) meta: Mutex<TreeMeta>,
    /// Serializes bitmap changes and storage extension.
    pub(crate) alloc: Mutex<()>,
    /// Held by operations that split, rebalance or collapse nodes.
    pub(crate) reshape: Mutex<()>,
    /// Odd while a [`ReshapeGuard`] is alive, bumped on every take and
    /// release. Lets lock-free readers tell a moved sibling link from a
    /// broken one.
    pub(crate) reshape_seq: AtomicU64,
}

/// The reshape lock, with the sequence counter kept odd while it is held.
pub(crate) struct ReshapeGuard<'t> {
    seq: &'t AtomicU64,
    _lock: MutexGuard<'t, ()>,
}

impl Drop for ReshapeGuard<'_> {
    fn drop(&mut self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
    }
}

/// Snapshot of tree-wide counters.
#[derive(Debug, Clone)]
pub struct TreeStats {
    pub depth: u16,
    pub records: u32,
    pub root: u32,
    pub first_leaf: u32,
    pub last_leaf: u32,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub key_len: u16,
    pub cache: CacheStats,
}

impl BTree {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Creates a new empty tree on an empty device, ordered bytewise.
    pub fn create(device: Arc<dyn NodeDevice>, config: TreeConfig) -> Result<Self> {
        Self::create_with(device, config, Arc::new(compare_bytes))
    }

    /// Creates a new empty tree on an empty device.
    pub fn create_with(
        device: Arc<dyn NodeDevice>,
        config: TreeConfig,
        compare: Arc<dyn KeyCompare>,
    ) -> Result<Self> {
        config.validate()?;
        let existing = device.node_count();
        if existing != 0 {
            return Err(BStarError::ConfigError(format!(
                "device already holds {} nodes",
                existing
            )));
        }
        let total = device.extend(config.initial_nodes)?;
        if total < 2 {
            return Err(BStarError::NoSpace);
        }

        let cache = NodeCache::new(Arc::clone(&device));
        let record = HeaderRecord::new(config.key_len, total, total - 1);
        let mut header = cache.create(0, NodeKind::Header, 0)?;
        {
            let mut buf = header.write();
            init_header_node(&mut buf, &record);
        }
        header.commit();
        header.relock(LockMode::None);
        cache.stick(&header);

        let tree = Self {
            cache,
            compare,
            config,
            header,
            root: Mutex::new(None),
            meta: Mutex::new(TreeMeta {
                header: record,
                reserved: 0,
            }),
            alloc: Mutex::new(()),
            reshape: Mutex::new(()),
            reshape_seq: AtomicU64::new(0),
        };
        {
            let _alloc = tree.alloc.lock();
            tree.ensure_map_coverage()?;
        }
        tree.write_alternate()?;
        tree.flush()?;
        debug!(total_nodes = total, key_len = tree.config.key_len, "created tree");
        Ok(tree)
    }

    /// Opens an existing tree, ordered bytewise.
    pub fn open(device: Arc<dyn NodeDevice>, config: TreeConfig) -> Result<Self> {
        Self::open_with(device, config, Arc::new(compare_bytes))
    }

    /// Opens an existing tree.
    ///
    /// The header's key length wins over the configured one.
    pub fn open_with(
        device: Arc<dyn NodeDevice>,
        mut config: TreeConfig,
        compare: Arc<dyn KeyCompare>,
    ) -> Result<Self> {
        let count = device.node_count();
        if count == 0 {
            return Err(BStarError::corrupted("device holds no header node"));
        }

        let cache = NodeCache::new(Arc::clone(&device));
        let header = cache.find(0, LockMode::None)?;
        let record = {
            let buf = header.read();
            read_header_node(&buf)?
        };
        record.validate(count)?;
        if record.key_len != config.key_len {
            warn!(
                configured = config.key_len,
                on_disk = record.key_len,
                "key length differs from header, using header"
            );
            config.key_len = record.key_len;
        }
        config.validate()?;
        cache.stick(&header);

        let tree = Self {
            cache,
            compare,
            config,
            header,
            root: Mutex::new(None),
            meta: Mutex::new(TreeMeta {
                header: record,
                reserved: 0,
            }),
            alloc: Mutex::new(()),
            reshape: Mutex::new(()),
            reshape_seq: AtomicU64::new(0),
        };
        tree.check_map_chain()?;

        if record.root != 0 {
            let root = tree.fetch(record.root, LockMode::None)?;
            {
                let buf = root.read();
                let expected = if record.depth == 1 {
                    NodeKind::Leaf
                } else {
                    NodeKind::Index
                };
                if buf.kind() != expected || buf.height() as u16 != record.depth {
                    warn!(root = record.root, "root does not match tree depth");
                    return Err(BStarError::NodeCorrupted {
                        node: record.root,
                        reason: format!(
                            "root is a {} node at height {}, tree depth is {}",
                            buf.kind(),
                            buf.height(),
                            record.depth
                        ),
                    });
                }
            }
            tree.cache.stick(&root);
            *tree.root.lock() = Some(root);
        }

        debug!(
            depth = record.depth,
            records = record.records,
            total_nodes = record.total_nodes,
            "opened tree"
        );
        Ok(tree)
    }

    /// Writes back every dirty node and syncs the device.
    pub fn flush(&self) -> Result<usize> {
        {
            let meta = self.meta.lock();
            let mut buf = self.header.write();
            write_header_node(&mut buf, &meta.header);
        }
        self.header.commit();
        self.cache.flush()
    }

    /// Flushes and closes the tree.
    pub fn close(self) -> Result<()> {
        self.flush()?;
        Ok(())
    }

    // =========================================================================
    // Point operations
    // =========================================================================

    /// Returns the data stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.check_key(key)?;
        let located = match search::find(self, key, Intent::Read, LockMode::Read, true) {
            Ok(located) => located,
            Err(BStarError::KeyNotFound) | Err(BStarError::EmptyTree) => return Ok(None),
            Err(e) => return Err(e),
        };
        let (node, record) = located.path.leaf()?;
        let buf = node.read();
        Ok(Some(Bytes::copy_from_slice(leaf_data(buf.record(record)))))
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Replaces the data stored under an existing key.
    ///
    /// The record is rewritten in place when its leaf can hold the new size.
    /// A larger record that does not fit splits the leaf, and a smaller one
    /// that leaves the leaf underfull rebalances it. Either way the key is
    /// never absent, and a failure such as [`BStarError::NoSpace`] leaves the
    /// old data in place.
    pub fn update(&self, key: &[u8], data: &[u8]) -> Result<()> {
        self.check_key(key)?;
        let record = build_leaf_record(key, data);
        self.check_record_size(record.len())?;

        let mut intent = Intent::Read;
        let mut reshape: Option<ReshapeGuard<'_>> = None;
        loop {
            let located = match search::find(self, key, intent, LockMode::Reserve, true) {
                Ok(located) => located,
                Err(BStarError::EmptyTree) => return Err(BStarError::KeyNotFound),
                Err(e) => return Err(e),
            };
            let mut path = located.path;
            let level = path.leaf_level();
            let idx = path.elems[level].record;
            let (old, free) = {
                let buf = path.node(level)?.read();
                (buf.record_size(idx), buf.free_space())
            };
            // the path must retain the ancestors a split or merge will touch
            let wanted = match record.len().cmp(&old) {
                std::cmp::Ordering::Equal => Intent::Read,
                std::cmp::Ordering::Greater => Intent::Insert { size: record.len() },
                std::cmp::Ordering::Less => Intent::Delete,
            };
            if wanted != intent {
                intent = wanted;
                continue;
            }

            let fits = free + old >= record.len();
            let underflows = fits && level > 0 && free + old - record.len() > HALF_NODE;
            if fits && !underflows {
                path.lock_leaf();
                let node = path.node(level)?;
                let placed = {
                    let mut buf = node.write();
                    replace_record(&mut buf, idx, &record)
                };
                if !placed {
                    return Err(BStarError::Internal(format!(
                        "leaf {} has no room for a record that fit during search",
                        node.num()
                    )));
                }
                node.commit();
                return Ok(());
            }

            if reshape.is_none() {
                drop(path);
                reshape = Some(self.lock_reshape());
                continue;
            }

            if fits {
                path.lock_all();
                {
                    let node = path.node(level)?;
                    {
                        let mut buf = node.write();
                        replace_record(&mut buf, idx, &record);
                    }
                    node.commit();
                }
                return self.rebalance(&path, level, false);
            }

            let mut res = match self.reserve(path.retained() as u32 + 1) {
                Some(res) => res,
                None => {
                    drop(path);
                    self.extend_storage()?;
                    continue;
                }
            };
            path.lock_all();
            {
                let node = path.node(level)?;
                {
                    let mut buf = node.write();
                    remove_record(&mut buf, idx);
                }
                node.commit();
            }
            debug!(key_len = key.len(), size = record.len(), "update splits leaf");
            return self.insert_at(&mut path, level, idx, &record, &mut res);
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Number of records.
    pub fn len(&self) -> u64 {
        self.meta.lock().header.records as u64
    }

    pub fn is_empty(&self) -> bool {
        self.meta.lock().header.records == 0
    }

    /// Number of levels, 0 when empty.
    pub fn depth(&self) -> u16 {
        self.meta.lock().header.depth
    }

    /// Effective configuration.
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn key_len(&self) -> usize {
        self.config.key_len as usize
    }

    /// Returns a snapshot of the tree counters.
    pub fn stats(&self) -> TreeStats {
        let header = self.meta.lock().header;
        TreeStats {
            depth: header.depth,
            records: header.records,
            root: header.root,
            first_leaf: header.first_leaf,
            last_leaf: header.last_leaf,
            total_nodes: header.total_nodes,
            free_nodes: header.free_nodes,
            key_len: header.key_len,
            cache: self.cache.stats(),
        }
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.key_len() {
            return Err(BStarError::KeyTooLarge {
                size: key.len(),
                max: self.key_len(),
            });
        }
        Ok(())
    }

    pub(crate) fn check_record_size(&self, size: usize) -> Result<()> {
        if size > super::constants::MAX_RECORD_SIZE {
            return Err(BStarError::RecordTooLarge {
                size,
                max: super::constants::MAX_RECORD_SIZE,
            });
        }
        Ok(())
    }

    /// Returns a copy of the header record.
    pub(crate) fn meta_snapshot(&self) -> HeaderRecord {
        self.meta.lock().header
    }

    pub(crate) fn root_and_depth(&self) -> (u32, u16) {
        let meta = self.meta.lock();
        (meta.header.root, meta.header.depth)
    }

    pub(crate) fn total_nodes(&self) -> u32 {
        self.meta.lock().header.total_nodes
    }

    /// Takes the reshape lock for a structural change.
    pub(crate) fn lock_reshape(&self) -> ReshapeGuard<'_> {
        let lock = self.reshape.lock();
        self.reshape_seq.fetch_add(1, Ordering::AcqRel);
        ReshapeGuard {
            seq: &self.reshape_seq,
            _lock: lock,
        }
    }

    /// Current reshape sequence number.
    pub(crate) fn reshape_seq(&self) -> u64 {
        self.reshape_seq.load(Ordering::Acquire)
    }

    /// True if a structural change was running at `seq` or has run since.
    pub(crate) fn reshaped_since(&self, seq: u64) -> bool {
        seq % 2 == 1 || self.reshape_seq() != seq
    }

    /// Fetches a tree node after checking the link against the node count.
    pub(crate) fn fetch(&self, num: u32, mode: LockMode) -> Result<NodeRef> {
        let link = ChildLink::new(num, self.total_nodes())?;
        self.cache.find(link.get(), mode)
    }

    /// Applies `f` to the header record and writes it into node 0.
    pub(crate) fn update_meta<R>(&self, f: impl FnOnce(&mut TreeMeta) -> R) -> R {
        let result = {
            let mut meta = self.meta.lock();
            let result = f(&mut meta);
            let mut buf = self.header.write();
            write_header_node(&mut buf, &meta.header);
            result
        };
        self.header.commit();
        result
    }

    /// Makes `node` the resident root, or clears it for an empty tree.
    pub(crate) fn set_root(&self, node: Option<&NodeRef>) {
        let new_root = node.map(|n| {
            let held = n.share();
            self.cache.stick(&held);
            held
        });
        let old = std::mem::replace(&mut *self.root.lock(), new_root);
        if let Some(old) = old {
            let slot = Arc::clone(old.cached());
            drop(old);
            let still_root = self
                .root
                .lock()
                .as_ref()
                .map_or(false, |r| Arc::ptr_eq(r.cached(), &slot));
            if !still_root {
                self.cache.unstick(&slot);
            }
        }
    }

    /// Mirrors node 0 to the device's alternate location.
    pub(crate) fn write_alternate(&self) -> Result<()> {
        if !self.config.write_alternate {
            return Ok(());
        }
        let bytes = {
            let meta = self.meta.lock();
            let mut buf = self.header.write();
            write_header_node(&mut buf, &meta.header);
            buf.sync_descriptor();
            Box::new(*buf.as_bytes())
        };
        let device = self.cache.device();
        device.write_alternate(&bytes)?;
        device.sync()
    }
}

impl Drop for BTree {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "flush on drop failed");
        }
    }
}

impl std::fmt::Debug for BTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let header = self.meta_snapshot();
        f.debug_struct("BTree")
            .field("depth", &header.depth)
            .field("records", &header.records)
            .field("root", &header.root)
            .field("total_nodes", &header.total_nodes)
            .field("free_nodes", &header.free_nodes)
            .finish()
    }
}
