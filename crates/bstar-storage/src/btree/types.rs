//! Common types for the B*-tree: key ordering, record encoding and path flags.

use super::constants::CHILD_PTR_SIZE;
use bstar_common::config::round_even;
use bstar_common::{BStarError, Result};
use std::cmp::Ordering;

/// Total order over keys, supplied by the tree's owner.
pub trait KeyCompare: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

impl<F> KeyCompare for F
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    #[inline]
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self(a, b)
    }
}

/// Lexicographic byte order using a u64 prefix for 8+ byte keys.
/// Falls back to slice comparison for shorter keys or when the prefix matches.
#[inline(always)]
pub fn compare_bytes(a: &[u8], b: &[u8]) -> Ordering {
    // For 8+ byte keys, compare first 8 bytes as u64 (big-endian for sort order)
    if a.len() >= 8 && b.len() >= 8 {
        let a_prefix = u64::from_be_bytes([a[0], a[1], a[2], a[3], a[4], a[5], a[6], a[7]]);
        let b_prefix = u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
        if a_prefix != b_prefix {
            return a_prefix.cmp(&b_prefix);
        }
        if a.len() == 8 && b.len() == 8 {
            return Ordering::Equal;
        }
    }
    a.cmp(b)
}

/// Flags computed for each path element while descending.
///
/// They record what an update at this element could do to its ancestors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathFlags(u8);

impl PathFlags {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// The selected record is the node's first; changing it changes the
    /// key the parent holds for this node.
    pub const FIRST: PathFlags = PathFlags(0b0000_0001);
    /// Adding a record here would not fit.
    pub const OVERFLOW: PathFlags = PathFlags(0b0000_0010);
    /// Removing the selected record would leave the node under half full.
    pub const UNDERFLOW: PathFlags = PathFlags(0b0000_0100);

    #[inline]
    pub const fn contains(self, other: PathFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: PathFlags) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn insert(&mut self, other: PathFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for PathFlags {
    type Output = PathFlags;

    fn bitor(self, rhs: PathFlags) -> PathFlags {
        PathFlags(self.0 | rhs.0)
    }
}

// Record encoding
//
// Leaf:  [len][key][pad to even][data]
// Index: [len][key][zero pad to round_even(1 + key_len)][child: u32 BE]

/// Bytes taken by the length byte and a key of `len` bytes, padded to even.
#[inline]
pub fn key_area_len(len: usize) -> usize {
    round_even(1 + len)
}

/// Size of every index record in a tree with maximum key length `key_len`.
#[inline]
pub fn index_record_size(key_len: usize) -> usize {
    key_area_len(key_len) + CHILD_PTR_SIZE
}

/// Size of the leaf record for `key` and `data`.
#[inline]
pub fn leaf_record_size(key: &[u8], data: &[u8]) -> usize {
    key_area_len(key.len()) + data.len()
}

/// Encodes a leaf record.
pub fn build_leaf_record(key: &[u8], data: &[u8]) -> Vec<u8> {
    let area = key_area_len(key.len());
    let mut rec = vec![0u8; area + data.len()];
    rec[0] = key.len() as u8;
    rec[1..1 + key.len()].copy_from_slice(key);
    rec[area..].copy_from_slice(data);
    rec
}

/// Encodes an index record pointing at `child`.
pub fn build_index_record(key: &[u8], child: u32, key_len: usize) -> Vec<u8> {
    let area = key_area_len(key_len);
    let mut rec = vec![0u8; area + CHILD_PTR_SIZE];
    rec[0] = key.len() as u8;
    rec[1..1 + key.len()].copy_from_slice(key);
    rec[area..].copy_from_slice(&child.to_be_bytes());
    rec
}

/// Returns the key of a record. A length byte overrunning the record is
/// clamped; [`check_record`] reports it as corruption.
#[inline]
pub fn record_key(rec: &[u8]) -> &[u8] {
    if rec.is_empty() {
        return rec;
    }
    let len = (rec[0] as usize).min(rec.len() - 1);
    &rec[1..1 + len]
}

/// Returns the data portion of a leaf record.
#[inline]
pub fn leaf_data(rec: &[u8]) -> &[u8] {
    if rec.is_empty() {
        return rec;
    }
    let start = key_area_len(rec[0] as usize).min(rec.len());
    &rec[start..]
}

/// Returns the child node number of an index record.
#[inline]
pub fn index_child(rec: &[u8]) -> u32 {
    if rec.len() < CHILD_PTR_SIZE {
        return 0;
    }
    let p = rec.len() - CHILD_PTR_SIZE;
    u32::from_be_bytes([rec[p], rec[p + 1], rec[p + 2], rec[p + 3]])
}

/// Overwrites the key of an index record in place, keeping its child.
pub fn set_index_key(rec: &mut [u8], key: &[u8]) {
    let area = rec.len() - CHILD_PTR_SIZE;
    rec[..area].fill(0);
    rec[0] = key.len() as u8;
    rec[1..1 + key.len()].copy_from_slice(key);
}

/// Checks a record read from node `node` against the tree's key length.
pub fn check_record(node: u32, rec: &[u8], key_len: usize, index: bool) -> Result<()> {
    if rec.is_empty() {
        return Err(BStarError::NodeCorrupted {
            node,
            reason: "empty record".to_string(),
        });
    }
    let len = rec[0] as usize;
    if len > key_len {
        return Err(BStarError::NodeCorrupted {
            node,
            reason: format!("key length {} exceeds tree key length {}", len, key_len),
        });
    }
    let expected_min = if index {
        index_record_size(key_len)
    } else {
        key_area_len(len)
    };
    if (index && rec.len() != expected_min) || rec.len() < expected_min {
        return Err(BStarError::NodeCorrupted {
            node,
            reason: format!("record of {} bytes is malformed", rec.len()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_bytes() {
        assert_eq!(compare_bytes(b"abc", b"abd"), Ordering::Less);
        assert_eq!(compare_bytes(b"abc", b"abc"), Ordering::Equal);
        assert_eq!(compare_bytes(b"abcdefgh1", b"abcdefgh"), Ordering::Greater);
        assert_eq!(compare_bytes(b"abcdefgh", b"abcdefgi"), Ordering::Less);
        assert_eq!(compare_bytes(b"", b"a"), Ordering::Less);
    }

    #[test]
    fn test_closure_comparator() {
        let reverse = |a: &[u8], b: &[u8]| b.cmp(a);
        assert_eq!(reverse.compare(b"a", b"b"), Ordering::Greater);
        assert_eq!(compare_bytes.compare(b"a", b"b"), Ordering::Less);
    }

    #[test]
    fn test_path_flags() {
        let mut flags = PathFlags::empty();
        assert!(flags.is_empty());
        flags.insert(PathFlags::FIRST);
        flags.insert(PathFlags::OVERFLOW);
        assert!(flags.contains(PathFlags::FIRST | PathFlags::OVERFLOW));
        assert!(flags.intersects(PathFlags::OVERFLOW | PathFlags::UNDERFLOW));
        assert!(!flags.intersects(PathFlags::UNDERFLOW));
    }

    #[test]
    fn test_leaf_record_layout() {
        let rec = build_leaf_record(b"key", b"data");
        // 1 + 3 = 4, already even
        assert_eq!(rec, b"\x03keydata");
        assert_eq!(record_key(&rec), b"key");
        assert_eq!(leaf_data(&rec), b"data");

        let rec = build_leaf_record(b"ab", b"xy");
        // 1 + 2 = 3 -> padded to 4
        assert_eq!(rec, b"\x02ab\x00xy");
        assert_eq!(leaf_data(&rec), b"xy");
        assert_eq!(leaf_record_size(b"ab", b"xy"), 6);
    }

    #[test]
    fn test_index_record_layout() {
        let rec = build_index_record(b"k1", 0x0102_0304, 7);
        // key area round_even(8) = 8, then child
        assert_eq!(rec.len(), 12);
        assert_eq!(rec.len(), index_record_size(7));
        assert_eq!(record_key(&rec), b"k1");
        assert_eq!(index_child(&rec), 0x0102_0304);
    }

    #[test]
    fn test_set_index_key() {
        let mut rec = build_index_record(b"long-key", 9, 8);
        set_index_key(&mut rec, b"k");
        assert_eq!(record_key(&rec), b"k");
        assert_eq!(index_child(&rec), 9);
        // stale key bytes are cleared
        assert!(rec[2..10].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_record_key_clamps_bad_length() {
        let rec = [200u8, 1, 2];
        assert_eq!(record_key(&rec), &[1, 2]);
        assert_eq!(record_key(&[]), &[] as &[u8]);
    }

    #[test]
    fn test_check_record() {
        let leaf = build_leaf_record(b"abc", b"d");
        assert!(check_record(1, &leaf, 8, false).is_ok());
        assert!(check_record(1, &leaf, 2, false).is_err());

        let index = build_index_record(b"abc", 4, 8);
        assert!(check_record(1, &index, 8, true).is_ok());
        // index records must be exactly the fixed size
        assert!(check_record(1, &index[..index.len() - 1], 8, true).is_err());
        assert!(check_record(1, &[], 8, false).is_err());
    }
}
