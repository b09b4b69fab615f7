//! Record-level node operations: insert, remove, bulk shifts between
//! siblings, split-point selection and balancing.
//!
//! All functions work on raw [`NodeBuf`]s and keep the offset table
//! consistent. Space checks are the caller's job except where a function
//! returns `bool`.

use bstar_common::{NodeBuf, DESCRIPTOR_SIZE, NODE_CAPACITY};

/// Inserts `rec` as record `idx`, shifting later records right.
///
/// Returns false, leaving the node untouched, if it does not fit.
pub fn insert_record(buf: &mut NodeBuf, idx: usize, rec: &[u8]) -> bool {
    let n = buf.num_records();
    if idx > n || buf.free_space() < rec.len() + 2 {
        return false;
    }
    let len = rec.len();
    let start = buf.offset(idx);
    let end = buf.offset(n);

    let data = buf.bytes_mut();
    data.copy_within(start..end, start + len);
    data[start..start + len].copy_from_slice(rec);

    for i in (idx + 1..=n + 1).rev() {
        let prev = buf.offset(i - 1);
        buf.set_offset(i, prev + len);
    }
    buf.set_num_records(n + 1);
    buf.sync_descriptor();
    true
}

/// Removes record `idx`, shifting later records left.
pub fn remove_record(buf: &mut NodeBuf, idx: usize) {
    let n = buf.num_records();
    debug_assert!(idx < n);
    let start = buf.offset(idx);
    let next = buf.offset(idx + 1);
    let end = buf.offset(n);
    let len = next - start;

    let data = buf.bytes_mut();
    data.copy_within(next..end, start);
    data[end - len..end].fill(0);

    for i in idx + 1..n {
        let following = buf.offset(i + 1);
        buf.set_offset(i, following - len);
    }
    buf.set_offset(n, 0);
    buf.set_num_records(n - 1);
    buf.sync_descriptor();
}

/// Replaces record `idx` with `rec`. Returns false if the node cannot hold
/// the new size.
pub fn replace_record(buf: &mut NodeBuf, idx: usize, rec: &[u8]) -> bool {
    if buf.record_size(idx) == rec.len() {
        buf.record_mut(idx).copy_from_slice(rec);
        return true;
    }
    if buf.free_space() + buf.record_size(idx) < rec.len() {
        return false;
    }
    remove_record(buf, idx);
    insert_record(buf, idx, rec)
}

/// Moves records `[first..]` of `left` to the front of `right`.
pub fn shift_right(left: &mut NodeBuf, right: &mut NodeBuf, first: usize) {
    let nl = left.num_records();
    let nr = right.num_records();
    debug_assert!(first <= nl);
    let count = nl - first;
    if count == 0 {
        return;
    }
    let src_start = left.offset(first);
    let src_end = left.offset(nl);
    let moved = src_end - src_start;
    debug_assert!(right.free_space() >= moved + 2 * count);

    // open a gap at the front of right
    let right_end = right.offset(nr);
    right
        .bytes_mut()
        .copy_within(DESCRIPTOR_SIZE..right_end, DESCRIPTOR_SIZE + moved);
    for i in (0..=nr).rev() {
        let off = right.offset(i);
        right.set_offset(i + count, off + moved);
    }
    right.bytes_mut()[DESCRIPTOR_SIZE..DESCRIPTOR_SIZE + moved]
        .copy_from_slice(&left.as_bytes()[src_start..src_end]);
    for j in 0..count {
        right.set_offset(j, DESCRIPTOR_SIZE + left.offset(first + j) - src_start);
    }
    right.set_num_records(nr + count);
    right.sync_descriptor();

    // cut the tail off left
    left.bytes_mut()[src_start..src_end].fill(0);
    for i in first + 1..=nl {
        left.set_offset(i, 0);
    }
    left.set_num_records(first);
    left.sync_descriptor();
}

/// Moves the first `count` records of `right` to the end of `left`.
pub fn shift_left(left: &mut NodeBuf, right: &mut NodeBuf, count: usize) {
    let nl = left.num_records();
    let nr = right.num_records();
    debug_assert!(count <= nr);
    if count == 0 {
        return;
    }
    let moved = right.offset(count) - DESCRIPTOR_SIZE;
    debug_assert!(left.free_space() >= moved + 2 * count);

    // append to left
    let left_end = left.offset(nl);
    left.bytes_mut()[left_end..left_end + moved]
        .copy_from_slice(&right.as_bytes()[DESCRIPTOR_SIZE..DESCRIPTOR_SIZE + moved]);
    for j in 1..=count {
        left.set_offset(nl + j, left_end + right.offset(j) - DESCRIPTOR_SIZE);
    }
    left.set_num_records(nl + count);
    left.sync_descriptor();

    // close the gap in right
    let right_end = right.offset(nr);
    right
        .bytes_mut()
        .copy_within(DESCRIPTOR_SIZE + moved..right_end, DESCRIPTOR_SIZE);
    right.bytes_mut()[right_end - moved..right_end].fill(0);
    for i in 0..=nr - count {
        let off = right.offset(i + count);
        right.set_offset(i, off - moved);
    }
    for i in nr - count + 1..=nr {
        right.set_offset(i, 0);
    }
    right.set_num_records(nr - count);
    right.sync_descriptor();
}

/// Picks where to split a sequence of records whose costs (record size plus
/// offset entry) are `sizes`.
///
/// Returns `s` such that records `[..s]` stay left and `[s..]` go right.
/// Walks the records until the running total exceeds half the combined size.
/// The record that crosses the midpoint goes right. The cut is then moved,
/// if needed, until both halves fit in a node.
pub fn choose_split(sizes: &[usize]) -> usize {
    let n = sizes.len();
    debug_assert!(n >= 2);
    let total: usize = sizes.iter().sum();
    let mid = total / 2;

    let mut prefix = vec![0usize; n + 1];
    for (i, size) in sizes.iter().enumerate() {
        prefix[i + 1] = prefix[i] + size;
    }

    let mut j = 0;
    while j < n && prefix[j + 1] <= mid {
        j += 1;
    }
    let mut split = j.clamp(1, n - 1);

    while split > 1 && prefix[split] > NODE_CAPACITY {
        split -= 1;
    }
    while split < n - 1 && total - prefix[split] > NODE_CAPACITY {
        split += 1;
    }
    split
}

/// Which node gave up records during [`balance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceMove {
    /// Nothing moved.
    None,
    /// Records moved from the right node to the left node.
    ToLeft(usize),
    /// Records moved from the left node to the right node.
    ToRight(usize),
}

impl BalanceMove {
    /// True if the right node's first record changed.
    pub fn changed_right_first(&self) -> bool {
        !matches!(self, BalanceMove::None)
    }
}

/// Moves records one at a time from the fuller node to the emptier one
/// while that brings their free space strictly closer. Neither node is ever
/// emptied.
pub fn balance(left: &mut NodeBuf, right: &mut NodeBuf) -> BalanceMove {
    let mut to_left = 0;
    let mut to_right = 0;
    loop {
        let fl = left.free_space();
        let fr = right.free_space();
        let gap = fl.abs_diff(fr);
        if fl > fr {
            if right.num_records() <= 1 {
                break;
            }
            let cost = right.record_size(0) + 2;
            if cost > fl || (fl - cost).abs_diff(fr + cost) >= gap {
                break;
            }
            shift_left(left, right, 1);
            to_left += 1;
        } else if fr > fl {
            let nl = left.num_records();
            if nl <= 1 {
                break;
            }
            let cost = left.record_size(nl - 1) + 2;
            if cost > fr || (fl + cost).abs_diff(fr - cost) >= gap {
                break;
            }
            shift_right(left, right, nl - 1);
            to_right += 1;
        } else {
            break;
        }
    }
    debug_assert!(to_left == 0 || to_right == 0);
    if to_left > 0 {
        BalanceMove::ToLeft(to_left)
    } else if to_right > 0 {
        BalanceMove::ToRight(to_right)
    } else {
        BalanceMove::None
    }
}
