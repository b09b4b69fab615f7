//! Bit scanning over allocation bitmaps.
//!
//! Bit 0 is the most significant bit of byte 0, so bitmap bytes read the same
//! on every host. Scans work in big-endian 32-bit words and never read past
//! the end of the slice.

/// Loads word `w` of the bitmap, treating bytes past the end as zero.
#[inline]
fn load_word(bits: &[u8], w: usize) -> u32 {
    let start = w * 4;
    let mut bytes = [0u8; 4];
    if start < bits.len() {
        let end = (start + 4).min(bits.len());
        bytes[..end - start].copy_from_slice(&bits[start..end]);
    }
    u32::from_be_bytes(bytes)
}

/// Returns the first bit at or after `start` whose value is `value`, or
/// `len` if there is none.
fn find_first(bits: &[u8], len: usize, start: usize, value: bool) -> usize {
    let len = len.min(bits.len() * 8);
    if start >= len {
        return len;
    }

    let mut w = start / 32;
    let load = |w: usize| {
        let word = load_word(bits, w);
        if value {
            word
        } else {
            !word
        }
    };
    let mut word = load(w) & (u32::MAX >> (start % 32));
    loop {
        if word != 0 {
            let pos = w * 32 + word.leading_zeros() as usize;
            return pos.min(len);
        }
        w += 1;
        if w * 32 >= len {
            return len;
        }
        word = load(w);
    }
}

/// Returns the index of the first clear bit at or after `start`, or `len`
/// if every remaining bit is set.
pub fn find_first_zero(bits: &[u8], len: usize, start: usize) -> usize {
    find_first(bits, len, start, false)
}

/// Returns the index of the first set bit at or after `start`, or `len`.
pub fn find_first_one(bits: &[u8], len: usize, start: usize) -> usize {
    find_first(bits, len, start, true)
}

/// Counts consecutive bits equal to `value` starting at `start`.
pub fn count_run(bits: &[u8], len: usize, start: usize, value: bool) -> usize {
    let len = len.min(bits.len() * 8);
    if start >= len {
        return 0;
    }
    find_first(bits, len, start, !value) - start
}

/// Counts the set bits in the first `len` bits.
pub fn count_ones(bits: &[u8], len: usize) -> usize {
    let len = len.min(bits.len() * 8);
    let mut total = 0;
    let mut pos = 0;
    while pos < len {
        pos = find_first_one(bits, len, pos);
        if pos >= len {
            break;
        }
        let ones = count_run(bits, len, pos, true);
        total += ones;
        pos += ones;
    }
    total
}

#[inline]
pub fn test_bit(bits: &[u8], bit: usize) -> bool {
    bits[bit / 8] & (0x80 >> (bit % 8)) != 0
}

#[inline]
pub fn set_bit(bits: &mut [u8], bit: usize) {
    bits[bit / 8] |= 0x80 >> (bit % 8);
}

#[inline]
pub fn clear_bit(bits: &mut [u8], bit: usize) {
    bits[bit / 8] &= !(0x80 >> (bit % 8));
}
