//! Utility functions.

use crate::header::{DSIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, WSIZE};

/// Returns the smallest integer `z` such that `z ≥ x` and `z = y.k` for some integer `k`.
/// or `None` if that integer can not be contained in a `usize`.
///
/// # Panics
/// Panics if `y` is 0.
#[inline]
pub fn find_divisible(x: usize, y: usize) -> Option<usize> {
    if x % y == 0 {
        Some(x)
    } else {
        ((x / y) * y).checked_add(y)
    }
}

/// Rounds `size` up to the payload alignment.
#[inline]
pub fn align8(size: usize) -> Option<usize> {
    find_divisible(size, DSIZE)
}

/// Turns a requested payload size into the size of the block that holds it:
/// header overhead is added, the result is aligned and never below
/// [`MIN_BLOCK_SIZE`]. Returns `None` when the block would not fit in a header.
#[inline]
pub fn adjust_size(size: usize) -> Option<usize> {
    let with_header = size.checked_add(WSIZE)?;
    let adjusted = match with_header <= MIN_BLOCK_SIZE {
        true => MIN_BLOCK_SIZE,
        false => align8(with_header)?,
    };
    (adjusted <= MAX_BLOCK_SIZE).then_some(adjusted)
}
