//! Defines the segregated [`FreeLists`] and the size-class mapping.
//!
//! The lists are intrusive and singly linked. Their heads live in a small
//! table at the very start of the heap and every free block stores the
//! offset of its successor in the first word of its payload. Because
//! offset `0` always falls inside the head table it doubles as the empty
//! sentinel [`NIL`].

use static_assertions::const_assert;
use tracing::{debug, error, instrument, Level};

use crate::growers::Grower;
use crate::header::{LINK_SIZE, MIN_BLOCK_SIZE};
use crate::heap::Heap;

/// Number of size classes.
pub const FREELIST_COUNT: usize = 8;
/// Size of the head table at the start of the heap.
pub const TABLE_SIZE: usize = FREELIST_COUNT * LINK_SIZE;
/// Link value terminating a list.
pub const NIL: usize = 0;

const FIRST_CLASS_SHIFT: u32 = MIN_BLOCK_SIZE.trailing_zeros();

/// Smallest size filed in the last, unbounded bucket.
pub const LAST_CLASS_MIN: usize = 1 << (FIRST_CLASS_SHIFT as usize + FREELIST_COUNT - 1);

const_assert!(MIN_BLOCK_SIZE.is_power_of_two());
const_assert!(LAST_CLASS_MIN == 2048);

/// Maps a block size to the index of the bucket holding blocks of that size.
///
/// Bucket `i` holds sizes in `[2^(4+i), 2^(5+i))`, the last one everything
/// from [`LAST_CLASS_MIN`] upwards.
#[inline]
pub fn bucket_for(size: usize) -> usize {
    if size >= LAST_CLASS_MIN {
        return FREELIST_COUNT - 1;
    }
    (size.max(MIN_BLOCK_SIZE).ilog2() - FIRST_CLASS_SHIFT) as usize
}

/// The table of bucket heads, anchored at `table` in the heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreeLists {
    table: usize,
}

impl FreeLists {
    pub const fn new(table: usize) -> Self {
        FreeLists { table }
    }

    /// Offset of the head cell of bucket `index`.
    #[inline(always)]
    pub const fn head_cell(&self, index: usize) -> usize {
        self.table + index * LINK_SIZE
    }

    /// First offset past the head table.
    #[inline(always)]
    pub const fn end(&self) -> usize {
        self.table + TABLE_SIZE
    }

    /// Empties every bucket.
    pub fn clear<G: Grower>(&self, heap: &mut Heap<G>) {
        for index in 0..FREELIST_COUNT {
            heap.set_link(self.head_cell(index), NIL);
        }
    }

    /// Pushes the free block at `bp` onto the front of its bucket.
    /// This operation has a time complexity of *O*(1).
    ///
    /// The block header must already carry its final size, which selects the bucket.
    #[instrument(level = "trace", skip(self, heap))]
    pub fn insert<G: Grower>(&self, heap: &mut Heap<G>, bp: usize) {
        let size = heap.header(bp).size();
        let head = self.head_cell(bucket_for(size));
        debug_assert!(size >= MIN_BLOCK_SIZE);

        heap.set_link(bp, heap.get_link(head));
        heap.set_link(head, bp);
    }

    /// Unlinks the free block at `bp` from its bucket.
    /// This operation has a time complexity of *O*(n) in the bucket length,
    /// the predecessor has to be found by walking from the head.
    ///
    /// The block header must still carry the size it was inserted with.
    #[instrument(level = "trace", skip(self, heap))]
    pub fn remove<G: Grower>(&self, heap: &mut Heap<G>, bp: usize) {
        let mut cell = self.head_cell(bucket_for(heap.header(bp).size()));
        loop {
            let next = heap.get_link(cell);
            debug_assert_ne!(next, NIL, "Block {bp} should be in its bucket.");
            if next == NIL {
                error!(bp, "Block to unlink is missing from its bucket.");
                return;
            }
            if next == bp {
                let after = heap.get_link(bp);
                heap.set_link(cell, after);
                return;
            }
            cell = next;
        }
    }

    /// Iterates over the blocks of bucket `index`, head first.
    pub fn iter<'a, G: Grower>(&self, heap: &'a Heap<G>, index: usize) -> Iter<'a, G> {
        Iter {
            heap,
            cell: self.head_cell(index),
        }
    }

    /// First-fit search for a block of at least `asize` bytes, starting in the
    /// bucket `asize` belongs to and moving up through larger buckets.
    #[instrument(level = "debug", skip(self, heap), ret(level = Level::DEBUG))]
    pub fn find_fit<G: Grower>(&self, heap: &Heap<G>, asize: usize) -> Option<usize> {
        for index in bucket_for(asize)..FREELIST_COUNT {
            if let Some(bp) = self.iter(heap, index).find(|&bp| heap.header(bp).size() >= asize) {
                debug!(index, bp, "Found fit.");
                return Some(bp);
            }
        }
        None
    }
}

/// Iterator over the payload offsets of one bucket.
pub struct Iter<'a, G: Grower> {
    heap: &'a Heap<G>,
    cell: usize,
}

impl<G: Grower> Iterator for Iter<'_, G> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let next = self.heap.get_link(self.cell);
        if next == NIL {
            return None;
        }
        self.cell = next;
        Some(next)
    }
}
