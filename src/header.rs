//! Defines the [`Header`] word and the address arithmetic around it.
//!
//! Every block starts with a 4 byte header. Free blocks repeat the header
//! in a footer occupying their last 4 bytes so that the following block can
//! find its way back. Allocated blocks have no footer, the space is handed
//! out as payload instead.
//!
//! All addresses here are offsets into the heap arena and refer to a block's
//! *payload*, the header always lives [`WSIZE`] bytes before it.

use static_assertions::const_assert;

/// Size of a header/footer word.
pub const WSIZE: usize = 4;
/// Size of a double word, also the payload alignment.
pub const DSIZE: usize = 8;
/// Size of a free-list link stored in a free block's payload.
pub const LINK_SIZE: usize = 8;
/// Smallest block the allocator ever creates.
pub const MIN_BLOCK_SIZE: usize = 16;
/// Largest block size a header can describe.
pub const MAX_BLOCK_SIZE: usize = (u32::MAX & !SIZE_MASK_BITS) as usize;

const ALLOC_BIT: u32 = 0b001;
const PREV_ALLOC_BIT: u32 = 0b010;
const SIZE_MASK_BITS: u32 = 0b111;
const UNUSED_BITS: u32 = SIZE_MASK_BITS & !(ALLOC_BIT | PREV_ALLOC_BIT);

// A free block has to fit a header, a link and a footer.
const_assert!(MIN_BLOCK_SIZE >= WSIZE + LINK_SIZE + WSIZE);
const_assert!(MIN_BLOCK_SIZE % DSIZE == 0);

/// A packed block header.
///
/// # Layout
/// The size of a block is always a multiple of [`DSIZE`] so its three
/// lowest bits are free to carry flags:
/// - bit 0 is set when the block is allocated,
/// - bit 1 is set when the block physically preceding it is allocated,
/// - bit 2 is unused and always clear.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Header(u32);

/// Header of the prologue and of a freshly initialized epilogue.
pub const SENTINEL: Header = Header::new(0, true, true);

impl Header {
    /// Packs a size and both allocation flags into a header.
    ///
    /// `size` must be a multiple of [`DSIZE`] and not exceed [`MAX_BLOCK_SIZE`].
    #[inline(always)]
    pub const fn new(size: usize, prev_alloc: bool, alloc: bool) -> Header {
        debug_assert!(size % DSIZE == 0, "size should be a multiple of 8.");
        debug_assert!(size <= MAX_BLOCK_SIZE, "size should fit in a header.");
        let mut bits = size as u32;
        if prev_alloc {
            bits |= PREV_ALLOC_BIT;
        }
        if alloc {
            bits |= ALLOC_BIT;
        }
        Header(bits)
    }

    #[inline(always)]
    pub const fn from_bits(bits: u32) -> Header {
        Header(bits)
    }

    #[inline(always)]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns the size of the whole block, header included.
    #[inline(always)]
    pub const fn size(self) -> usize {
        (self.0 & !SIZE_MASK_BITS) as usize
    }

    /// Returns whether the bits below the size that carry no flag are clear,
    /// i.e. whether the stored size is a multiple of [`DSIZE`].
    #[inline(always)]
    pub const fn is_aligned(self) -> bool {
        self.0 & UNUSED_BITS == 0
    }

    #[inline(always)]
    pub const fn is_alloc(self) -> bool {
        self.0 & ALLOC_BIT != 0
    }

    #[inline(always)]
    pub const fn is_prev_alloc(self) -> bool {
        self.0 & PREV_ALLOC_BIT != 0
    }

    /// Returns a copy of the header with the predecessor flag replaced.
    #[inline(always)]
    pub const fn with_prev_alloc(self, prev_alloc: bool) -> Header {
        match prev_alloc {
            true => Header(self.0 | PREV_ALLOC_BIT),
            false => Header(self.0 & !PREV_ALLOC_BIT),
        }
    }
}

/// Address of the header of the block with payload `bp`.
#[inline(always)]
pub const fn hdrp(bp: usize) -> usize {
    bp - WSIZE
}

/// Address of the footer of a free block of `size` bytes with payload `bp`.
#[inline(always)]
pub const fn ftrp(bp: usize, size: usize) -> usize {
    bp + size - DSIZE
}

/// Payload of the block physically following a block of `size` bytes at `bp`.
#[inline(always)]
pub const fn next_blkp(bp: usize, size: usize) -> usize {
    bp + size
}

/// Address of the footer of the block physically preceding `bp`.
/// Only meaningful when that block is free.
#[inline(always)]
pub const fn prev_ftrp(bp: usize) -> usize {
    bp - DSIZE
}
