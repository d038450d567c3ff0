//! The heap region: a byte arena addressed by offsets.
//!
//! [`Heap`] owns the [`Grower`] and exposes the few typed views the
//! allocator needs over it (header words, free-list links, payload slices).
//! Words are stored little-endian regardless of the host.

use core::fmt;

use crate::growers::{GrowError, Grower};
use crate::header::{ftrp, hdrp, next_blkp, prev_ftrp, Header, LINK_SIZE, WSIZE};

pub struct Heap<G: Grower> {
    grower: G,
}

impl<G: Grower> fmt::Debug for Heap<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap").field("len", &self.len()).finish()
    }
}

impl<G: Grower> Heap<G> {
    pub const fn new(grower: G) -> Self {
        Heap { grower }
    }

    /// Extends the region by `size` bytes and returns the offset of the
    /// first new byte.
    #[inline]
    pub fn sbrk(&mut self, size: usize) -> Result<usize, GrowError> {
        self.grower.grow(size)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.grower.len()
    }

    /// Highest valid offset, or `None` while the region is empty.
    #[inline]
    pub fn hi(&self) -> Option<usize> {
        self.len().checked_sub(1)
    }

    /// Returns whether `[at, at + len)` lies within the region.
    #[inline]
    pub fn contains(&self, at: usize, len: usize) -> bool {
        at.checked_add(len).is_some_and(|end| end <= self.len())
    }

    #[inline]
    pub fn grower(&self) -> &G {
        &self.grower
    }

    #[inline]
    pub fn get_word(&self, at: usize) -> u32 {
        let mut word = [0_u8; WSIZE];
        word.copy_from_slice(&self.grower.bytes()[at..at + WSIZE]);
        u32::from_le_bytes(word)
    }

    #[inline]
    pub fn put_word(&mut self, at: usize, value: u32) {
        self.grower.bytes_mut()[at..at + WSIZE].copy_from_slice(&value.to_le_bytes());
    }

    /// Reads the free-list link stored at `at`.
    #[inline]
    pub fn get_link(&self, at: usize) -> usize {
        let mut link = [0_u8; LINK_SIZE];
        link.copy_from_slice(&self.grower.bytes()[at..at + LINK_SIZE]);
        u64::from_le_bytes(link) as usize
    }

    #[inline]
    pub fn set_link(&mut self, at: usize, next: usize) {
        self.grower.bytes_mut()[at..at + LINK_SIZE].copy_from_slice(&(next as u64).to_le_bytes());
    }

    #[inline]
    pub fn bytes(&self, at: usize, len: usize) -> &[u8] {
        &self.grower.bytes()[at..at + len]
    }

    #[inline]
    pub fn bytes_mut(&mut self, at: usize, len: usize) -> &mut [u8] {
        &mut self.grower.bytes_mut()[at..at + len]
    }

    /// Copies `len` bytes from `src` to `dst`. The ranges may overlap.
    #[inline]
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) {
        self.grower.bytes_mut().copy_within(src..src + len, dst);
    }

    //---------------block views---------------//

    #[inline]
    pub fn header(&self, bp: usize) -> Header {
        Header::from_bits(self.get_word(hdrp(bp)))
    }

    #[inline]
    pub fn set_header(&mut self, bp: usize, header: Header) {
        self.put_word(hdrp(bp), header.bits());
    }

    /// Reads the footer of the free block at `bp`, locating it through the header.
    #[inline]
    pub fn footer(&self, bp: usize) -> Header {
        Header::from_bits(self.get_word(ftrp(bp, self.header(bp).size())))
    }

    /// Writes `header` both as the header and as the footer of the block at `bp`.
    #[inline]
    pub fn set_boundary_tags(&mut self, bp: usize, header: Header) {
        self.set_header(bp, header);
        self.put_word(ftrp(bp, header.size()), header.bits());
    }

    /// Updates only the predecessor flag in the header of the block at `bp`.
    #[inline]
    pub fn set_prev_alloc(&mut self, bp: usize, prev_alloc: bool) {
        let header = self.header(bp).with_prev_alloc(prev_alloc);
        self.set_header(bp, header);
    }

    #[inline]
    pub fn next_block(&self, bp: usize) -> usize {
        next_blkp(bp, self.header(bp).size())
    }

    /// Payload of the block physically preceding `bp`.
    /// Only valid when that block is free, since it goes through its footer.
    #[inline]
    pub fn prev_block(&self, bp: usize) -> usize {
        bp - Header::from_bits(self.get_word(prev_ftrp(bp))).size()
    }
}
