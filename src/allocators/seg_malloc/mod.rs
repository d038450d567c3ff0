//! A singlethreaded segregated free-list allocator.
//!
// For a general view of the allocator's operational semantics see the [`crate`] level documentation.
//
// # Additional implementation notes
// ## Heap layout
// The heap starts with the free-list head table, followed by the prologue
// footer and then the blocks, and ends with the epilogue header:
//
// | table (64) | prologue ftr (4) | hdr | payload ... | hdr | payload ... | epilogue hdr (4) |
//
// Payload offsets are 8-aligned, which puts every header at 4 mod 8.
// `self.epilogue` is the payload offset of the epilogue, i.e. the offset
// right past the end of the heap.
//
// ## Transient states
// Inside `free_block` and the resize paths the successor's prev-alloc flag
// is stale between `coalesce` and the fix-up that follows it. Nothing
// looks at the heap in between.

use crate::config::{CheckMode, Config};
use crate::freelist::{FreeLists, TABLE_SIZE};
use crate::growers::{GrowError, Grower};
use crate::header::{next_blkp, Header, DSIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, SENTINEL, WSIZE};
use crate::heap::Heap;
use crate::util::{adjust_size, align8, find_divisible};

use core::fmt;
use core::num::NonZeroUsize;

use tracing::{debug, error, instrument, Level};

pub mod check;

/// An allocated block, identified by the offset of its payload in the heap.
///
/// `Option<BlockPtr>` takes the role of a nullable pointer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockPtr(NonZeroUsize);

impl BlockPtr {
    /// Returns the payload offset.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0.get()
    }

    #[inline]
    fn new(bp: usize) -> Option<Self> {
        NonZeroUsize::new(bp).map(BlockPtr)
    }
}

/// Why a request could not be served.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The grower could not extend the heap.
    Exhausted,
    /// The request does not fit in a single block.
    Oversized,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::Exhausted => f.write_str("memory exhausted"),
            AllocError::Oversized => f.write_str("request too large for a single block"),
        }
    }
}

impl std::error::Error for AllocError {}

impl From<GrowError> for AllocError {
    fn from(_: GrowError) -> Self {
        AllocError::Exhausted
    }
}

/// A single threaded memory allocator over a heap supplied by a [`Grower`].
pub struct SegMalloc<G: Grower> {
    heap: Heap<G>,
    /// Grower length when `init` ran, the lowest offset the heap owns.
    base: usize,
    lists: FreeLists,
    epilogue: usize,
    initialized: bool,
    config: Config,
}

impl<G: Grower> fmt::Debug for SegMalloc<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegMalloc")
            .field("heap", &self.heap)
            .field("base", &self.base)
            .field("epilogue", &self.epilogue)
            .field("initialized", &self.initialized)
            .field("config", &self.config)
            .finish()
    }
}

impl<G: Grower> SegMalloc<G> {
    /// Creates an allocator with the default [`Config`].
    /// The heap is set up lazily on the first allocation, or by [`init`](SegMalloc::init).
    pub const fn with_grower(grower: G) -> Self {
        Self::with_config(grower, Config::new())
    }

    pub const fn with_config(grower: G, config: Config) -> Self {
        SegMalloc {
            heap: Heap::new(grower),
            base: 0,
            lists: FreeLists::new(0),
            epilogue: 0,
            initialized: false,
            config,
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn grower(&self) -> &G {
        self.heap.grower()
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Lowest heap offset. Before `init` this is where the heap will start.
    #[inline]
    pub fn lo(&self) -> usize {
        match self.initialized {
            true => self.base,
            false => self.heap.len(),
        }
    }

    /// Highest heap offset, `None` while nothing was requested from the grower.
    #[inline]
    pub fn hi(&self) -> Option<usize> {
        self.heap.hi()
    }

    /// Sets up the free-list table and the sentinels, then extends the heap
    /// by one chunk.
    ///
    /// Calling it on an initialized heap does nothing. If the table can be
    /// set up but the first chunk can't, the error is returned but the heap
    /// stays initialized (and empty); later allocations extend it on demand.
    #[instrument(level = "info", skip(self), err(Debug, level = Level::ERROR))]
    pub fn init(&mut self) -> Result<(), AllocError> {
        if self.initialized {
            return Ok(());
        }

        let start = self.heap.len();
        let pad = find_divisible(start, DSIZE).ok_or(AllocError::Exhausted)? - start;
        let table = self
            .heap
            .sbrk(pad + TABLE_SIZE + 2 * WSIZE)
            .inspect_err(|_| error!("Couldn't get space for the free-list table."))?
            + pad;

        self.base = start;
        self.lists = FreeLists::new(table);
        self.lists.clear(&mut self.heap);

        let prologue = self.lists.end();
        self.heap.put_word(prologue, SENTINEL.bits());
        self.heap.put_word(prologue + WSIZE, SENTINEL.bits());
        self.epilogue = prologue + DSIZE;
        self.initialized = true;
        debug!(table, epilogue = self.epilogue, "Free-list table and sentinels in place.");

        self.extend(self.config.chunk_size)?;
        self.audit();
        Ok(())
    }

    /// Allocates a block with room for at least `size` bytes.
    /// Returns `None` for a zero `size` or when the heap can't grow any further.
    #[instrument(level = "info", skip(self), ret(level = Level::INFO))]
    pub fn allocate(&mut self, size: usize) -> Option<BlockPtr> {
        if size == 0 {
            debug!("Ignoring zero-sized request.");
            return None;
        }
        if !self.ensure_init() {
            return None;
        }
        let bp = self.alloc_block(size).ok()?;
        self.audit();
        BlockPtr::new(bp)
    }

    /// Allocates a zeroed block for `count` elements of `size` bytes.
    /// Returns `None` when the total size overflows.
    #[instrument(level = "info", skip(self), ret(level = Level::INFO))]
    pub fn calloc(&mut self, count: usize, size: usize) -> Option<BlockPtr> {
        let Some(total) = count.checked_mul(size) else {
            error!(count, size, "calloc size overflow.");
            return None;
        };
        let ptr = self.allocate(total)?;
        self.payload_mut(ptr).fill(0);
        Some(ptr)
    }

    /// Frees the block. Passing `None` does nothing.
    ///
    /// Pointers that were not handed out by this allocator, or that are no
    /// longer allocated, are logged and ignored when they can be recognized
    /// as such. A stale pointer into the middle of a merged free block can't
    /// always be told apart from a live one.
    #[instrument(level = "info", skip_all)]
    pub fn deallocate(&mut self, ptr: impl Into<Option<BlockPtr>>) {
        if let Some(ptr) = ptr.into() {
            self.free_block(ptr);
        }
    }

    /// Resizes the block to `size` bytes, preserving its contents up to the
    /// smaller of the two sizes.
    ///
    /// - `size == 0` frees the block and returns `None`.
    /// - `ptr == None` behaves like [`allocate`](SegMalloc::allocate).
    /// - On failure `None` is returned and the original block is left untouched.
    #[instrument(level = "info", skip(self, ptr), ret(level = Level::INFO))]
    pub fn reallocate(&mut self, ptr: impl Into<Option<BlockPtr>>, size: usize) -> Option<BlockPtr> {
        let ptr = ptr.into();
        if size == 0 {
            self.deallocate(ptr);
            return None;
        }
        match ptr {
            None => self.allocate(size),
            Some(ptr) => self.realloc_block(ptr, size),
        }
    }

    /// Number of payload bytes the block can hold. This can exceed the size
    /// it was requested with.
    ///
    /// # Panics
    /// May panic if `ptr` is not a live block of this allocator.
    #[inline]
    pub fn usable_size(&self, ptr: BlockPtr) -> usize {
        self.heap.header(ptr.offset()).size() - WSIZE
    }

    /// Returns the payload of a live block.
    ///
    /// # Panics
    /// May panic if `ptr` is not a live block of this allocator.
    pub fn payload(&self, ptr: BlockPtr) -> &[u8] {
        self.heap.bytes(ptr.offset(), self.usable_size(ptr))
    }

    /// Returns the payload of a live block, mutably.
    ///
    /// # Panics
    /// May panic if `ptr` is not a live block of this allocator.
    pub fn payload_mut(&mut self, ptr: BlockPtr) -> &mut [u8] {
        let len = self.usable_size(ptr);
        self.heap.bytes_mut(ptr.offset(), len)
    }
}

impl<G: Grower> SegMalloc<G> {
    /// Initializes the heap if needed. Returns whether the heap is usable.
    fn ensure_init(&mut self) -> bool {
        if !self.initialized {
            // A failed first chunk still leaves a usable heap, see `init`.
            let _ = self.init();
        }
        self.initialized
    }

    /// Payload offset of the first block after the prologue.
    #[inline]
    fn first_block(&self) -> usize {
        self.lists.end() + DSIZE
    }

    /// Returns whether `bp` looks like the payload of an allocated block.
    fn is_live(&self, bp: usize) -> bool {
        self.initialized
            && bp % DSIZE == 0
            && bp >= self.first_block()
            && bp < self.epilogue
            && self.heap.header(bp).is_alloc()
    }

    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    fn alloc_block(&mut self, size: usize) -> Result<usize, AllocError> {
        let asize = adjust_size(size).ok_or(AllocError::Oversized)?;
        debug!(asize, "Size adjusted.");

        let bp = match self.lists.find_fit(&self.heap, asize) {
            Some(bp) => bp,
            None => {
                debug!("Couldn't find a free block to accommodate the request, requesting heap growth.");
                self.extend(asize.max(self.config.chunk_size))?
            }
        };

        self.lists.remove(&mut self.heap, bp);
        self.place(bp, asize);
        Ok(bp)
    }

    #[instrument(level = "debug", skip(self))]
    fn free_block(&mut self, ptr: BlockPtr) {
        let bp = ptr.offset();
        if !self.is_live(bp) {
            error!(bp, "Ignoring free of a block that isn't allocated.");
            return;
        }

        let header = self.heap.header(bp);
        self.heap
            .set_boundary_tags(bp, Header::new(header.size(), header.is_prev_alloc(), false));

        let bp = self.coalesce(bp);
        let next = self.heap.next_block(bp);
        self.heap.set_prev_alloc(next, false);
        self.audit();
    }

    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG))]
    fn realloc_block(&mut self, ptr: BlockPtr, size: usize) -> Option<BlockPtr> {
        let bp = ptr.offset();
        if !self.is_live(bp) {
            error!(bp, "Ignoring realloc of a block that isn't allocated.");
            return None;
        }

        if self.config.realloc_in_place {
            let asize = adjust_size(size)?;
            if self.resize_in_place(bp, asize) {
                self.audit();
                return Some(ptr);
            }
            debug!("Couldn't resize in place, moving the block.");
        }

        let new_ptr = self.allocate(size)?;
        let old_payload = self.usable_size(ptr);
        self.heap.copy_within(bp, new_ptr.offset(), old_payload.min(size));
        self.free_block(ptr);
        Some(new_ptr)
    }

    /// Grows the heap by `size` bytes, rounded up to alignment, and turns the
    /// new space into one free block. The block is coalesced with a free
    /// predecessor, so the returned block may start before the new space.
    /// It is already filed in its bucket.
    ///
    /// The heap never grows past [`MAX_BLOCK_SIZE`] bytes, so no block
    /// merged from its free space can outgrow a header.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    fn extend(&mut self, size: usize) -> Result<usize, AllocError> {
        let size = match align8(size) {
            Some(size) if self.heap.len().checked_add(size).is_some_and(|end| end <= MAX_BLOCK_SIZE) => size,
            _ => {
                error!(size, heap = self.heap.len(), "Heap would outgrow the block size limit.");
                return Err(AllocError::Oversized);
            }
        };
        debug_assert!(size >= MIN_BLOCK_SIZE);

        let bp = self
            .heap
            .sbrk(size)
            .inspect_err(|_| error!(size, "Heap growth failure, no memory."))?;
        debug_assert_eq!(bp, self.epilogue, "The heap should grow right past the epilogue.");

        // The old epilogue header becomes the header of the new block.
        let prev_alloc = self.heap.header(bp).is_prev_alloc();
        self.heap
            .set_boundary_tags(bp, Header::new(size, prev_alloc, false));
        self.epilogue = next_blkp(bp, size);
        self.heap.set_header(self.epilogue, Header::new(0, false, true));
        debug!(bp, size, epilogue = self.epilogue, "Heap extended.");

        Ok(self.coalesce(bp))
    }

    /// Merges the free block at `bp` with whichever physical neighbours are
    /// free and files the result in its bucket. Returns the payload of the
    /// merged block.
    ///
    /// `bp` must already carry matching free boundary tags and must not be
    /// in any bucket. The successor of the merged block is left as it was,
    /// callers fix its prev-alloc flag.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG))]
    fn coalesce(&mut self, bp: usize) -> usize {
        let header = self.heap.header(bp);
        debug_assert!(!header.is_alloc(), "Only free blocks are coalesced.");

        let next = next_blkp(bp, header.size());
        let next_header = self.heap.header(next);
        let mut size = header.size();

        let bp = match (header.is_prev_alloc(), next_header.is_alloc()) {
            (true, true) => bp,
            (true, false) => {
                self.lists.remove(&mut self.heap, next);
                size += next_header.size();
                self.heap.set_boundary_tags(bp, Header::new(size, true, false));
                debug!(next, size, "Merged with successor.");
                bp
            }
            (false, true) => {
                let prev = self.heap.prev_block(bp);
                let prev_header = self.heap.header(prev);
                self.lists.remove(&mut self.heap, prev);
                size += prev_header.size();
                self.heap
                    .set_boundary_tags(prev, Header::new(size, prev_header.is_prev_alloc(), false));
                debug!(prev, size, "Merged with predecessor.");
                prev
            }
            (false, false) => {
                let prev = self.heap.prev_block(bp);
                let prev_header = self.heap.header(prev);
                self.lists.remove(&mut self.heap, next);
                self.lists.remove(&mut self.heap, prev);
                size += prev_header.size() + next_header.size();
                self.heap
                    .set_boundary_tags(prev, Header::new(size, prev_header.is_prev_alloc(), false));
                debug!(prev, next, size, "Merged with both neighbours.");
                prev
            }
        };

        self.lists.insert(&mut self.heap, bp);
        bp
    }

    /// Allocates `asize` bytes at the start of the free block at `bp`, which
    /// must already be out of its bucket. A tail of at least
    /// [`MIN_BLOCK_SIZE`] bytes is split off and filed as a new free block,
    /// anything smaller stays with the allocation.
    #[instrument(level = "debug", skip(self))]
    fn place(&mut self, bp: usize, asize: usize) {
        let header = self.heap.header(bp);
        let csize = header.size();
        debug_assert!(!header.is_alloc());
        debug_assert!(csize >= asize);

        if csize - asize >= MIN_BLOCK_SIZE {
            self.heap
                .set_header(bp, Header::new(asize, header.is_prev_alloc(), true));
            let rest = next_blkp(bp, asize);
            self.heap
                .set_boundary_tags(rest, Header::new(csize - asize, true, false));
            self.lists.insert(&mut self.heap, rest);
            debug!(rest, rest_size = csize - asize, "Split off free remainder.");
        } else {
            self.heap
                .set_header(bp, Header::new(csize, header.is_prev_alloc(), true));
            self.heap.set_prev_alloc(next_blkp(bp, csize), true);
            debug!(size = csize, "Block consumed whole.");
        }
    }

    /// Tries to make the allocated block at `bp` fit exactly `asize` bytes
    /// without moving it, by absorbing a free successor if it has to grow
    /// and by splitting off a free tail if it ends up too big.
    /// Returns whether the block now holds `asize` bytes.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG))]
    fn resize_in_place(&mut self, bp: usize, asize: usize) -> bool {
        let header = self.heap.header(bp);
        let mut csize = header.size();

        if asize > csize {
            let next = next_blkp(bp, csize);
            let next_header = self.heap.header(next);
            if next_header.is_alloc()
                || csize + next_header.size() < asize
                || csize + next_header.size() > MAX_BLOCK_SIZE
            {
                return false;
            }
            self.lists.remove(&mut self.heap, next);
            csize += next_header.size();
            self.heap
                .set_header(bp, Header::new(csize, header.is_prev_alloc(), true));
            self.heap.set_prev_alloc(next_blkp(bp, csize), true);
            debug!(next, size = csize, "Absorbed free successor.");
        }

        if csize - asize >= MIN_BLOCK_SIZE {
            self.heap
                .set_header(bp, Header::new(asize, header.is_prev_alloc(), true));
            let rest = next_blkp(bp, asize);
            self.heap
                .set_boundary_tags(rest, Header::new(csize - asize, true, false));
            let rest = self.coalesce(rest);
            let after = self.heap.next_block(rest);
            self.heap.set_prev_alloc(after, false);
            debug!(rest, "Split off free tail.");
        }
        true
    }

    /// Runs the heap validator as requested by [`Config::check`].
    fn audit(&self) {
        match self.config.check {
            CheckMode::Off => {}
            CheckMode::Report => {
                let _ = self.check_heap();
            }
            CheckMode::Strict => {
                let report = self.check_heap();
                assert!(report.is_ok(), "Heap check failed:\n{report}");
            }
        }
    }
}

#[cfg(test)]
mod tests;
