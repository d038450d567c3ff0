//! The heap validator.
//!
//! [`SegMalloc::check_heap`] walks the heap once in address order and once
//! through every free list, and cross-checks what it sees. It only reads.

use core::fmt;

use super::SegMalloc;
use crate::freelist::{bucket_for, FREELIST_COUNT, NIL};
use crate::growers::Grower;
use crate::header::{ftrp, hdrp, Header, DSIZE, LINK_SIZE, MIN_BLOCK_SIZE, WSIZE};

use tracing::{debug, error, instrument};

/// A single inconsistency found by the validator.
/// Offsets are payload offsets unless stated otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    /// The prologue footer at `at` is not an allocated zero-size sentinel.
    BadPrologue { at: usize, bits: u32 },
    /// The epilogue is not the last word of the heap, or is not a sentinel.
    BadEpilogue { epilogue: usize, heap_end: usize },
    /// The block extends past the epilogue or its header lies outside the heap.
    OutOfHeap { block: usize },
    /// The block's header stores a size that is not a multiple of 8.
    Misaligned { block: usize, bits: u32 },
    /// The block is smaller than the minimum block size.
    Undersized { block: usize, size: usize },
    /// Two physically adjacent blocks are both free.
    Uncoalesced { block: usize, next: usize },
    /// A free block's header and footer differ.
    TagMismatch { block: usize, header: u32, footer: u32 },
    /// The block's prev-alloc flag disagrees with its predecessor's alloc flag.
    PrevAllocMismatch { block: usize },
    AllocatedInList { bucket: usize, block: usize },
    WrongBucket { bucket: usize, block: usize, size: usize },
    /// A list link points outside the block area of the heap.
    BadLink { bucket: usize, link: usize },
    Cycle { bucket: usize },
    FreeCountMismatch { heap: usize, lists: usize },
    FreeBytesMismatch { heap: usize, lists: usize },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Violation::BadPrologue { at, bits } => {
                write!(f, "prologue at {at} is not a sentinel ({bits:#x})")
            }
            Violation::BadEpilogue { epilogue, heap_end } => {
                write!(f, "epilogue {epilogue} is not the last block of a heap ending at {heap_end}")
            }
            Violation::OutOfHeap { block } => write!(f, "block {block} not in heap"),
            Violation::Misaligned { block, bits } => {
                write!(f, "block {block} not aligned, header {bits:#x}")
            }
            Violation::Undersized { block, size } => {
                write!(f, "block {block} too small, {size} instead of {MIN_BLOCK_SIZE}")
            }
            Violation::Uncoalesced { block, next } => {
                write!(f, "contiguous free blocks {block} and {next} not yet coalesced")
            }
            Violation::TagMismatch { block, header, footer } => write!(
                f,
                "mismatch in header ({header:#x}) and footer ({footer:#x}) of block {block}"
            ),
            Violation::PrevAllocMismatch { block } => write!(
                f,
                "prev-alloc flag of block {block} disagrees with the alloc flag of its predecessor"
            ),
            Violation::AllocatedInList { bucket, block } => {
                write!(f, "allocated block {block} in free list {bucket}")
            }
            Violation::WrongBucket { bucket, block, size } => {
                write!(f, "block {block} of size {size} filed in free list {bucket}")
            }
            Violation::BadLink { bucket, link } => {
                write!(f, "free list {bucket} links to {link}, outside the heap")
            }
            Violation::Cycle { bucket } => write!(f, "cycle in free list {bucket}"),
            Violation::FreeCountMismatch { heap, lists } => write!(
                f,
                "free list size and number of free blocks mismatch, {heap} in heap, {lists} listed"
            ),
            Violation::FreeBytesMismatch { heap, lists } => write!(
                f,
                "free bytes mismatch, {heap} in heap, {lists} listed"
            ),
        }
    }
}

/// The outcome of a heap check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapReport {
    pub violations: Vec<Violation>,
    /// Blocks met walking the heap, sentinels excluded.
    pub blocks: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    /// Blocks met walking the free lists.
    pub listed_blocks: usize,
    pub listed_bytes: usize,
}

impl HeapReport {
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    fn push(&mut self, violation: Violation) {
        error!(%violation, "Heap check failed.");
        self.violations.push(violation);
    }
}

impl fmt::Display for HeapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} blocks, {} free ({} bytes), {} listed ({} bytes)",
            self.blocks, self.free_blocks, self.free_bytes, self.listed_blocks, self.listed_bytes
        )?;
        for violation in &self.violations {
            writeln!(f, "  {violation}")?;
        }
        Ok(())
    }
}

impl<G: Grower> SegMalloc<G> {
    /// Checks the heap for consistency.
    ///
    /// Every violation found is logged at `error` level and collected in the
    /// returned report; nothing is fixed and nothing panics. A heap that was
    /// never initialized yields an empty report.
    #[instrument(level = "debug", skip(self))]
    pub fn check_heap(&self) -> HeapReport {
        let mut report = HeapReport::default();
        if !self.initialized {
            return report;
        }

        self.check_blocks(&mut report);
        let lists_walkable = self.check_lists(&mut report);

        if lists_walkable {
            if report.free_blocks != report.listed_blocks {
                report.push(Violation::FreeCountMismatch {
                    heap: report.free_blocks,
                    lists: report.listed_blocks,
                });
            }
            if report.free_bytes != report.listed_bytes {
                report.push(Violation::FreeBytesMismatch {
                    heap: report.free_bytes,
                    lists: report.listed_bytes,
                });
            }
        }

        debug!(
            blocks = report.blocks,
            free_blocks = report.free_blocks,
            violations = report.violations.len(),
            "Heap checked."
        );
        report
    }

    /// Walks the blocks from the prologue to the epilogue.
    fn check_blocks(&self, report: &mut HeapReport) {
        let heap = &self.heap;
        let prologue = self.lists.end();
        let prologue_header = Header::from_bits(heap.get_word(prologue));
        if prologue_header.size() != 0 || !prologue_header.is_alloc() {
            report.push(Violation::BadPrologue {
                at: prologue,
                bits: prologue_header.bits(),
            });
        }

        let epilogue = self.epilogue;
        if epilogue != heap.len() || !heap.contains(hdrp(epilogue), WSIZE) {
            report.push(Violation::BadEpilogue {
                epilogue,
                heap_end: heap.len(),
            });
            if !heap.contains(hdrp(epilogue), WSIZE) {
                return;
            }
        } else {
            let header = heap.header(epilogue);
            if header.size() != 0 || !header.is_alloc() {
                report.push(Violation::BadEpilogue {
                    epilogue,
                    heap_end: heap.len(),
                });
            }
        }

        let mut bp = self.first_block();
        let mut prev: Option<(usize, Header)> = None;
        loop {
            let header = heap.header(bp);
            let prev_alloc = prev.map_or(prologue_header.is_alloc(), |(_, h)| h.is_alloc());
            if header.is_prev_alloc() != prev_alloc {
                report.push(Violation::PrevAllocMismatch { block: bp });
            }
            if bp == epilogue {
                break;
            }

            let size = header.size();
            if !header.is_aligned() {
                report.push(Violation::Misaligned {
                    block: bp,
                    bits: header.bits(),
                });
            }
            if size < MIN_BLOCK_SIZE {
                report.push(Violation::Undersized { block: bp, size });
                if size == 0 {
                    // Can't step over a zero-size block.
                    return;
                }
            }
            let next = bp + size;
            if next > epilogue {
                report.push(Violation::OutOfHeap { block: bp });
                return;
            }

            report.blocks += 1;
            if !header.is_alloc() {
                report.free_blocks += 1;
                report.free_bytes += size;

                let footer = heap.get_word(ftrp(bp, size));
                if footer != header.bits() {
                    report.push(Violation::TagMismatch {
                        block: bp,
                        header: header.bits(),
                        footer,
                    });
                }
                if let Some((prev_bp, prev_header)) = prev {
                    if !prev_header.is_alloc() {
                        report.push(Violation::Uncoalesced {
                            block: prev_bp,
                            next: bp,
                        });
                    }
                }
            }

            prev = Some((bp, header));
            bp = next;
        }
    }

    /// Walks every free list. Returns whether all of them could be walked to
    /// their end, which makes the collected totals comparable.
    fn check_lists(&self, report: &mut HeapReport) -> bool {
        let heap = &self.heap;
        let first = self.first_block();
        let end = self.epilogue.min(heap.len());
        // An acyclic list can't hold more distinct aligned offsets than this.
        let max_len = end.saturating_sub(first) / DSIZE;
        let mut walkable = true;

        for bucket in 0..FREELIST_COUNT {
            let mut cell = self.lists.head_cell(bucket);
            let mut len = 0;
            loop {
                let link = heap.get_link(cell);
                if link == NIL {
                    break;
                }
                if link < first || link % DSIZE != 0 || !heap.contains(link, LINK_SIZE) || link >= end {
                    report.push(Violation::BadLink { bucket, link });
                    walkable = false;
                    break;
                }
                len += 1;
                if len > max_len {
                    report.push(Violation::Cycle { bucket });
                    walkable = false;
                    break;
                }

                let header = heap.header(link);
                if header.is_alloc() {
                    report.push(Violation::AllocatedInList { bucket, block: link });
                } else if bucket_for(header.size()) != bucket {
                    report.push(Violation::WrongBucket {
                        bucket,
                        block: link,
                        size: header.size(),
                    });
                }
                report.listed_blocks += 1;
                report.listed_bytes += header.size();
                cell = link;
            }
        }
        walkable
    }
}
