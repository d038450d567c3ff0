//! A segregated free-list memory allocator with boundary-tag coalescing.
//!
//! The allocator manages a single heap that only ever grows. It hands out
//! blocks of that heap, takes them back, and reuses the freed space for
//! later requests. The heap is a plain byte arena and every address is an
//! offset into it, so several independent heaps can live side by side and
//! every state they reach can be inspected from a test.
//!
//! # Usage
//! ```
//! use seg_malloc::growers::VecGrower;
//! use seg_malloc::SegMalloc;
//!
//! let mut allocator = SegMalloc::with_grower(VecGrower::new(1 << 20));
//!
//! let p = allocator.allocate(5).unwrap();
//! allocator.payload_mut(p)[..5].copy_from_slice(b"hello");
//!
//! let p = allocator.reallocate(p, 4096).unwrap();
//! assert_eq!(&allocator.payload(p)[..5], b"hello");
//!
//! allocator.deallocate(p);
//! assert!(allocator.check_heap().is_ok());
//! ```
//!
//! # Mode of operation
//! - On allocation the request is padded with header overhead and rounded
//!   up to 8 bytes. The free lists are searched first-fit, starting in the
//!   size class of the request and moving up to larger classes. If nothing
//!   fits, the heap is extended by at least one chunk and the new space is
//!   used instead. A block much bigger than the request is split and the
//!   remainder goes back to the free lists.
//! - On deallocation the block is merged with whichever of its physical
//!   neighbours are free and the result is filed in its size class. Two
//!   free blocks are never left next to each other.
//! - On reallocation the block is resized where it is when possible,
//!   otherwise it is moved to a fresh block.
//!
//! Below is a list of the abstractions the allocator is built from:
//!
//! ## Blocks
//! The heap is divided into blocks. Each block starts with a 4 byte
//! [header](header::Header) holding the block size and two flags: whether
//! the block is allocated and whether the block *before* it is allocated.
//! Free blocks repeat their header in a footer at their very end, which is
//! how a block finds its free predecessor. Allocated blocks don't need one,
//! the predecessor flag in the next header says all there is to know, so
//! the space is part of the payload.
//!
//! Block sizes are multiples of 8 and never below 16 bytes, payloads are
//! 8-aligned.
//!
//! ## Sentinels
//! The heap starts with a prologue and ends with an epilogue, both marked
//! allocated with size zero. They spare every neighbour lookup a bounds check.
//!
//! ## Free lists
//! Free blocks are kept in 8 singly linked lists segregated by size:
//! list `i` holds blocks of `[2^(4+i), 2^(5+i))` bytes, the last one
//! everything from 2048 bytes up. The list heads sit in a table at the start
//! of the heap and each free block keeps the offset of the next one in the
//! first word of its payload.
//!
//! ## Growers
//! A [grower](growers::Grower) is the allocator's source of memory: a
//! contiguous buffer that can grow at its end, the way `sbrk` grows a data
//! segment. [`VecGrower`](growers::VecGrower) keeps the heap in a bounded
//! `Vec<u8>`, [`MmapGrower`](growers::MmapGrower) in a reserved mapping.
//!
//! ## Validation
//! [`SegMalloc::check_heap`] walks the heap and the free lists and reports
//! every inconsistency it finds. [`CheckMode`] can run it after every
//! operation, either only logging what it finds or panicking on it.
//!
//! # Non-goals
//! [`SegMalloc`] is not thread safe and never hands memory back to its
//! grower.

pub use crate::allocators::{AllocError, BlockPtr, HeapReport, SegMalloc, Violation};
pub use crate::config::{CheckMode, Config};

pub mod allocators;
pub mod config;
mod freelist;
pub mod growers;
pub mod header;
mod heap;
mod util;
