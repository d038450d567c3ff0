//! The [`SegMalloc`] allocator.

pub mod seg_malloc;

pub use seg_malloc::check::{HeapReport, Violation};
pub use seg_malloc::{AllocError, BlockPtr, SegMalloc};
