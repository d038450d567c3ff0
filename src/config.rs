//! Allocator configuration.

use crate::header::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::util::align8;

/// Default amount the heap grows by when no free block fits.
pub const CHUNK_SIZE: usize = 1 << 12;

/// When, and how loudly, the heap validator runs on its own.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CheckMode {
    /// The validator only runs when [`check_heap`] is called.
    ///
    /// [`check_heap`]: crate::SegMalloc::check_heap
    #[default]
    Off,
    /// The validator runs after every public operation and logs what it finds.
    Report,
    /// Like [`Report`](CheckMode::Report), but a failed check panics.
    Strict,
}

/// Tunables of a [`SegMalloc`](crate::SegMalloc).
///
/// ```
/// use seg_malloc::{CheckMode, Config};
///
/// let config = Config::new().chunk_size(1 << 16).check(CheckMode::Strict);
/// assert_eq!(config.chunk_size, 1 << 16);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Minimum number of bytes requested from the grower per heap extension.
    pub chunk_size: usize,
    pub check: CheckMode,
    /// Whether `reallocate` may resize a block where it is before falling
    /// back to allocate, copy and free.
    pub realloc_in_place: bool,
}

impl Config {
    pub const fn new() -> Self {
        Config {
            chunk_size: CHUNK_SIZE,
            check: CheckMode::Off,
            realloc_in_place: true,
        }
    }

    /// Sets the extension chunk, rounded up to a valid block size and
    /// clamped to the largest block a header can describe.
    pub fn chunk_size(mut self, size: usize) -> Self {
        let size = size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
        self.chunk_size = align8(size).unwrap_or(MAX_BLOCK_SIZE);
        self
    }

    pub const fn check(mut self, check: CheckMode) -> Self {
        self.check = check;
        self
    }

    pub const fn realloc_in_place(mut self, enabled: bool) -> Self {
        self.realloc_in_place = enabled;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
