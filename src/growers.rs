//! [`Grower`] trait and structures that implement it.
//!
//! The [`Grower`] trait is the allocator's only view of the outside world: a
//! contiguous, byte-addressable buffer that can be asked to grow at its end.
//! It never shrinks. Swapping the grower changes where the heap lives without
//! touching the allocator itself.

use core::fmt;
use core::ptr::{null_mut, NonNull};
use core::slice;

use tracing::{debug, error};

/// Returned by a [`Grower`] that cannot satisfy a growth request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GrowError;

impl fmt::Display for GrowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory provider could not grow the heap")
    }
}

impl std::error::Error for GrowError {}

/// A trait for types that act as if they were a contiguous growable buffer.
///
/// Offsets handed out by a grower stay valid for as long as it lives, even
/// across later growths.
pub trait Grower {
    /// Grows the underlying buffer by exactly `size` bytes.
    /// Returns the old end of the buffer, which is where the new bytes start,
    /// or `Err(GrowError)` if the growth failed. A failed growth leaves the
    /// buffer unchanged.
    ///
    /// `grow(0)` never fails and never grows the buffer.
    fn grow(&mut self, size: usize) -> Result<usize, GrowError>;

    /// Returns the current contents of the buffer.
    fn bytes(&self) -> &[u8];

    /// Returns the current contents of the buffer, mutably.
    fn bytes_mut(&mut self) -> &mut [u8];

    /// Returns the current size of the buffer.
    #[inline]
    fn len(&self) -> usize {
        self.bytes().len()
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Grower + ?Sized> Grower for &mut T {
    fn grow(&mut self, size: usize) -> Result<usize, GrowError> {
        (**self).grow(size)
    }

    fn bytes(&self) -> &[u8] {
        (**self).bytes()
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        (**self).bytes_mut()
    }
}

/// A grower backed by a `Vec<u8>` that refuses to grow past `limit` bytes.
///
/// Deterministic and bounded, which makes it the grower of choice for tests
/// that need to run the allocator out of memory.
#[derive(Debug, Clone)]
pub struct VecGrower {
    buf: Vec<u8>,
    limit: usize,
}

impl VecGrower {
    /// Creates an empty grower that can hand out at most `limit` bytes.
    pub const fn new(limit: usize) -> Self {
        VecGrower {
            buf: Vec::new(),
            limit,
        }
    }

    /// Returns how many more bytes the grower can hand out.
    pub fn remaining(&self) -> usize {
        self.limit - self.buf.len()
    }
}

impl Grower for VecGrower {
    fn grow(&mut self, size: usize) -> Result<usize, GrowError> {
        let old_end = self.buf.len();
        if size > self.remaining() {
            debug!(size, remaining = self.remaining(), "Vec grower limit reached.");
            return Err(GrowError);
        }
        self.buf.resize(old_end + size, 0);
        Ok(old_end)
    }

    fn bytes(&self) -> &[u8] {
        &self.buf
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// A grower that reserves `capacity` bytes of address space with
/// [`libc::mmap`] and moves a private break inside that reservation,
/// the way `sbrk` moves the end of the data segment.
///
/// Pages are reserved with `MAP_NORESERVE`, so untouched capacity costs
/// nothing. The reservation is unmapped when the grower is dropped.
pub struct MmapGrower {
    base: NonNull<u8>,
    brk: usize,
    capacity: usize,
}

impl fmt::Debug for MmapGrower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmapGrower")
            .field("base", &self.base)
            .field("brk", &self.brk)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl MmapGrower {
    /// Reserves `capacity` bytes. Returns `Err(GrowError)` if the mapping fails.
    pub fn new(capacity: usize) -> Result<Self, GrowError> {
        if capacity == 0 {
            return Ok(MmapGrower {
                base: NonNull::dangling(),
                brk: 0,
                capacity,
            });
        }
        let ptr = unsafe {
            libc::mmap(
                null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            error!(capacity, "mmap failed.");
            return Err(GrowError);
        }
        let base = NonNull::new(ptr.cast::<u8>()).ok_or(GrowError)?;
        debug!(?base, capacity, "Reserved heap address space.");
        Ok(MmapGrower {
            base,
            brk: 0,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Grower for MmapGrower {
    fn grow(&mut self, size: usize) -> Result<usize, GrowError> {
        let old_brk = self.brk;
        match old_brk.checked_add(size) {
            Some(new_brk) if new_brk <= self.capacity => {
                self.brk = new_brk;
                Ok(old_brk)
            }
            _ => {
                debug!(size, brk = old_brk, capacity = self.capacity, "Reservation exhausted.");
                Err(GrowError)
            }
        }
    }

    fn bytes(&self) -> &[u8] {
        // `[base, base + brk)` lies inside the live mapping and is only
        // reachable through `self`.
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.brk) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.brk) }
    }
}

impl Drop for MmapGrower {
    fn drop(&mut self) {
        if self.capacity != 0 {
            unsafe { libc::munmap(self.base.as_ptr().cast(), self.capacity) };
        }
    }
}
