//! Raw memory regions backing chunks and huge buffers.
//!
//! A region is one allocation obtained from the global allocator. Every byte
//! is read and written through `AtomicU8` with relaxed ordering, so handles
//! that alias the same bytes (a buffer and its slices, possibly on different
//! threads) can never produce a data race. Ordering between writers and
//! readers is the caller's business, exactly as with any shared buffer.

#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

/// Minimum alignment of every region.
pub const MIN_ALIGN: usize = 16;

/// Failure to obtain or address region memory.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegionError {
    /// The size/alignment pair is not a valid layout.
    #[error("invalid region layout: size {size}, align {align}")]
    InvalidLayout { size: usize, align: usize },
    /// The global allocator returned null.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },
    /// An access fell outside the region.
    #[error("access [{offset}, +{len}) out of bounds for region of {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
}

/// One contiguous, zero-initialised memory allocation.
pub struct MemoryRegion {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

// SAFETY: the region exclusively owns its allocation and all byte access goes
// through atomics (see `cell`), so sharing references across threads is sound.
unsafe impl Send for MemoryRegion {}
// SAFETY: see above.
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Allocate `size` zeroed bytes aligned to at least `align` (power of two).
    pub fn allocate(size: usize, align: usize) -> Result<Self, RegionError> {
        let align = align.max(MIN_ALIGN);
        let layout = Layout::from_size_align(size.max(1), align)
            .map_err(|_| RegionError::InvalidLayout { size, align })?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(RegionError::OutOfMemory { size })?;
        Ok(Self {
            ptr,
            layout,
            len: size,
        })
    }

    /// Usable length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Alignment the region was allocated with.
    #[must_use]
    pub fn align(&self) -> usize {
        self.layout.align()
    }

    /// Address of the first byte. Used for identity and overlap checks only.
    #[must_use]
    pub fn base_addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), RegionError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(RegionError::OutOfBounds {
                offset,
                len,
                capacity: self.len,
            }),
        }
    }

    fn cell(&self, index: usize) -> &AtomicU8 {
        debug_assert!(index < self.len);
        // SAFETY: callers bounds-check `index < len <= layout.size()`, so the
        // pointer stays inside the live allocation owned by `self`. The byte is
        // only ever accessed atomically, and `AtomicU8` has alignment 1.
        unsafe { AtomicU8::from_ptr(self.ptr.as_ptr().add(index)) }
    }

    /// Read one byte.
    pub fn get(&self, index: usize) -> Result<u8, RegionError> {
        self.check(index, 1)?;
        Ok(self.cell(index).load(Ordering::Relaxed))
    }

    /// Write one byte.
    pub fn set(&self, index: usize, value: u8) -> Result<(), RegionError> {
        self.check(index, 1)?;
        self.cell(index).store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), RegionError> {
        self.check(offset, dst.len())?;
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = self.cell(offset + i).load(Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copy `src` into the region starting at `offset`.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<(), RegionError> {
        self.check(offset, src.len())?;
        for (i, &byte) in src.iter().enumerate() {
            self.cell(offset + i).store(byte, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Set `len` bytes starting at `offset` to `value`.
    pub fn fill(&self, offset: usize, len: usize, value: u8) -> Result<(), RegionError> {
        self.check(offset, len)?;
        for i in offset..offset + len {
            self.cell(i).store(value, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copy `len` bytes from this region into `dst`. The two regions may be
    /// the same object as long as the ranges do not overlap.
    pub fn copy_to(
        &self,
        src_offset: usize,
        dst: &MemoryRegion,
        dst_offset: usize,
        len: usize,
    ) -> Result<(), RegionError> {
        self.check(src_offset, len)?;
        dst.check(dst_offset, len)?;
        for i in 0..len {
            let byte = self.cell(src_offset + i).load(Ordering::Relaxed);
            dst.cell(dst_offset + i).store(byte, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by `alloc_zeroed` with exactly this layout
        // and is released only here.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("base", &format_args!("{:#x}", self.base_addr()))
            .field("len", &self.len)
            .field("align", &self.layout.align())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn allocate_is_zeroed_and_aligned() {
        let region = MemoryRegion::allocate(4096, 4096).expect("allocation should succeed");
        assert_eq!(region.len(), 4096);
        assert_eq!(region.base_addr() % 4096, 0);
        let mut buf = [0xFFu8; 64];
        region.read(4000, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_sized_region_is_valid_but_empty() {
        let region = MemoryRegion::allocate(0, 1).expect("zero-size allocation");
        assert!(region.is_empty());
        assert!(region.get(0).is_err());
        assert!(region.write(0, &[]).is_ok());
    }

    #[test]
    fn minimum_alignment_applies() {
        let region = MemoryRegion::allocate(10, 1).unwrap();
        assert_eq!(region.align(), MIN_ALIGN);
    }

    #[test]
    fn invalid_alignment_rejected() {
        assert!(matches!(
            MemoryRegion::allocate(64, 48),
            Err(RegionError::InvalidLayout { .. })
        ));
    }

    #[test]
    fn write_read_roundtrip() {
        let region = MemoryRegion::allocate(128, 16).unwrap();
        region.write(10, b"arena").unwrap();
        let mut out = [0u8; 5];
        region.read(10, &mut out).unwrap();
        assert_eq!(&out, b"arena");
        assert_eq!(region.get(12).unwrap(), b'e');
    }

    #[test]
    fn out_of_bounds_access_rejected() {
        let region = MemoryRegion::allocate(32, 16).unwrap();
        assert_eq!(
            region.write(30, &[1, 2, 3]),
            Err(RegionError::OutOfBounds {
                offset: 30,
                len: 3,
                capacity: 32
            })
        );
        assert!(region.set(32, 1).is_err());
        assert!(region.fill(usize::MAX, 2, 0).is_err());
    }

    #[test]
    fn copy_between_regions() {
        let a = MemoryRegion::allocate(64, 16).unwrap();
        let b = MemoryRegion::allocate(64, 16).unwrap();
        a.fill(0, 64, 7).unwrap();
        a.copy_to(8, &b, 16, 8).unwrap();
        assert_eq!(b.get(15).unwrap(), 0);
        assert_eq!(b.get(16).unwrap(), 7);
        assert_eq!(b.get(23).unwrap(), 7);
        assert_eq!(b.get(24).unwrap(), 0);
    }

    #[test]
    fn disjoint_concurrent_writers() {
        let region = Arc::new(MemoryRegion::allocate(8 * 256, 16).unwrap());
        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let region = Arc::clone(&region);
                thread::spawn(move || {
                    region.fill(usize::from(t) * 256, 256, t + 1).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..8usize {
            assert_eq!(region.get(t * 256).unwrap(), t as u8 + 1);
            assert_eq!(region.get(t * 256 + 255).unwrap(), t as u8 + 1);
        }
    }
}
