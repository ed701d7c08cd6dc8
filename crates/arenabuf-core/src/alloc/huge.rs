//! Huge allocations (above the chunk size).
//!
//! Huge requests bypass chunks entirely: each one gets its own region of
//! exactly the (aligned) requested size, which is dropped when the
//! allocation is freed. Only counters are kept.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use arenabuf_membrane::MemoryRegion;

use crate::error::AllocError;

/// Counters for huge regions served by one arena.
#[derive(Debug, Default)]
pub struct HugeAllocator {
    allocations: AtomicU64,
    deallocations: AtomicU64,
    active_bytes: AtomicUsize,
}

impl HugeAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Obtain a dedicated region of `size` bytes.
    pub fn alloc(&self, size: usize, alignment: usize) -> Result<Arc<MemoryRegion>, AllocError> {
        let region =
            MemoryRegion::allocate(size, alignment).map_err(|e| AllocError::exhausted(size, e))?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.active_bytes.fetch_add(size, Ordering::Relaxed);
        tracing::trace!(size, outcome = "huge_alloc", "huge region allocated");
        Ok(Arc::new(region))
    }

    /// Give a region back. The memory is released once the last reference drops.
    pub fn free(&self, region: Arc<MemoryRegion>) {
        let size = region.len();
        self.deallocations.fetch_add(1, Ordering::Relaxed);
        self.active_bytes.fetch_sub(size, Ordering::Relaxed);
        tracing::trace!(size, outcome = "huge_free", "huge region freed");
        drop(region);
    }

    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn deallocations(&self) -> u64 {
        self.deallocations.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn active_count(&self) -> u64 {
        self.allocations().saturating_sub(self.deallocations())
    }

    /// Bytes held by live huge regions.
    #[must_use]
    pub fn active_bytes(&self) -> usize {
        self.active_bytes.load(Ordering::Relaxed)
    }
}
