//! Pooling engine.
//!
//! Requests flow top-down: the calling thread's [`thread_cache`] first, then
//! the arena's subpage pools, then its [`chunk_list`]s, then a fresh
//! [`chunk`]. Requests above the chunk size go to [`huge`].

pub mod arena;
pub mod chunk;
pub mod chunk_list;
pub mod huge;
pub mod run;
pub mod run_map;
pub mod size_class;
pub mod subpage;
pub mod thread_cache;

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use arenabuf_membrane::MemoryRegion;

use self::run::RunHandle;
use self::size_class::Tier;

/// Where an allocation's memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A run or subpage element of a pooled chunk.
    Pooled {
        chunk: usize,
        handle: RunHandle,
        size_idx: usize,
        tier: Tier,
    },
    /// A dedicated region.
    Huge,
}

/// Memory handed out by the pool: `length` bytes at `offset` inside
/// `region`, with room to grow to `max_length` in place.
///
/// An allocation is not `Clone`; returning it through `BufferPool::free`
/// consumes it, so the same memory cannot be given back twice.
#[must_use = "allocations must be returned with BufferPool::free"]
pub struct Allocation {
    pub(crate) arena: usize,
    /// Process-unique id of the arena that handed this out.
    pub(crate) owner: u64,
    pub(crate) origin: Origin,
    pub(crate) region: Arc<MemoryRegion>,
    pub(crate) offset: usize,
    pub(crate) length: usize,
    pub(crate) max_length: usize,
}

impl Allocation {
    #[must_use]
    pub fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }

    /// Byte offset of the allocation inside its region.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Requested length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.length
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Usable length: the size class element or run, or the huge region.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    #[must_use]
    pub fn arena_index(&self) -> usize {
        self.arena
    }

    #[must_use]
    pub fn origin(&self) -> Origin {
        self.origin
    }

    #[must_use]
    pub fn tier(&self) -> Tier {
        match self.origin {
            Origin::Pooled { tier, .. } => tier,
            Origin::Huge => Tier::Huge,
        }
    }

    /// Size class index; `None` for huge allocations.
    #[must_use]
    pub fn size_idx(&self) -> Option<usize> {
        match self.origin {
            Origin::Pooled { size_idx, .. } => Some(size_idx),
            Origin::Huge => None,
        }
    }

    /// Absolute addresses of the usable bytes. Two live allocations never
    /// overlap.
    #[must_use]
    pub fn address_range(&self) -> Range<usize> {
        let start = self.region.base_addr() + self.offset;
        start..start + self.max_length
    }

    pub(crate) fn set_len(&mut self, length: usize) {
        debug_assert!(length <= self.max_length);
        self.length = length;
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("arena", &self.arena)
            .field("owner", &self.owner)
            .field("origin", &self.origin)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("max_length", &self.max_length)
            .finish()
    }
}
