//! Point-in-time pool statistics.
//!
//! Snapshots are assembled from independent counters and per-arena state;
//! fields are not guaranteed to be mutually consistent while other threads
//! allocate.

use serde::Serialize;

/// One chunk list of one arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkListMetrics {
    pub name: &'static str,
    pub min_usage: u32,
    pub max_usage: u32,
    /// Usage of each chunk in the list, in list order.
    pub chunk_usages: Vec<u32>,
    pub free_bytes: usize,
}

/// One live subpage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubpageMetrics {
    pub chunk: usize,
    pub run_offset: usize,
    pub elem_size: usize,
    pub max_num_elems: usize,
    pub num_avail: usize,
}

/// One arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArenaMetrics {
    pub index: usize,
    pub num_thread_caches: usize,
    pub allocations_small: u64,
    pub allocations_normal: u64,
    pub allocations_huge: u64,
    pub deallocations_small: u64,
    pub deallocations_normal: u64,
    pub deallocations_huge: u64,
    /// Usable bytes of every allocation the arena has handed out and not
    /// yet taken back (thread-cached regions included).
    pub active_bytes: usize,
    pub huge_active_bytes: usize,
    pub chunks: usize,
    pub chunk_lists: Vec<ChunkListMetrics>,
    pub subpages: Vec<SubpageMetrics>,
}

impl ArenaMetrics {
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations_small + self.allocations_normal + self.allocations_huge
    }

    #[must_use]
    pub fn deallocations(&self) -> u64 {
        self.deallocations_small + self.deallocations_normal + self.deallocations_huge
    }

    #[must_use]
    pub fn active_allocations(&self) -> u64 {
        self.allocations().saturating_sub(self.deallocations())
    }

    /// Usage of every chunk in the arena.
    pub fn chunk_usages(&self) -> impl Iterator<Item = u32> + '_ {
        self.chunk_lists
            .iter()
            .flat_map(|l| l.chunk_usages.iter().copied())
    }
}

/// The whole pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    pub page_size: usize,
    pub chunk_size: usize,
    pub thread_caches: usize,
    /// Chunk memory plus live huge regions.
    pub used_memory: usize,
    pub active_bytes: usize,
    pub arenas: Vec<ArenaMetrics>,
}

impl PoolMetrics {
    #[must_use]
    pub fn active_allocations(&self) -> u64 {
        self.arenas.iter().map(ArenaMetrics::active_allocations).sum()
    }

    #[must_use]
    pub fn chunks(&self) -> usize {
        self.arenas.iter().map(|a| a.chunks).sum()
    }
}
