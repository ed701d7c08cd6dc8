//! Per-thread cache of recently freed allocations.
//!
//! Each thread keeps one queue per cacheable size class, bound to a single
//! arena. Frees of that arena's small and normal allocations land in the
//! queue instead of taking the arena lock; allocations of the same class
//! reuse the most recently cached entry. A full queue evicts its oldest
//! entry back to the arena.
//!
//! Every `cache_trim_interval` cache hits the whole cache is trimmed: each
//! queue gives back as many entries as went unused since the previous trim.

use std::collections::VecDeque;
use std::sync::Arc;

use super::Allocation;
use super::arena::PoolArena;
use crate::config::PoolConfig;

/// Bounded queue of cached allocations for one size class.
#[derive(Debug)]
struct CacheQueue {
    entries: VecDeque<Allocation>,
    capacity: usize,
    /// Hits since the last trim.
    allocations: usize,
}

impl CacheQueue {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            allocations: 0,
        }
    }
}

/// One thread's cache for one pool.
#[derive(Debug)]
pub struct ThreadCache {
    arena: Arc<PoolArena>,
    small: Vec<CacheQueue>,
    normal: Vec<CacheQueue>,
    n_subpages: usize,
    trim_interval: usize,
    /// Hits since the last trim, across all queues.
    allocations: usize,
}

impl ThreadCache {
    /// Build a cache bound to `arena`. Normal classes up to
    /// `max_cached_buffer_capacity` get a queue; larger ones are never cached.
    #[must_use]
    pub fn new(arena: Arc<PoolArena>, config: &PoolConfig) -> Self {
        let table = Arc::clone(arena.size_classes());
        let n_subpages = table.n_subpages();
        let small = if config.small_cache_size > 0 {
            (0..n_subpages)
                .map(|_| CacheQueue::new(config.small_cache_size))
                .collect()
        } else {
            Vec::new()
        };
        let normal = if config.normal_cache_size > 0 {
            table.classes()[n_subpages..]
                .iter()
                .take_while(|c| c.size <= config.max_cached_buffer_capacity)
                .map(|_| CacheQueue::new(config.normal_cache_size))
                .collect()
        } else {
            Vec::new()
        };
        arena.bind_thread_cache();
        Self {
            arena,
            small,
            normal,
            n_subpages,
            trim_interval: config.cache_trim_interval.max(1),
            allocations: 0,
        }
    }

    #[must_use]
    pub fn arena(&self) -> &Arc<PoolArena> {
        &self.arena
    }

    fn queue_mut(&mut self, size_idx: usize) -> Option<&mut CacheQueue> {
        if size_idx < self.n_subpages {
            self.small.get_mut(size_idx)
        } else {
            self.normal.get_mut(size_idx - self.n_subpages)
        }
    }

    /// Reuse a cached allocation of class `size_idx`, reporting `length` as
    /// its length.
    pub fn allocate(&mut self, size_idx: usize, length: usize) -> Option<Allocation> {
        let queue = self.queue_mut(size_idx)?;
        let mut alloc = queue.entries.pop_back()?;
        queue.allocations += 1;
        alloc.set_len(length);
        self.allocations += 1;
        if self.allocations >= self.trim_interval {
            self.trim();
        }
        Some(alloc)
    }

    /// Cache a freed allocation. Hands it back if it belongs to another
    /// arena, is huge, or its class is not cached.
    pub fn add(&mut self, alloc: Allocation) -> Result<(), Allocation> {
        if !self.arena.owns(&alloc) {
            return Err(alloc);
        }
        let Some(size_idx) = alloc.size_idx() else {
            return Err(alloc);
        };
        let Some(queue) = self.queue_mut(size_idx) else {
            return Err(alloc);
        };
        let evicted = if queue.entries.len() >= queue.capacity {
            queue.entries.pop_front()
        } else {
            None
        };
        queue.entries.push_back(alloc);
        if let Some(oldest) = evicted {
            tracing::trace!(
                arena = self.arena.index(),
                size = oldest.max_length(),
                outcome = "cache_evict",
                "thread cache full, evicting oldest entry"
            );
            self.arena.free(oldest);
        }
        Ok(())
    }

    /// Return the entries that were not reused since the last trim.
    pub fn trim(&mut self) -> usize {
        let mut freed = 0;
        for queue in self.small.iter_mut().chain(self.normal.iter_mut()) {
            let unused = queue.entries.len().saturating_sub(queue.allocations);
            queue.allocations = 0;
            for alloc in queue.entries.drain(..unused) {
                self.arena.free(alloc);
                freed += 1;
            }
        }
        self.allocations = 0;
        tracing::trace!(arena = self.arena.index(), freed, outcome = "cache_trim", "thread cache trimmed");
        freed
    }

    /// Return every cached entry.
    pub fn free_all(&mut self) -> usize {
        let mut freed = 0;
        for queue in self.small.iter_mut().chain(self.normal.iter_mut()) {
            queue.allocations = 0;
            for alloc in queue.entries.drain(..) {
                self.arena.free(alloc);
                freed += 1;
            }
        }
        self.allocations = 0;
        freed
    }

    /// Entries currently cached.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.small
            .iter()
            .chain(&self.normal)
            .map(|q| q.entries.len())
            .sum()
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        let freed = self.free_all();
        self.arena.unbind_thread_cache();
        tracing::trace!(arena = self.arena.index(), freed, outcome = "cache_release", "thread cache released");
    }
}
