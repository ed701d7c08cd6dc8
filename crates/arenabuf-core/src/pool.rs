//! The pool facade.
//!
//! A [`BufferPool`] is built once from a [`PoolConfig`] and passed by handle
//! to everything that allocates; cloning it is cheap and every clone shares
//! the same arenas. Each thread that allocates binds a [`ThreadCache`] to
//! the arena with the fewest bound threads, the first time it touches the
//! pool. The caches live in a thread-local registry keyed by pool id and are
//! drained when the thread exits. The registry only holds weak references to
//! pools: dropping a pool drains the dropping thread's cache at once, and
//! other threads sweep theirs the next time they bind a cache.

use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use arenabuf_membrane::{LeakDetector, LeakTracker};

use crate::alloc::Allocation;
use crate::alloc::arena::PoolArena;
use crate::alloc::size_class::{SizeClasses, size_classes};
use crate::alloc::thread_cache::ThreadCache;
use crate::buffer::PooledBuf;
use crate::config::PoolConfig;
use crate::error::AllocError;
use crate::metrics::PoolMetrics;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct CacheEntry {
    pool: u64,
    owner: Weak<PoolShared>,
    cache: ThreadCache,
}

thread_local! {
    static CACHES: RefCell<Vec<CacheEntry>> = const { RefCell::new(Vec::new()) };
}

/// Unregister the calling thread's cache for pool `id`.
fn take_cache(id: u64) -> Option<ThreadCache> {
    CACHES
        .try_with(|caches| {
            let mut caches = caches.try_borrow_mut().ok()?;
            let pos = caches.iter().position(|e| e.pool == id)?;
            Some(caches.swap_remove(pos).cache)
        })
        .ok()
        .flatten()
}

struct PoolShared {
    id: u64,
    config: PoolConfig,
    table: Arc<SizeClasses>,
    arenas: Vec<Arc<PoolArena>>,
    leak: Arc<dyn LeakTracker>,
    /// Round-robin arena choice for threads whose cache is unavailable.
    fallback: AtomicUsize,
}

/// Handle to a buffer pool.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Build a pool whose leak detector follows `config.leak_detection`.
    pub fn new(config: PoolConfig) -> Result<Self, AllocError> {
        let leak = Arc::new(LeakDetector::new(
            config.leak_detection,
            config.leak_sampling_interval,
        ));
        Self::with_leak_tracker(config, leak)
    }

    /// Build a pool that reports to `leak`.
    pub fn with_leak_tracker(
        config: PoolConfig,
        leak: Arc<dyn LeakTracker>,
    ) -> Result<Self, AllocError> {
        config.validate()?;
        let table = size_classes(config.page_size, config.chunk_pages);
        let arenas = (0..config.arenas)
            .map(|i| Arc::new(PoolArena::new(i, Arc::clone(&table), config.alignment)))
            .collect();
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            pool = id,
            arenas = config.arenas,
            page_size = config.page_size,
            chunk_size = config.chunk_size(),
            size_classes = table.n_sizes(),
            "buffer pool created"
        );
        Ok(Self {
            shared: Arc::new(PoolShared {
                id,
                config,
                table,
                arenas,
                leak,
                fallback: AtomicUsize::new(0),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn size_classes(&self) -> &Arc<SizeClasses> {
        &self.shared.table
    }

    #[must_use]
    pub fn leak_tracker(&self) -> &Arc<dyn LeakTracker> {
        &self.shared.leak
    }

    #[must_use]
    pub fn arenas(&self) -> &[Arc<PoolArena>] {
        &self.shared.arenas
    }

    /// Obtain memory for a buffer of `min_capacity` bytes that may later grow
    /// to `max_capacity`. The returned allocation reports `min_capacity` as
    /// its length; its usable length is the normalized size.
    pub fn allocate(
        &self,
        min_capacity: usize,
        max_capacity: usize,
    ) -> Result<Allocation, AllocError> {
        if min_capacity > max_capacity {
            return Err(AllocError::InvalidCapacity {
                min: min_capacity,
                max: max_capacity,
            });
        }
        if max_capacity > self.shared.config.max_capacity {
            return Err(AllocError::CapacityExceeded {
                requested: max_capacity,
                max: self.shared.config.max_capacity,
            });
        }

        let table = &self.shared.table;
        let size = table.normalize_size(min_capacity, self.shared.config.alignment);
        let size_idx = table.size_to_index(size);
        if size_idx >= table.n_sizes() {
            return match self.with_cache(|cache| cache.arena().allocate_huge(size, min_capacity)) {
                Some(result) => result,
                None => self.fallback_arena().allocate_huge(size, min_capacity),
            };
        }

        let cached = self.with_cache(|cache| match cache.allocate(size_idx, min_capacity) {
            Some(alloc) => Ok(alloc),
            None => cache.arena().allocate(size_idx, min_capacity),
        });
        match cached {
            Some(result) => result,
            None => self.fallback_arena().allocate(size_idx, min_capacity),
        }
    }

    /// Give memory back. Small and normal allocations go to the calling
    /// thread's cache when it has room; everything else returns to its arena.
    ///
    /// An allocation handed out by another pool is rejected and dropped
    /// without touching this pool's arenas or caches.
    pub fn free(&self, alloc: Allocation) -> Result<(), AllocError> {
        let Some(arena) = self
            .shared
            .arenas
            .get(alloc.arena_index())
            .filter(|arena| arena.owns(&alloc))
        else {
            tracing::error!(
                pool = self.shared.id,
                arena = alloc.arena_index(),
                size = alloc.max_length(),
                "free of an allocation from another pool"
            );
            return Err(AllocError::ForeignAllocation {
                arena: alloc.arena_index(),
            });
        };
        let mut pending = Some(alloc);
        self.with_cache(|cache| {
            if let Some(alloc) = pending.take() {
                pending = cache.add(alloc).err();
            }
        });
        if let Some(alloc) = pending {
            arena.free(alloc);
        }
        Ok(())
    }

    /// A buffer of `initial_capacity` bytes that may grow to the pool's
    /// maximum capacity.
    pub fn buffer(&self, initial_capacity: usize) -> Result<PooledBuf, AllocError> {
        self.buffer_with_max(initial_capacity, self.shared.config.max_capacity)
    }

    pub fn buffer_with_max(
        &self,
        initial_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledBuf, AllocError> {
        let alloc = self.allocate(initial_capacity, max_capacity)?;
        Ok(PooledBuf::new(self.clone(), alloc, max_capacity))
    }

    /// Trim the calling thread's cache now. Returns the entries released.
    pub fn trim_thread_cache(&self) -> usize {
        self.with_existing_cache(ThreadCache::trim).unwrap_or(0)
    }

    /// Drop the calling thread's cache, returning every entry to the arena
    /// and unbinding the thread. The next allocation binds a fresh cache.
    pub fn release_thread_cache(&self) -> usize {
        take_cache(self.shared.id).map_or(0, |mut cache| cache.free_all())
    }

    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let arenas: Vec<_> = self.shared.arenas.iter().map(|a| a.metrics()).collect();
        PoolMetrics {
            page_size: self.shared.table.page_size(),
            chunk_size: self.shared.table.chunk_size(),
            thread_caches: arenas.iter().map(|a| a.num_thread_caches).sum(),
            used_memory: self.shared.arenas.iter().map(|a| a.used_memory()).sum(),
            active_bytes: arenas.iter().map(|a| a.active_bytes).sum(),
            arenas,
        }
    }

    fn least_used_arena(&self) -> Arc<PoolArena> {
        let arenas = &self.shared.arenas;
        let arena = arenas
            .iter()
            .min_by_key(|a| a.num_thread_caches())
            .unwrap_or(&arenas[0]);
        Arc::clone(arena)
    }

    fn fallback_arena(&self) -> &PoolArena {
        let arenas = &self.shared.arenas;
        let i = self.shared.fallback.fetch_add(1, Ordering::Relaxed) % arenas.len();
        &arenas[i]
    }

    /// Run `f` on the calling thread's cache for this pool, binding one if
    /// needed. `None` while the thread-local registry is being torn down or
    /// is already borrowed.
    fn with_cache<R>(&self, f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
        let id = self.shared.id;
        CACHES
            .try_with(|caches| {
                let mut caches = caches.try_borrow_mut().ok()?;
                let pos = match caches.iter().position(|e| e.pool == id) {
                    Some(pos) => pos,
                    None => {
                        caches.retain(|e| e.owner.strong_count() > 0);
                        let arena = self.least_used_arena();
                        tracing::trace!(pool = id, arena = arena.index(), "thread cache bound");
                        caches.push(CacheEntry {
                            pool: id,
                            owner: Arc::downgrade(&self.shared),
                            cache: ThreadCache::new(arena, &self.shared.config),
                        });
                        caches.len() - 1
                    }
                };
                Some(f(&mut caches[pos].cache))
            })
            .ok()
            .flatten()
    }

    fn with_existing_cache<R>(&self, f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
        let id = self.shared.id;
        CACHES
            .try_with(|caches| {
                let mut caches = caches.try_borrow_mut().ok()?;
                let entry = caches.iter_mut().find(|e| e.pool == id)?;
                Some(f(&mut entry.cache))
            })
            .ok()
            .flatten()
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        if let Some(cache) = take_cache(self.id) {
            tracing::trace!(pool = self.id, cached = cache.cached(), "pool dropped, draining thread cache");
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.shared.id)
            .field("arenas", &self.shared.arenas.len())
            .field("page_size", &self.shared.config.page_size)
            .field("chunk_size", &self.shared.config.chunk_size())
            .finish_non_exhaustive()
    }
}
