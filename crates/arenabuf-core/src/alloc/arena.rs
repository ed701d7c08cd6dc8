//! Arenas: the shared allocation authority.
//!
//! An arena owns a slab of chunks, the six usage lists they move between,
//! and one pool of partially used subpages per small size class. All of
//! that state sits behind a single `parking_lot::Mutex`; counters are
//! atomics so metrics never take the lock for long.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::chunk::{Chunk, ChunkFree};
use super::chunk_list::{self, ChunkList, ListId, Placement, QINIT, SEARCH_ORDER};
use super::huge::HugeAllocator;
use super::run::RunHandle;
use super::size_class::{SizeClass, SizeClasses, Tier};
use super::{Allocation, Origin};
use crate::error::AllocError;
use crate::metrics::{ArenaMetrics, ChunkListMetrics, SubpageMetrics};

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct TierCounters {
    allocations: AtomicU64,
    deallocations: AtomicU64,
}

#[derive(Debug)]
struct ChunkSlot {
    chunk: Chunk,
    list: ListId,
}

/// Subpage pool key: (chunk id, run offset). Ordered so that the lowest
/// chunk and page are reused first.
type SubpageKey = (usize, usize);

#[derive(Debug)]
struct ArenaState {
    slots: Vec<Option<ChunkSlot>>,
    /// Slot indices free for reuse.
    free_slots: Vec<usize>,
    lists: [ChunkList; 6],
    /// Subpages with at least one free element, per small size class.
    subpage_pools: Vec<BTreeSet<SubpageKey>>,
}

impl ArenaState {
    fn insert_chunk(&mut self, chunk: Chunk) -> usize {
        let slot = ChunkSlot { chunk, list: QINIT };
        let id = match self.free_slots.pop() {
            Some(id) => {
                self.slots[id] = Some(slot);
                id
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.lists[QINIT].add(id);
        id
    }

    fn slot_mut(&mut self, id: usize) -> Option<&mut ChunkSlot> {
        self.slots.get_mut(id)?.as_mut()
    }

    /// Move chunk `id` to the list matching its usage, or drop it.
    fn relocate(&mut self, arena: usize, id: usize) {
        let Some(slot) = self.slots.get_mut(id).and_then(Option::as_mut) else {
            return;
        };
        let usage = slot.chunk.usage();
        let current = slot.list;
        match chunk_list::placement(&self.lists, current, usage) {
            Placement::List(list) if list == current => {}
            Placement::List(list) => {
                slot.list = list;
                self.lists[current].remove(id);
                self.lists[list].add(id);
                // Usage rounds up, so one used byte already counts as 1%:
                // only a fully free chunk reads 0 and can leave `q000`.
                debug_assert!(self.lists[list].accepts(usage));
            }
            Placement::Release => {
                self.lists[current].remove(id);
                self.slots[id] = None;
                self.free_slots.push(id);
                tracing::debug!(arena, chunk = id, outcome = "chunk_released", "chunk released");
            }
        }
    }

    /// Claim an element from the first pooled subpage of `size_idx`.
    fn allocate_from_pool(&mut self, size_idx: usize) -> Option<(usize, RunHandle)> {
        let pool = self.subpage_pools.get_mut(size_idx)?;
        while let Some(&(id, run_offset)) = pool.first() {
            let slot = self.slots.get_mut(id).and_then(Option::as_mut);
            let handle = slot.and_then(|s| {
                let handle = s.chunk.allocate_from_subpage(run_offset)?;
                Some((handle, s.chunk.subpage(run_offset).is_some_and(|p| p.is_full())))
            });
            match handle {
                Some((handle, now_full)) => {
                    if now_full {
                        pool.remove(&(id, run_offset));
                    }
                    return Some((id, handle));
                }
                None => {
                    debug_assert!(false, "pooled subpage ({id}, {run_offset}) has no free element");
                    pool.remove(&(id, run_offset));
                }
            }
        }
        None
    }
}

/// Try to satisfy `class` from `slot`, registering a new subpage in `pools`.
fn allocate_in(
    id: usize,
    slot: &mut ChunkSlot,
    class: &SizeClass,
    pools: &mut [BTreeSet<SubpageKey>],
) -> Option<RunHandle> {
    if class.is_subpage {
        let handle = slot.chunk.allocate_subpage(class.index, class.size)?;
        let has_room = slot
            .chunk
            .subpage(handle.offset())
            .is_some_and(|s| !s.is_full());
        if has_room {
            pools[class.index].insert((id, handle.offset()));
        }
        Some(handle)
    } else {
        slot.chunk.allocate_run(class.pages)
    }
}

/// One arena. Shared by every thread bound to it.
#[derive(Debug)]
pub struct PoolArena {
    index: usize,
    id: u64,
    table: Arc<SizeClasses>,
    alignment: usize,
    state: Mutex<ArenaState>,
    huge: HugeAllocator,
    small: TierCounters,
    normal: TierCounters,
    active_bytes: AtomicUsize,
    num_thread_caches: AtomicUsize,
}

impl PoolArena {
    #[must_use]
    pub fn new(index: usize, table: Arc<SizeClasses>, alignment: usize) -> Self {
        let state = ArenaState {
            slots: Vec::new(),
            free_slots: Vec::new(),
            lists: chunk_list::new_lists(table.chunk_size()),
            subpage_pools: vec![BTreeSet::new(); table.n_subpages()],
        };
        Self {
            index,
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            alignment,
            state: Mutex::new(state),
            huge: HugeAllocator::new(),
            small: TierCounters::default(),
            normal: TierCounters::default(),
            active_bytes: AtomicUsize::new(0),
            num_thread_caches: AtomicUsize::new(0),
            table,
        }
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn size_classes(&self) -> &Arc<SizeClasses> {
        &self.table
    }

    /// True if `alloc` was handed out by this arena. Indices repeat across
    /// pools; ids do not.
    #[must_use]
    pub fn owns(&self, alloc: &Allocation) -> bool {
        alloc.owner == self.id
    }

    /// Allocate from size class `size_idx`, reporting `length` as the
    /// allocation's length. A `size_idx` past the table goes to the huge
    /// path with `length` aligned like any other huge request.
    pub(crate) fn allocate(&self, size_idx: usize, length: usize) -> Result<Allocation, AllocError> {
        let Some(class) = self.table.class(size_idx).copied() else {
            let size = self.table.normalize_size(length, self.alignment);
            return self.allocate_huge(size, length);
        };
        let (chunk, handle, region, offset, max_length) = {
            let mut state = self.state.lock();
            let (id, handle) = self.allocate_pooled(&mut state, &class)?;
            state.relocate(self.index, id);
            let Some(slot) = state.slots.get(id).and_then(Option::as_ref) else {
                debug_assert!(false, "chunk {id} vanished while allocating");
                return Err(self.lost_chunk(class.size));
            };
            (
                id,
                handle,
                Arc::clone(slot.chunk.region()),
                slot.chunk.byte_offset(handle),
                slot.chunk.usable_len(handle),
            )
        };

        if let Some(counters) = self.counters(class.tier()) {
            counters.allocations.fetch_add(1, Ordering::Relaxed);
        }
        self.active_bytes.fetch_add(max_length, Ordering::Relaxed);
        Ok(Allocation {
            arena: self.index,
            owner: self.id,
            origin: Origin::Pooled {
                chunk,
                handle,
                size_idx,
                tier: class.tier(),
            },
            region,
            offset,
            length: length.min(max_length),
            max_length,
        })
    }

    fn allocate_pooled(
        &self,
        state: &mut ArenaState,
        class: &SizeClass,
    ) -> Result<(usize, RunHandle), AllocError> {
        if class.is_subpage {
            if let Some(found) = state.allocate_from_pool(class.index) {
                return Ok(found);
            }
        }

        let run_bytes = class.pages << self.table.page_shifts();
        let ArenaState {
            slots,
            lists,
            subpage_pools,
            ..
        } = &mut *state;
        for list in SEARCH_ORDER {
            if lists[list].max_capacity() < run_bytes {
                continue;
            }
            for &id in lists[list].chunks() {
                let Some(slot) = slots.get_mut(id).and_then(Option::as_mut) else {
                    continue;
                };
                if let Some(handle) = allocate_in(id, slot, class, subpage_pools) {
                    return Ok((id, handle));
                }
            }
        }

        let chunk = Chunk::new(Arc::clone(&self.table), self.table.page_size())
            .map_err(|e| AllocError::exhausted(self.table.chunk_size(), e))?;
        let id = state.insert_chunk(chunk);
        tracing::debug!(
            arena = self.index,
            chunk = id,
            size = self.table.chunk_size(),
            outcome = "chunk_created",
            "chunk created"
        );
        let ArenaState {
            slots,
            subpage_pools,
            ..
        } = &mut *state;
        slots
            .get_mut(id)
            .and_then(Option::as_mut)
            .and_then(|slot| allocate_in(id, slot, class, subpage_pools))
            .map(|handle| (id, handle))
            .ok_or_else(|| self.lost_chunk(class.size))
    }

    fn lost_chunk(&self, size: usize) -> AllocError {
        AllocError::exhausted(size, arenabuf_membrane::RegionError::OutOfMemory { size })
    }

    /// Serve a request above the chunk size with a dedicated region.
    pub(crate) fn allocate_huge(&self, size: usize, length: usize) -> Result<Allocation, AllocError> {
        let region = self.huge.alloc(size, self.alignment)?;
        self.active_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(Allocation {
            arena: self.index,
            owner: self.id,
            origin: Origin::Huge,
            region,
            offset: 0,
            length: length.min(size),
            max_length: size,
        })
    }

    /// Return an allocation to its chunk (or drop its huge region). Callers
    /// check [`PoolArena::owns`] first.
    pub(crate) fn free(&self, alloc: Allocation) {
        debug_assert!(self.owns(&alloc), "allocation freed to the wrong arena");
        self.active_bytes
            .fetch_sub(alloc.max_length, Ordering::Relaxed);
        let (chunk, handle, tier) = match alloc.origin {
            Origin::Huge => {
                self.huge.free(alloc.region);
                return;
            }
            Origin::Pooled {
                chunk,
                handle,
                tier,
                ..
            } => (chunk, handle, tier),
        };

        {
            let mut state = self.state.lock();
            let outcome = state.slot_mut(chunk).and_then(|slot| slot.chunk.free(handle));
            match outcome {
                Some(ChunkFree::SubpagePartial {
                    size_idx,
                    run_offset,
                    was_full: true,
                }) => {
                    state.subpage_pools[size_idx].insert((chunk, run_offset));
                }
                Some(ChunkFree::SubpageReleased {
                    size_idx,
                    run_offset,
                }) => {
                    state.subpage_pools[size_idx].remove(&(chunk, run_offset));
                }
                Some(_) => {}
                None => debug_assert!(false, "free of unknown handle {handle:?} in chunk {chunk}"),
            }
            state.relocate(self.index, chunk);
        }

        if let Some(counters) = self.counters(tier) {
            counters.deallocations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Huge counters live in the huge allocator.
    fn counters(&self, tier: Tier) -> Option<&TierCounters> {
        match tier {
            Tier::Small => Some(&self.small),
            Tier::Normal => Some(&self.normal),
            Tier::Huge => None,
        }
    }

    /// Threads currently bound to this arena.
    #[must_use]
    pub fn num_thread_caches(&self) -> usize {
        self.num_thread_caches.load(Ordering::Relaxed)
    }

    pub(crate) fn bind_thread_cache(&self) {
        self.num_thread_caches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unbind_thread_cache(&self) {
        self.num_thread_caches.fetch_sub(1, Ordering::Relaxed);
    }

    /// Usable bytes handed out and not yet returned.
    #[must_use]
    pub fn active_bytes(&self) -> usize {
        self.active_bytes.load(Ordering::Relaxed)
    }

    /// Chunk memory plus live huge regions.
    #[must_use]
    pub fn used_memory(&self) -> usize {
        let chunks = self.state.lock().slots.iter().flatten().count();
        chunks * self.table.chunk_size() + self.huge.active_bytes()
    }

    #[must_use]
    pub fn metrics(&self) -> ArenaMetrics {
        let state = self.state.lock();
        let chunk_lists = state
            .lists
            .iter()
            .map(|list| {
                let chunks = list
                    .chunks()
                    .iter()
                    .filter_map(|&id| state.slots.get(id).and_then(Option::as_ref));
                let (chunk_usages, free_bytes) = chunks.fold(
                    (Vec::with_capacity(list.len()), 0),
                    |(mut usages, free), slot| {
                        usages.push(slot.chunk.usage());
                        (usages, free + slot.chunk.free_bytes())
                    },
                );
                ChunkListMetrics {
                    name: list.name(),
                    min_usage: list.min_usage(),
                    max_usage: list.max_usage(),
                    chunk_usages,
                    free_bytes,
                }
            })
            .collect();
        let subpages = state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|s| (id, s)))
            .flat_map(|(id, slot)| {
                slot.chunk.subpages().map(move |s| SubpageMetrics {
                    chunk: id,
                    run_offset: s.run_offset(),
                    elem_size: s.elem_size(),
                    max_num_elems: s.max_num_elems(),
                    num_avail: s.num_avail(),
                })
            })
            .collect();
        let chunks = state.slots.iter().flatten().count();
        drop(state);

        ArenaMetrics {
            index: self.index,
            num_thread_caches: self.num_thread_caches(),
            allocations_small: self.small.allocations.load(Ordering::Relaxed),
            allocations_normal: self.normal.allocations.load(Ordering::Relaxed),
            allocations_huge: self.huge.allocations(),
            deallocations_small: self.small.deallocations.load(Ordering::Relaxed),
            deallocations_normal: self.normal.deallocations.load(Ordering::Relaxed),
            deallocations_huge: self.huge.deallocations(),
            active_bytes: self.active_bytes(),
            huge_active_bytes: self.huge.active_bytes(),
            chunks,
            chunk_lists,
            subpages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::chunk_list::{Q000, Q100};
    use crate::alloc::size_class::size_classes;

    fn arena() -> PoolArena {
        PoolArena::new(0, size_classes(8192, 16), 0)
    }

    fn idx(arena: &PoolArena, size: usize) -> usize {
        arena.size_classes().size_to_index(size)
    }

    #[test]
    fn small_allocation_creates_subpage() {
        let arena = arena();
        let a = arena.allocate(idx(&arena, 100), 100).unwrap();
        assert_eq!(a.tier(), Tier::Small);
        assert_eq!(a.len(), 100);
        assert_eq!(a.max_length(), 112);
        let m = arena.metrics();
        assert_eq!(m.chunks, 1);
        assert_eq!(m.subpages.len(), 1);
        assert_eq!(m.subpages[0].elem_size, 112);
        assert_eq!(m.subpages[0].num_avail, m.subpages[0].max_num_elems - 1);

        arena.free(a);
        let m = arena.metrics();
        assert!(m.subpages.is_empty(), "empty subpage must return its run");
        assert_eq!(m.chunk_usages().collect::<Vec<_>>(), vec![0]);
        assert_eq!(m.active_bytes, 0);
    }

    #[test]
    fn small_allocations_share_pooled_subpage() {
        let arena = arena();
        let i = idx(&arena, 64);
        let a = arena.allocate(i, 64).unwrap();
        let b = arena.allocate(i, 64).unwrap();
        assert_eq!(b.offset(), a.offset() + 64);
        assert_eq!(arena.metrics().subpages.len(), 1);
        arena.free(a);
        arena.free(b);
    }

    #[test]
    fn full_subpage_leaves_pool_and_returns() {
        let arena = arena();
        let i = idx(&arena, 4096);
        let a = arena.allocate(i, 4096).unwrap();
        let b = arena.allocate(i, 4096).unwrap();
        // Subpage full: the next element comes from a new run.
        let c = arena.allocate(i, 4096).unwrap();
        assert_eq!(arena.metrics().subpages.len(), 2);
        arena.free(b);
        // Room again in the first subpage.
        let d = arena.allocate(i, 4096).unwrap();
        assert_eq!(d.address_range(), {
            let start = a.address_range().end;
            start..start + 4096
        });
        for x in [a, c, d] {
            arena.free(x);
        }
        assert!(arena.metrics().subpages.is_empty());
    }

    #[test]
    fn normal_allocation_spans_pages() {
        let arena = arena();
        let a = arena.allocate(idx(&arena, 20_000), 20_000).unwrap();
        assert_eq!(a.tier(), Tier::Normal);
        assert_eq!(a.max_length(), 3 * 8192);
        assert_eq!(a.len(), 20_000);
        arena.free(a);
        let m = arena.metrics();
        assert_eq!(m.allocations_normal, 1);
        assert_eq!(m.deallocations_normal, 1);
        assert_eq!(m.active_allocations(), 0);
    }

    #[test]
    fn huge_bypasses_chunks() {
        let arena = arena();
        let a = arena.allocate(idx(&arena, 1_000_000), 1_000_000).unwrap();
        assert_eq!(a.tier(), Tier::Huge);
        assert_eq!(a.len(), 1_000_000);
        let m = arena.metrics();
        assert_eq!(m.chunks, 0);
        assert_eq!(m.huge_active_bytes, 1_000_000);
        arena.free(a);
        let m = arena.metrics();
        assert_eq!(m.allocations_huge, 1);
        assert_eq!(m.deallocations_huge, 1);
        assert_eq!(m.huge_active_bytes, 0);
        assert_eq!(m.chunks, 0);
    }

    #[test]
    fn huge_entry_applies_alignment() {
        let arena = PoolArena::new(0, size_classes(8192, 16), 64);
        let a = arena.allocate(idx(&arena, 1_000_001), 1_000_001).unwrap();
        assert_eq!(a.max_length(), 1_000_064);
        assert_eq!(a.len(), 1_000_001);
        assert_eq!(a.region().base_addr() % 64, 0);
        arena.free(a);
        assert_eq!(arena.active_bytes(), 0);
    }

    #[test]
    fn chunks_migrate_between_lists() {
        let arena = arena();
        let full = arena.allocate(idx(&arena, 131_072), 131_072).unwrap();
        let m = arena.metrics();
        assert_eq!(m.chunk_lists[Q100].chunk_usages, vec![100]);
        arena.free(full);
        // Drops through q075..q000 and is released at usage 0.
        let m = arena.metrics();
        assert_eq!(m.chunks, 0);
        assert!(m.chunk_lists[Q000].chunk_usages.is_empty());
    }

    #[test]
    fn init_chunk_is_kept_when_empty() {
        let arena = arena();
        let a = arena.allocate(idx(&arena, 8192), 8192).unwrap();
        arena.free(a);
        let m = arena.metrics();
        assert_eq!(m.chunks, 1);
        assert_eq!(m.chunk_lists[QINIT].chunk_usages, vec![0]);
    }

    #[test]
    fn chunk_size_request_reuses_empty_init_chunk() {
        let arena = arena();
        let a = arena.allocate(idx(&arena, 8192), 8192).unwrap();
        let base = a.region().base_addr();
        arena.free(a);
        let whole = arena.allocate(idx(&arena, 131_072), 131_072).unwrap();
        assert_eq!(whole.region().base_addr(), base);
        assert_eq!(arena.metrics().chunks, 1);
        arena.free(whole);
    }

    #[test]
    fn second_chunk_when_first_is_full() {
        let arena = arena();
        let i = idx(&arena, 65_536);
        let allocs: Vec<_> = (0..3).map(|_| arena.allocate(i, 65_536).unwrap()).collect();
        assert_eq!(arena.metrics().chunks, 2);
        let regions: BTreeSet<_> = allocs.iter().map(|a| a.region().base_addr()).collect();
        assert_eq!(regions.len(), 2);
        for a in allocs {
            arena.free(a);
        }
    }

    #[test]
    fn allocations_never_overlap() {
        let arena = arena();
        let sizes = [16, 100, 500, 4096, 5000, 8192, 20_000, 40_000];
        let allocs: Vec<_> = sizes
            .iter()
            .cycle()
            .take(64)
            .map(|&s| arena.allocate(idx(&arena, s), s).unwrap())
            .collect();
        let mut ranges: Vec<_> = allocs.iter().map(Allocation::address_range).collect();
        ranges.sort_by_key(|r| r.start);
        for pair in ranges.windows(2) {
            assert!(pair[0].end <= pair[1].start, "{pair:?} overlap");
        }
        for a in allocs {
            arena.free(a);
        }
        assert_eq!(arena.active_bytes(), 0);
    }
}
