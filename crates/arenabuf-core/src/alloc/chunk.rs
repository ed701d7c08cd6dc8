//! One chunk of backing memory, split into page runs and subpages.
//!
//! Free runs sit in buckets indexed by the floor page class of their length,
//! ordered by offset. Every run, free or used, is also recorded in the
//! chunk's [`RunMap`] under its first and last page so that a freed run can
//! find and absorb free neighbours in constant time.

use std::collections::BTreeSet;
use std::sync::Arc;

use arenabuf_membrane::{MemoryRegion, RegionError};

use super::run::RunHandle;
use super::run_map::RunMap;
use super::size_class::SizeClasses;
use super::subpage::{Subpage, SubpageFree};

/// Outcome of [`Chunk::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFree {
    /// A subpage element was freed and the subpage still has live elements.
    SubpagePartial {
        size_idx: usize,
        run_offset: usize,
        was_full: bool,
    },
    /// The last live element was freed; the subpage's run went back to the chunk.
    SubpageReleased { size_idx: usize, run_offset: usize },
    /// A page run was freed.
    Run { pages: usize },
}

/// A chunk-sized memory region plus its run bookkeeping.
#[derive(Debug)]
pub struct Chunk {
    region: Arc<MemoryRegion>,
    table: Arc<SizeClasses>,
    runs_avail: Vec<BTreeSet<RunHandle>>,
    run_map: RunMap,
    subpages: Vec<Option<Subpage>>,
    free_bytes: usize,
}

impl Chunk {
    /// Allocate a new chunk's memory and mark all of it as one free run.
    pub fn new(table: Arc<SizeClasses>, alignment: usize) -> Result<Self, RegionError> {
        let region = Arc::new(MemoryRegion::allocate(table.chunk_size(), alignment)?);
        Ok(Self::with_region(table, region))
    }

    fn with_region(table: Arc<SizeClasses>, region: Arc<MemoryRegion>) -> Self {
        let chunk_pages = table.chunk_pages();
        let mut chunk = Self {
            runs_avail: vec![BTreeSet::new(); table.n_page_sizes()],
            run_map: RunMap::new(),
            subpages: vec![None; chunk_pages],
            free_bytes: table.chunk_size(),
            region,
            table,
        };
        chunk.insert_avail_run(RunHandle::free(0, chunk_pages));
        chunk
    }

    #[must_use]
    pub fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.table.chunk_size()
    }

    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Percentage of pages in use, rounded up. Only an entirely free chunk
    /// reports 0 and only an entirely used one reports 100.
    #[must_use]
    pub fn usage(&self) -> u32 {
        let used = self.chunk_size() - self.free_bytes;
        (used * 100).div_ceil(self.chunk_size()) as u32
    }

    /// Claim a run of `pages` pages. Returns `None` if no free run is long enough.
    pub fn allocate_run(&mut self, pages: usize) -> Option<RunHandle> {
        if pages == 0 || pages > self.table.chunk_pages() {
            return None;
        }
        let run = self.find_free_run(pages)?;
        self.remove_avail_run(run);

        let remainder = run.pages() - pages;
        if remainder > 0 {
            self.insert_avail_run(RunHandle::free(run.offset() + pages, remainder));
        }
        let used = RunHandle::used(run.offset(), pages);
        self.insert_run_entries(used);
        self.free_bytes -= pages << self.table.page_shifts();
        Some(used)
    }

    /// Lowest-offset free run with at least `pages` pages. The floor bucket
    /// holds runs both shorter and longer than `pages`; every run in a higher
    /// bucket is long enough.
    fn find_free_run(&self, pages: usize) -> Option<RunHandle> {
        let floor = self.table.pages_to_page_index_floor(pages);
        self.runs_avail[floor]
            .iter()
            .find(|r| r.pages() >= pages)
            .or_else(|| {
                let ceil = self.table.pages_to_page_index(pages).max(floor + 1);
                self.runs_avail
                    .get(ceil..)?
                    .iter()
                    .find_map(|bucket| bucket.first())
            })
            .copied()
    }

    /// Return a used run and merge it with free neighbours.
    pub fn free_run(&mut self, handle: RunHandle) {
        let used = handle.run();
        debug_assert!(used.is_used(), "freeing a run that is not in use");
        debug_assert_eq!(
            self.run_map.get(used.offset() as u64),
            Some(used.raw()),
            "run map does not record {used:?}"
        );
        self.remove_run_entries(used);
        self.free_bytes += used.pages() << self.table.page_shifts();

        let mut run = RunHandle::free(used.offset(), used.pages());
        run = self.collapse_past(run);
        run = self.collapse_next(run);
        self.insert_avail_run(run);
    }

    fn collapse_past(&mut self, mut run: RunHandle) -> RunHandle {
        while let Some(prev) = run
            .offset()
            .checked_sub(1)
            .and_then(|page| self.run_map.get(page as u64))
            .map(RunHandle::from_raw)
        {
            if prev.is_used() || prev.end() != run.offset() {
                break;
            }
            self.remove_avail_run(prev);
            run = RunHandle::free(prev.offset(), prev.pages() + run.pages());
        }
        run
    }

    fn collapse_next(&mut self, mut run: RunHandle) -> RunHandle {
        while let Some(next) = self
            .run_map
            .get(run.end() as u64)
            .map(RunHandle::from_raw)
        {
            if next.is_used() || next.offset() != run.end() {
                break;
            }
            self.remove_avail_run(next);
            run = RunHandle::free(run.offset(), run.pages() + next.pages());
        }
        run
    }

    /// Carve a fresh one-page run into `elem_size` elements and claim the
    /// first. The returned handle identifies the element.
    pub fn allocate_subpage(&mut self, size_idx: usize, elem_size: usize) -> Option<RunHandle> {
        let run = self.allocate_run(1)?;
        let mut subpage = Subpage::new(run.offset(), self.table.page_size(), size_idx, elem_size);
        let Some(bitmap_idx) = subpage.allocate() else {
            self.free_run(run);
            return None;
        };
        self.subpages[run.offset()] = Some(subpage);
        Some(run.subpage_element(bitmap_idx))
    }

    /// Claim an element from the existing subpage at `run_offset`.
    pub fn allocate_from_subpage(&mut self, run_offset: usize) -> Option<RunHandle> {
        let subpage = self.subpages.get_mut(run_offset)?.as_mut()?;
        let bitmap_idx = subpage.allocate()?;
        let run = RunHandle::used(run_offset, 1);
        Some(run.subpage_element(bitmap_idx))
    }

    /// Free an element or run previously handed out by this chunk. Returns
    /// `None` if `handle` does not describe a live subpage.
    pub fn free(&mut self, handle: RunHandle) -> Option<ChunkFree> {
        if !handle.is_subpage() {
            self.free_run(handle);
            return Some(ChunkFree::Run {
                pages: handle.pages(),
            });
        }
        let run_offset = handle.offset();
        let subpage = self.subpages.get_mut(run_offset)?.as_mut()?;
        let size_idx = subpage.size_idx();
        match subpage.free(handle.bitmap_idx()) {
            SubpageFree::Partial { was_full } => Some(ChunkFree::SubpagePartial {
                size_idx,
                run_offset,
                was_full,
            }),
            SubpageFree::Empty => {
                self.subpages[run_offset] = None;
                self.free_run(handle.run());
                Some(ChunkFree::SubpageReleased {
                    size_idx,
                    run_offset,
                })
            }
        }
    }

    /// Byte offset of `handle` inside the chunk's region.
    #[must_use]
    pub fn byte_offset(&self, handle: RunHandle) -> usize {
        let run_start = handle.offset() << self.table.page_shifts();
        if handle.is_subpage() {
            let elem = self
                .subpage(handle.offset())
                .map_or(0, |s| s.element_offset(handle.bitmap_idx()));
            run_start + elem
        } else {
            run_start
        }
    }

    /// Usable bytes behind `handle`: the element size for subpage elements,
    /// the run length otherwise.
    #[must_use]
    pub fn usable_len(&self, handle: RunHandle) -> usize {
        if handle.is_subpage() {
            self.subpage(handle.offset()).map_or(0, Subpage::elem_size)
        } else {
            handle.pages() << self.table.page_shifts()
        }
    }

    #[must_use]
    pub fn subpage(&self, run_offset: usize) -> Option<&Subpage> {
        self.subpages.get(run_offset)?.as_ref()
    }

    pub fn subpages(&self) -> impl Iterator<Item = &Subpage> {
        self.subpages.iter().flatten()
    }

    /// All runs in page order, walking the run map from page 0. Free and used
    /// runs together cover the chunk exactly.
    #[must_use]
    pub fn runs(&self) -> Vec<RunHandle> {
        let mut runs = Vec::new();
        let mut page = 0;
        while page < self.table.chunk_pages() {
            let Some(run) = self.run_map.get(page as u64).map(RunHandle::from_raw) else {
                break;
            };
            if run.pages() == 0 || run.offset() != page {
                break;
            }
            runs.push(run);
            page = run.end();
        }
        runs
    }

    /// Free runs, by bucket then offset.
    pub fn free_runs(&self) -> impl Iterator<Item = RunHandle> + '_ {
        self.runs_avail.iter().flatten().copied()
    }

    fn insert_avail_run(&mut self, run: RunHandle) {
        let bucket = self.table.pages_to_page_index_floor(run.pages());
        let inserted = self.runs_avail[bucket].insert(run);
        debug_assert!(inserted, "free run {run:?} already bucketed");
        self.insert_run_entries(run);
    }

    fn remove_avail_run(&mut self, run: RunHandle) {
        let bucket = self.table.pages_to_page_index_floor(run.pages());
        let removed = self.runs_avail[bucket].remove(&run);
        debug_assert!(removed, "free run {run:?} missing from its bucket");
        self.remove_run_entries(run);
    }

    fn insert_run_entries(&mut self, run: RunHandle) {
        self.run_map.put(run.offset() as u64, run.raw());
        if run.pages() > 1 {
            self.run_map.put(run.last_page() as u64, run.raw());
        }
    }

    fn remove_run_entries(&mut self, run: RunHandle) {
        self.run_map.remove(run.offset() as u64);
        if run.pages() > 1 {
            self.run_map.remove(run.last_page() as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::size_class::size_classes;

    fn chunk() -> Chunk {
        Chunk::new(size_classes(8192, 16), 8192).expect("chunk memory")
    }

    fn assert_partitioned(chunk: &Chunk) {
        let runs = chunk.runs();
        let total: usize = runs.iter().map(|r| r.pages()).sum();
        assert_eq!(total, 16, "runs {runs:?} do not cover the chunk");
        for pair in runs.windows(2) {
            assert_eq!(pair[0].end(), pair[1].offset());
            assert!(
                pair[0].is_used() || pair[1].is_used(),
                "adjacent free runs {pair:?} not coalesced"
            );
        }
        let free_pages: usize = runs.iter().filter(|r| !r.is_used()).map(|r| r.pages()).sum();
        assert_eq!(free_pages * 8192, chunk.free_bytes());
    }

    #[test]
    fn new_chunk_is_one_free_run() {
        let c = chunk();
        assert_eq!(c.usage(), 0);
        assert_eq!(c.runs(), vec![RunHandle::free(0, 16)]);
        assert_eq!(c.free_runs().count(), 1);
    }

    #[test]
    fn allocate_splits_and_free_coalesces() {
        let mut c = chunk();
        let a = c.allocate_run(3).unwrap();
        assert_eq!((a.offset(), a.pages()), (0, 3));
        let b = c.allocate_run(2).unwrap();
        assert_eq!((b.offset(), b.pages()), (3, 2));
        assert_partitioned(&c);

        c.free_run(a);
        assert_partitioned(&c);
        c.free_run(b);
        assert_partitioned(&c);
        assert_eq!(c.runs(), vec![RunHandle::free(0, 16)]);
        assert_eq!(c.usage(), 0);
    }

    #[test]
    fn adjacent_frees_merge_into_one_run() {
        let mut c = chunk();
        let a = c.allocate_run(4).unwrap();
        let b = c.allocate_run(4).unwrap();
        let _guard = c.allocate_run(8).unwrap();
        c.free_run(a);
        c.free_run(b);
        let free: Vec<_> = c.free_runs().collect();
        assert_eq!(free, vec![RunHandle::free(0, 8)]);
    }

    #[test]
    fn exact_fit_preferred_within_floor_bucket() {
        let mut c = chunk();
        // Leave a 9-page hole at 0 and a 1-page hole at 15.
        let a = c.allocate_run(9).unwrap();
        let _b = c.allocate_run(6).unwrap();
        c.free_run(a);
        // 9 pages sit in the 8-page bucket; a 9-page request must still find them.
        let again = c.allocate_run(9).unwrap();
        assert_eq!(again.offset(), 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut c = chunk();
        assert!(c.allocate_run(16).is_some());
        assert_eq!(c.usage(), 100);
        assert!(c.allocate_run(1).is_none());
        assert!(c.allocate_run(0).is_none());
        assert!(c.allocate_run(17).is_none());
    }

    #[test]
    fn usage_rounds_up() {
        let mut c = chunk();
        c.allocate_run(1).unwrap();
        // 1/16 = 6.25%
        assert_eq!(c.usage(), 7);
    }

    #[test]
    fn subpage_lifecycle_returns_run() {
        let mut c = chunk();
        let first = c.allocate_subpage(6, 112).unwrap();
        assert!(first.is_subpage());
        assert_eq!(first.bitmap_idx(), 0);
        assert_eq!(c.usable_len(first), 112);
        let second = c.allocate_from_subpage(first.offset()).unwrap();
        assert_eq!(c.byte_offset(second), 112);

        assert_eq!(
            c.free(second),
            Some(ChunkFree::SubpagePartial {
                size_idx: 6,
                run_offset: 0,
                was_full: false
            })
        );
        assert_eq!(
            c.free(first),
            Some(ChunkFree::SubpageReleased {
                size_idx: 6,
                run_offset: 0
            })
        );
        assert!(c.subpage(0).is_none());
        assert_eq!(c.usage(), 0);
        assert_partitioned(&c);
    }

    #[test]
    fn random_churn_keeps_partition() {
        let mut c = chunk();
        let mut live = Vec::new();
        let mut x = 0x2545_F491_4F6C_DD1Du64;
        for _ in 0..2_000 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            if x % 2 == 0 || live.is_empty() {
                if let Some(h) = c.allocate_run((x % 5) as usize + 1) {
                    live.push(h);
                }
            } else {
                let h = live.swap_remove((x as usize / 2) % live.len());
                c.free_run(h);
            }
            assert_partitioned(&c);
        }
        for h in live {
            c.free_run(h);
        }
        assert_eq!(c.runs(), vec![RunHandle::free(0, 16)]);
    }
}
