//! Size class table.
//!
//! Every request is rounded up to a size class. Classes are generated in
//! groups of four: each group doubles the previous group's base and splits
//! the doubling into four equal steps, so the first classes are
//! 16, 32, 48, 64, 80, 96, 112, 128, 160, 192, ... and the last one is
//! exactly the chunk size. Requests above the chunk size are huge and are
//! not rounded to a class.
//!
//! Classes are split into tiers:
//! - **small**: at most half a page; served from a one-page subpage run
//!   carved into equal elements.
//! - **normal**: up to the chunk size; served by a run of whole pages.
//! - **huge**: above the chunk size; served by a dedicated region.
//!
//! Besides the byte classes, the table keeps the page-count classes (the
//! byte classes that are exact page multiples). Free runs are bucketed by
//! these.

use std::sync::Arc;

use parking_lot::Mutex;

/// log2 of the smallest class and of the first group's step.
pub const LOG2_QUANTUM: u32 = 4;

/// log2 of the number of classes per doubling.
pub const LOG2_SIZE_CLASS_GROUP: u32 = 2;

/// Sizes up to `1 << LOG2_MAX_LOOKUP_SIZE` are mapped through a flat table.
pub const LOG2_MAX_LOOKUP_SIZE: u32 = 12;

/// Smallest size class (bytes).
pub const MIN_SIZE: usize = 1 << LOG2_QUANTUM;

/// Allocation tier of a size class or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Small,
    Normal,
    Huge,
}

/// One entry of the size class table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    /// Position in the table.
    pub index: usize,
    /// Element size in bytes.
    pub size: usize,
    /// Pages in the run that serves this class. Small classes use one page.
    pub pages: usize,
    /// Served from a subpage.
    pub is_subpage: bool,
    /// `size` is an exact multiple of the page size.
    pub is_page_multiple: bool,
}

impl SizeClass {
    #[must_use]
    pub fn tier(&self) -> Tier {
        if self.is_subpage {
            Tier::Small
        } else {
            Tier::Normal
        }
    }
}

/// The size class table for one page/chunk geometry.
#[derive(Debug)]
pub struct SizeClasses {
    page_size: usize,
    page_shifts: u32,
    chunk_size: usize,
    classes: Vec<SizeClass>,
    /// Page-count classes, ascending.
    page_classes: Vec<usize>,
    /// `(size - 1) >> LOG2_QUANTUM` -> class index, for sizes up to the lookup limit.
    lookup: Vec<u16>,
    n_subpages: usize,
}

static TABLES: Mutex<Vec<Arc<SizeClasses>>> = parking_lot::const_mutex(Vec::new());

/// Shared table for a geometry. Built on first use and memoized for the life
/// of the process.
#[must_use]
pub fn size_classes(page_size: usize, chunk_pages: usize) -> Arc<SizeClasses> {
    let mut tables = TABLES.lock();
    let chunk_size = page_size * chunk_pages;
    if let Some(table) = tables
        .iter()
        .find(|t| t.page_size == page_size && t.chunk_size == chunk_size)
    {
        return Arc::clone(table);
    }
    let table = Arc::new(SizeClasses::new(page_size, chunk_pages));
    tables.push(Arc::clone(&table));
    table
}

impl SizeClasses {
    /// Build the table. `page_size` and `chunk_pages` must be powers of two
    /// (see `PoolConfig::validate`).
    #[must_use]
    pub fn new(page_size: usize, chunk_pages: usize) -> Self {
        debug_assert!(page_size.is_power_of_two() && page_size >= MIN_SIZE);
        debug_assert!(chunk_pages.is_power_of_two());
        let chunk_size = page_size * chunk_pages;
        let page_shifts = page_size.trailing_zeros();

        let mut classes = Vec::new();
        let push = |size: usize, classes: &mut Vec<SizeClass>| {
            let is_subpage = size <= page_size / 2;
            let pages = if is_subpage { 1 } else { size.div_ceil(page_size) };
            classes.push(SizeClass {
                index: classes.len(),
                size,
                pages,
                is_subpage,
                is_page_multiple: size % page_size == 0,
            });
        };

        // First group starts at zero: 16, 32, 48, 64.
        let ndelta_limit = 1usize << LOG2_SIZE_CLASS_GROUP;
        let mut size = 0;
        for n_delta in 1..=ndelta_limit {
            size = n_delta << LOG2_QUANTUM;
            push(size, &mut classes);
        }
        // Remaining groups: base doubles, step doubles.
        let mut log2_group = LOG2_QUANTUM + LOG2_SIZE_CLASS_GROUP;
        let mut log2_delta = LOG2_QUANTUM;
        while size < chunk_size {
            for n_delta in 1..=ndelta_limit {
                size = (1usize << log2_group) + (n_delta << log2_delta);
                push(size, &mut classes);
                if size >= chunk_size {
                    break;
                }
            }
            log2_group += 1;
            log2_delta += 1;
        }
        debug_assert_eq!(size, chunk_size);

        let page_classes = classes
            .iter()
            .filter(|c| c.is_page_multiple)
            .map(|c| c.size >> page_shifts)
            .collect();

        let n_subpages = classes.iter().filter(|c| c.is_subpage).count();

        let lookup_max = (1usize << LOG2_MAX_LOOKUP_SIZE).min(chunk_size);
        let mut lookup = Vec::with_capacity(lookup_max >> LOG2_QUANTUM);
        let mut idx = 0usize;
        for slot in 0..(lookup_max >> LOG2_QUANTUM) {
            let size = (slot + 1) << LOG2_QUANTUM;
            while classes[idx].size < size {
                idx += 1;
            }
            lookup.push(idx as u16);
        }

        Self {
            page_size,
            page_shifts,
            chunk_size,
            classes,
            page_classes,
            lookup,
            n_subpages,
        }
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn page_shifts(&self) -> u32 {
        self.page_shifts
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[must_use]
    pub fn chunk_pages(&self) -> usize {
        self.chunk_size >> self.page_shifts
    }

    /// Number of byte classes. Also the index returned for huge sizes.
    #[must_use]
    pub fn n_sizes(&self) -> usize {
        self.classes.len()
    }

    /// Number of small classes. Small classes occupy indices `0..n_subpages`.
    #[must_use]
    pub fn n_subpages(&self) -> usize {
        self.n_subpages
    }

    /// Number of page-count classes.
    #[must_use]
    pub fn n_page_sizes(&self) -> usize {
        self.page_classes.len()
    }

    #[must_use]
    pub fn class(&self, index: usize) -> Option<&SizeClass> {
        self.classes.get(index)
    }

    #[must_use]
    pub fn classes(&self) -> &[SizeClass] {
        &self.classes
    }

    /// Class index for `size` (rounded up). A size exactly on a class boundary
    /// maps to that class. Returns `n_sizes()` for huge sizes.
    #[must_use]
    pub fn size_to_index(&self, size: usize) -> usize {
        if size == 0 {
            return 0;
        }
        if size > self.chunk_size {
            return self.classes.len();
        }
        let slot = (size - 1) >> LOG2_QUANTUM;
        if let Some(&idx) = self.lookup.get(slot) {
            return usize::from(idx);
        }
        self.classes.partition_point(|c| c.size < size)
    }

    /// Exact byte size of a class. Returns 0 for out-of-range indices.
    #[must_use]
    pub fn index_to_size(&self, index: usize) -> usize {
        self.classes.get(index).map_or(0, |c| c.size)
    }

    /// Smallest page-count class holding at least `pages` pages.
    /// Returns `n_page_sizes()` if `pages` exceeds the chunk.
    #[must_use]
    pub fn pages_to_page_index(&self, pages: usize) -> usize {
        self.page_classes.partition_point(|&p| p < pages)
    }

    /// Largest page-count class holding at most `pages` pages (`pages >= 1`).
    #[must_use]
    pub fn pages_to_page_index_floor(&self, pages: usize) -> usize {
        self.page_classes
            .partition_point(|&p| p <= pages)
            .saturating_sub(1)
    }

    /// Pages of a page-count class. Returns 0 for out-of-range indices.
    #[must_use]
    pub fn page_index_to_pages(&self, page_index: usize) -> usize {
        self.page_classes.get(page_index).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn tier(&self, size: usize) -> Tier {
        match self.class(self.size_to_index(size)) {
            Some(class) => class.tier(),
            None => Tier::Huge,
        }
    }

    #[must_use]
    pub fn is_huge(&self, size: usize) -> bool {
        size > self.chunk_size
    }

    /// Usable size for a request: the smallest class that is at least the
    /// aligned request and itself a multiple of `alignment` (0 = none).
    /// Huge requests are aligned but not rounded to a class.
    #[must_use]
    pub fn normalize_size(&self, size: usize, alignment: usize) -> usize {
        let aligned = align_up(size, alignment);
        if aligned > self.chunk_size {
            return aligned;
        }
        let mut idx = self.size_to_index(aligned);
        while let Some(class) = self.classes.get(idx) {
            if alignment == 0 || class.size % alignment == 0 {
                return class.size;
            }
            idx += 1;
        }
        aligned
    }
}

/// Round `size` up to a multiple of `alignment` (a power of two, or 0 for none).
#[must_use]
pub fn align_up(size: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return size;
    }
    let mask = alignment - 1;
    size.checked_add(mask).map_or(usize::MAX & !mask, |s| s & !mask)
}
