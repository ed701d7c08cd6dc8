//! Bitmap allocator for small elements inside one run.

/// Outcome of returning an element to its subpage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubpageFree {
    /// Elements are still in use. `was_full` is set when this free made the
    /// first element available again.
    Partial { was_full: bool },
    /// Every element is free; the run can go back to the chunk.
    Empty,
}

/// A run carved into `max_num_elems` elements of `elem_size` bytes.
#[derive(Debug, Clone)]
pub struct Subpage {
    run_offset: usize,
    run_size: usize,
    size_idx: usize,
    elem_size: usize,
    max_num_elems: usize,
    num_avail: usize,
    bitmap: Vec<u64>,
}

impl Subpage {
    /// `run_offset` is in pages, `run_size` in bytes.
    #[must_use]
    pub fn new(run_offset: usize, run_size: usize, size_idx: usize, elem_size: usize) -> Self {
        debug_assert!(elem_size > 0 && elem_size <= run_size);
        let max_num_elems = run_size / elem_size;
        Self {
            run_offset,
            run_size,
            size_idx,
            elem_size,
            max_num_elems,
            num_avail: max_num_elems,
            bitmap: vec![0; max_num_elems.div_ceil(64)],
        }
    }

    /// Claim the lowest free element. Returns its index, or `None` when full.
    pub fn allocate(&mut self) -> Option<u32> {
        if self.num_avail == 0 {
            return None;
        }
        let (word_idx, word) = self
            .bitmap
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u64::MAX)?;
        let bit = (!*word).trailing_zeros() as usize;
        let idx = word_idx * 64 + bit;
        if idx >= self.max_num_elems {
            return None;
        }
        self.bitmap[word_idx] |= 1 << bit;
        self.num_avail -= 1;
        u32::try_from(idx).ok()
    }

    /// Return element `idx`.
    pub fn free(&mut self, idx: u32) -> SubpageFree {
        let idx = idx as usize;
        let (word, bit) = (idx / 64, idx % 64);
        debug_assert!(idx < self.max_num_elems, "element {idx} out of range");
        debug_assert!(self.bitmap[word] & (1 << bit) != 0, "element {idx} already free");
        self.bitmap[word] &= !(1 << bit);
        let was_full = self.num_avail == 0;
        self.num_avail += 1;
        if self.num_avail == self.max_num_elems {
            SubpageFree::Empty
        } else {
            SubpageFree::Partial { was_full }
        }
    }

    #[must_use]
    pub fn is_allocated(&self, idx: u32) -> bool {
        let idx = idx as usize;
        idx < self.max_num_elems && self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    /// Byte offset of element `idx` from the start of the run.
    #[must_use]
    pub fn element_offset(&self, idx: u32) -> usize {
        idx as usize * self.elem_size
    }

    #[must_use]
    pub fn run_offset(&self) -> usize {
        self.run_offset
    }

    #[must_use]
    pub fn run_size(&self) -> usize {
        self.run_size
    }

    #[must_use]
    pub fn size_idx(&self) -> usize {
        self.size_idx
    }

    #[must_use]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    #[must_use]
    pub fn max_num_elems(&self) -> usize {
        self.max_num_elems
    }

    #[must_use]
    pub fn num_avail(&self) -> usize {
        self.num_avail
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.num_avail == 0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_avail == self.max_num_elems
    }
}
