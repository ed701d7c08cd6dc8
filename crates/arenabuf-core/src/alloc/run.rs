//! Packed run descriptors.
//!
//! A run is a contiguous range of pages inside one chunk. Its descriptor
//! packs into a `u64`:
//!
//! ```text
//! oooooooo ooooooos ssssssss ssssssue bbbbbbbb bbbbbbbb bbbbbbbb bbbbbbbb
//! o: page offset (15 bits)   s: length in pages (15 bits)
//! u: in use                  e: subpage element
//! b: element index inside the subpage (32 bits)
//! ```
//!
//! The offset occupies the top bits, so descriptors order by page offset.

use std::fmt;

const SIZE_BIT_LENGTH: u32 = 15;
const BITMAP_IDX_BIT_LENGTH: u32 = 32;

const IS_SUBPAGE_SHIFT: u32 = BITMAP_IDX_BIT_LENGTH;
const IS_USED_SHIFT: u32 = IS_SUBPAGE_SHIFT + 1;
const SIZE_SHIFT: u32 = IS_USED_SHIFT + 1;
const RUN_OFFSET_SHIFT: u32 = SIZE_SHIFT + SIZE_BIT_LENGTH;

const FIELD_MASK: u64 = (1 << SIZE_BIT_LENGTH) - 1;

/// Largest page offset or run length a descriptor can hold.
pub const MAX_RUN_PAGES: usize = FIELD_MASK as usize;

/// One packed run descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunHandle(u64);

impl RunHandle {
    /// A free run of `pages` pages at page `offset`.
    #[must_use]
    pub const fn free(offset: usize, pages: usize) -> Self {
        Self(((offset as u64) << RUN_OFFSET_SHIFT) | ((pages as u64) << SIZE_SHIFT))
    }

    /// An in-use run of `pages` pages at page `offset`.
    #[must_use]
    pub const fn used(offset: usize, pages: usize) -> Self {
        Self(Self::free(offset, pages).0 | (1 << IS_USED_SHIFT))
    }

    /// Element `bitmap_idx` of the subpage occupying this run.
    #[must_use]
    pub const fn subpage_element(self, bitmap_idx: u32) -> Self {
        let run = self.0 & !((1 << IS_USED_SHIFT) - 1);
        Self(run | (1 << IS_USED_SHIFT) | (1 << IS_SUBPAGE_SHIFT) | bitmap_idx as u64)
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn offset(self) -> usize {
        ((self.0 >> RUN_OFFSET_SHIFT) & FIELD_MASK) as usize
    }

    #[must_use]
    pub const fn pages(self) -> usize {
        ((self.0 >> SIZE_SHIFT) & FIELD_MASK) as usize
    }

    /// Page just past the run.
    #[must_use]
    pub const fn end(self) -> usize {
        self.offset() + self.pages()
    }

    /// Last page of the run.
    #[must_use]
    pub const fn last_page(self) -> usize {
        self.offset() + self.pages() - 1
    }

    #[must_use]
    pub const fn is_used(self) -> bool {
        (self.0 >> IS_USED_SHIFT) & 1 == 1
    }

    #[must_use]
    pub const fn is_subpage(self) -> bool {
        (self.0 >> IS_SUBPAGE_SHIFT) & 1 == 1
    }

    #[must_use]
    pub const fn bitmap_idx(self) -> u32 {
        self.0 as u32
    }

    /// The run this descriptor lives in, without subpage bits.
    #[must_use]
    pub const fn run(self) -> Self {
        if self.is_used() {
            Self::used(self.offset(), self.pages())
        } else {
            Self::free(self.offset(), self.pages())
        }
    }
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("RunHandle");
        s.field("offset", &self.offset())
            .field("pages", &self.pages())
            .field("used", &self.is_used());
        if self.is_subpage() {
            s.field("bitmap_idx", &self.bitmap_idx());
        }
        s.finish()
    }
}
