//! Chunk lists bucketed by usage.
//!
//! An arena keeps six lists with overlapping usage ranges so that a chunk
//! hovering around a boundary does not bounce between lists on every
//! allocation:
//!
//! | list   | usage       | below min goes to |
//! |--------|-------------|-------------------|
//! | `init` | `[0, 25)`   | stays             |
//! | `q000` | `[1, 50)`   | released          |
//! | `q025` | `[25, 75)`  | `q000`            |
//! | `q050` | `[50, 100)` | `q025`            |
//! | `q075` | `[75, 100)` | `q050`            |
//! | `q100` | `[100, ∞)`  | `q075`            |
//!
//! New chunks enter `init`. Chunks in `init` are never released, which keeps
//! one warm chunk per arena.

/// Position of a list in the arena's list array.
pub type ListId = usize;

pub const QINIT: ListId = 0;
pub const Q000: ListId = 1;
pub const Q025: ListId = 2;
pub const Q050: ListId = 3;
pub const Q075: ListId = 4;
pub const Q100: ListId = 5;

/// Lists probed for allocation, lowest usage first. `q100` is full by definition.
pub const SEARCH_ORDER: [ListId; 5] = [QINIT, Q000, Q025, Q050, Q075];

/// Where a chunk belongs after its usage changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    List(ListId),
    Release,
}

/// One usage bucket. Holds chunk ids; the chunks live in the arena.
#[derive(Debug, Clone)]
pub struct ChunkList {
    name: &'static str,
    min_usage: u32,
    max_usage: u32,
    max_capacity: usize,
    prev: Option<ListId>,
    next: Option<ListId>,
    chunks: Vec<usize>,
}

impl ChunkList {
    fn new(
        name: &'static str,
        min_usage: u32,
        max_usage: u32,
        chunk_size: usize,
        prev: Option<ListId>,
        next: Option<ListId>,
    ) -> Self {
        Self {
            name,
            min_usage,
            max_usage,
            max_capacity: max_capacity(min_usage, chunk_size),
            prev,
            next,
            chunks: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn min_usage(&self) -> u32 {
        self.min_usage
    }

    #[must_use]
    pub fn max_usage(&self) -> u32 {
        self.max_usage
    }

    /// Most free bytes any chunk in this list can have. Larger requests skip
    /// the list.
    #[must_use]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    #[must_use]
    pub fn accepts(&self, usage: u32) -> bool {
        usage >= self.min_usage && usage < self.max_usage
    }

    pub fn add(&mut self, chunk: usize) {
        debug_assert!(!self.chunks.contains(&chunk));
        self.chunks.push(chunk);
    }

    pub fn remove(&mut self, chunk: usize) -> bool {
        match self.chunks.iter().position(|&c| c == chunk) {
            Some(pos) => {
                self.chunks.remove(pos);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn chunks(&self) -> &[usize] {
        &self.chunks
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Largest free byte count of a chunk whose usage is at least `min_usage`.
/// `init` starts at 0, so it can serve a whole chunk.
fn max_capacity(min_usage: u32, chunk_size: usize) -> usize {
    let min_usage = min_usage as usize;
    if min_usage >= 100 {
        return 0;
    }
    chunk_size * (100 - min_usage) / 100
}

/// The six lists of one arena.
#[must_use]
pub fn new_lists(chunk_size: usize) -> [ChunkList; 6] {
    [
        ChunkList::new("init", 0, 25, chunk_size, Some(QINIT), Some(Q000)),
        ChunkList::new("q000", 1, 50, chunk_size, None, Some(Q025)),
        ChunkList::new("q025", 25, 75, chunk_size, Some(Q000), Some(Q050)),
        ChunkList::new("q050", 50, 100, chunk_size, Some(Q025), Some(Q075)),
        ChunkList::new("q075", 75, 100, chunk_size, Some(Q050), Some(Q100)),
        ChunkList::new("q100", 100, u32::MAX, chunk_size, Some(Q075), None),
    ]
}

/// Follow next/prev links from `current` until a list accepts `usage`.
#[must_use]
pub fn placement(lists: &[ChunkList; 6], current: ListId, usage: u32) -> Placement {
    let mut id = current;
    loop {
        let list = &lists[id];
        if usage >= list.max_usage {
            match list.next {
                Some(next) => id = next,
                None => return Placement::List(id),
            }
        } else if usage < list.min_usage {
            match list.prev {
                Some(prev) if prev == id => return Placement::List(id),
                Some(prev) => id = prev,
                None => return Placement::Release,
            }
        } else {
            return Placement::List(id);
        }
    }
}
