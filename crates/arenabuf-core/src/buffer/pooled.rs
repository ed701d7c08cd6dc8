//! Root buffers.
//!
//! A [`PooledBuf`] owns one pool allocation through a shared [`BufRoot`].
//! Derived views point at the same root, so every retain and release in
//! the family lands on a single [`RefCnt`]. The release that brings it to
//! zero returns the allocation to the pool and closes the leak record.
//!
//! If the last handle to a root goes away while its count is still
//! positive, the leak is reported and the memory is reclaimed anyway.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use arenabuf_membrane::{MemoryRegion, RefCnt, RegionError, TrackSite, TrackerHandle};
use parking_lot::RwLock;

use super::store::BackingStore;
use super::view::DerivedBuf;
use crate::alloc::Allocation;
use crate::alloc::size_class::Tier;
use crate::error::{AllocError, BufferError};
use crate::pool::BufferPool;

/// Shrinks that keep more than half of the usable length stay in place.
/// Below this usable length the allocation must also lose less than
/// `SHRINK_SLACK` bytes.
const SHRINK_IN_PLACE_MIN: usize = 512;
const SHRINK_SLACK: usize = 16;

/// State shared by a root buffer and all of its views.
pub(crate) struct BufRoot {
    pool: BufferPool,
    refcnt: RefCnt,
    /// `None` once the count reached zero.
    memory: RwLock<Option<Allocation>>,
    max_capacity: usize,
    tracker: Option<TrackerHandle>,
}

pub(crate) fn check_bounds(index: usize, len: usize, capacity: usize) -> Result<(), BufferError> {
    match index.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(BufferError::OutOfBounds {
            index,
            len,
            capacity,
        }),
    }
}

impl BufRoot {
    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn capacity(&self) -> usize {
        self.memory.read().as_ref().map_or(0, Allocation::len)
    }

    pub(crate) fn ref_cnt(&self) -> u32 {
        self.refcnt.get()
    }

    /// Run `f` on the region bytes `[index, index + len)`, translated to
    /// region offsets.
    pub(crate) fn with_memory<R>(
        &self,
        index: usize,
        len: usize,
        f: impl FnOnce(&MemoryRegion, usize) -> Result<R, RegionError>,
    ) -> Result<R, BufferError> {
        let guard = self.memory.read();
        let alloc = guard.as_ref().ok_or(BufferError::Released)?;
        check_bounds(index, len, alloc.len())?;
        f(alloc.region(), alloc.offset() + index).map_err(|_| BufferError::OutOfBounds {
            index,
            len,
            capacity: alloc.len(),
        })
    }

    pub(crate) fn retain(&self, increment: u32) -> Result<u32, BufferError> {
        Ok(self.refcnt.retain(increment)?)
    }

    pub(crate) fn release(&self, decrement: u32) -> Result<bool, BufferError> {
        let zero = self.refcnt.release(decrement)?;
        if zero {
            self.deallocate();
        }
        Ok(zero)
    }

    pub(crate) fn touch(&self, hint: &str) {
        if let Some(handle) = self.tracker {
            self.pool.leak_tracker().record(handle, hint);
        }
    }

    fn deallocate(&self) {
        let alloc = self.memory.write().take();
        if let Some(alloc) = alloc {
            self.give_back(alloc);
        }
        if let Some(handle) = self.tracker {
            self.pool.leak_tracker().close(handle);
        }
    }

    fn set_capacity(&self, new_capacity: usize) -> Result<(), BufferError> {
        if new_capacity > self.max_capacity {
            return Err(AllocError::CapacityExceeded {
                requested: new_capacity,
                max: self.max_capacity,
            }
            .into());
        }
        let mut guard = self.memory.write();
        let alloc = guard.as_mut().ok_or(BufferError::Released)?;
        let old_capacity = alloc.len();
        let usable = alloc.max_length();
        if new_capacity == old_capacity {
            return Ok(());
        }
        let in_place = if new_capacity > old_capacity {
            new_capacity <= usable
        } else {
            new_capacity > usable >> 1
                && (usable > SHRINK_IN_PLACE_MIN || new_capacity > usable - SHRINK_SLACK)
        };
        if in_place {
            alloc.set_len(new_capacity);
            return Ok(());
        }

        let fresh = self.pool.allocate(new_capacity, self.max_capacity)?;
        let keep = old_capacity.min(new_capacity);
        let copied = alloc
            .region()
            .copy_to(alloc.offset(), fresh.region(), fresh.offset(), keep);
        if copied.is_err() {
            drop(guard);
            self.give_back(fresh);
            return Err(BufferError::OutOfBounds {
                index: 0,
                len: keep,
                capacity: new_capacity,
            });
        }
        let old = std::mem::replace(alloc, fresh);
        drop(guard);
        self.give_back(old);
        Ok(())
    }

    /// Every allocation a root holds came from its own pool.
    fn give_back(&self, alloc: Allocation) {
        if let Err(err) = self.pool.free(alloc) {
            debug_assert!(false, "buffer memory rejected by its own pool: {err}");
        }
    }
}

impl Drop for BufRoot {
    fn drop(&mut self) {
        let Some(alloc) = self.memory.get_mut().take() else {
            return;
        };
        match self.tracker {
            Some(handle) => self.pool.leak_tracker().report_leak(handle),
            None => tracing::trace!(
                refcnt = self.refcnt.get(),
                size = alloc.max_length(),
                "untracked buffer dropped before release"
            ),
        }
        self.give_back(alloc);
    }
}

impl fmt::Debug for BufRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufRoot")
            .field("refcnt", &self.refcnt.get())
            .field("memory", &*self.memory.read())
            .field("max_capacity", &self.max_capacity)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

/// A pooled, reference-counted buffer.
///
/// Starts with a count of one. `retain` and `release` adjust the count; the
/// release that reaches zero returns the memory to the pool, after which
/// every access fails with [`BufferError::Released`].
#[derive(Debug)]
pub struct PooledBuf {
    root: Arc<BufRoot>,
}

impl PooledBuf {
    pub(crate) fn new(pool: BufferPool, alloc: Allocation, max_capacity: usize) -> Self {
        let tracker = pool
            .leak_tracker()
            .track(TrackSite::new("buffer", alloc.len()));
        Self {
            root: Arc::new(BufRoot {
                pool,
                refcnt: RefCnt::new(),
                memory: RwLock::new(Some(alloc)),
                max_capacity,
                tracker,
            }),
        }
    }

    #[must_use]
    pub fn max_capacity(&self) -> usize {
        self.root.max_capacity
    }

    #[must_use]
    pub fn ref_cnt(&self) -> u32 {
        self.root.ref_cnt()
    }

    /// True until the count reaches zero.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.root.refcnt.is_live()
    }

    /// Tier of the backing allocation; `None` once released.
    #[must_use]
    pub fn tier(&self) -> Option<Tier> {
        self.root.memory.read().as_ref().map(Allocation::tier)
    }

    /// Absolute addresses of the buffer's capacity.
    pub fn address_range(&self) -> Result<Range<usize>, BufferError> {
        let guard = self.root.memory.read();
        let alloc = guard.as_ref().ok_or(BufferError::Released)?;
        let start = alloc.address_range().start;
        Ok(start..start + alloc.len())
    }

    pub fn retain(&self) -> Result<u32, BufferError> {
        self.root.retain(1)
    }

    pub fn retain_by(&self, increment: u32) -> Result<u32, BufferError> {
        self.root.retain(increment)
    }

    /// Returns true if this release deallocated the buffer.
    pub fn release(&self) -> Result<bool, BufferError> {
        self.root.release(1)
    }

    pub fn release_by(&self, decrement: u32) -> Result<bool, BufferError> {
        self.root.release(decrement)
    }

    /// Attach a hint to the buffer's leak record. No effect on lifetime.
    pub fn touch(&self, hint: &str) -> &Self {
        self.root.touch(hint);
        self
    }

    /// Grow or shrink to `new_capacity`, in place when the allocation
    /// allows, otherwise by moving to a new allocation.
    pub fn set_capacity(&self, new_capacity: usize) -> Result<(), BufferError> {
        self.root.set_capacity(new_capacity)
    }

    /// A view over `[index, index + length)` that does not hold a reference.
    pub fn slice(&self, index: usize, length: usize) -> Result<DerivedBuf, BufferError> {
        DerivedBuf::new_slice(&self.root, index, length, false)
    }

    /// A view over the whole buffer that does not hold a reference.
    pub fn duplicate(&self) -> Result<DerivedBuf, BufferError> {
        DerivedBuf::new_duplicate(&self.root, false)
    }

    /// Like [`slice`](Self::slice), but the view holds one reference.
    pub fn retained_slice(&self, index: usize, length: usize) -> Result<DerivedBuf, BufferError> {
        DerivedBuf::new_slice(&self.root, index, length, true)
    }

    /// Like [`duplicate`](Self::duplicate), but the view holds one reference.
    pub fn retained_duplicate(&self) -> Result<DerivedBuf, BufferError> {
        DerivedBuf::new_duplicate(&self.root, true)
    }
}

impl BackingStore for PooledBuf {
    fn capacity(&self) -> usize {
        self.root.capacity()
    }

    fn get_bytes(&self, index: usize, dst: &mut [u8]) -> Result<(), BufferError> {
        self.root
            .with_memory(index, dst.len(), |region, offset| region.read(offset, dst))
    }

    fn set_bytes(&self, index: usize, src: &[u8]) -> Result<(), BufferError> {
        self.root
            .with_memory(index, src.len(), |region, offset| region.write(offset, src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use arenabuf_membrane::{LeakDetectionLevel, LeakDetector, RefCntError};

    fn pool() -> BufferPool {
        let config = PoolConfig::default()
            .with_geometry(8192, 16)
            .with_arenas(1)
            .with_cache_sizes(0, 0);
        BufferPool::new(config).unwrap()
    }

    #[test]
    fn starts_at_one_and_frees_at_zero() {
        let pool = pool();
        let buf = pool.buffer(100).unwrap();
        assert_eq!(buf.ref_cnt(), 1);
        assert_eq!(buf.capacity(), 100);
        assert_eq!(buf.tier(), Some(Tier::Small));
        assert_eq!(buf.retain().unwrap(), 2);
        assert!(!buf.release().unwrap());
        assert!(buf.release().unwrap());
        assert!(!buf.is_live());
        assert_eq!(pool.metrics().active_bytes, 0);
        assert_eq!(buf.capacity(), 0);
        assert_eq!(buf.get_u8(0), Err(BufferError::Released));
    }

    #[test]
    fn double_release_is_an_error() {
        let pool = pool();
        let buf = pool.buffer(64).unwrap();
        assert!(buf.release().unwrap());
        assert_eq!(
            buf.release(),
            Err(BufferError::RefCnt(RefCntError::IllegalDecrement {
                count: 0,
                decrement: 1
            }))
        );
        assert!(matches!(buf.retain(), Err(BufferError::RefCnt(_))));
        assert_eq!(pool.metrics().arenas[0].deallocations_small, 1);
    }

    #[test]
    fn reads_back_writes() {
        let pool = pool();
        let buf = pool.buffer(32).unwrap();
        buf.set_u32(0, 0xDEAD_BEEF).unwrap();
        buf.set_bytes(4, b"pooled").unwrap();
        assert_eq!(buf.get_u32(0).unwrap(), 0xDEAD_BEEF);
        let mut out = [0; 6];
        buf.get_bytes(4, &mut out).unwrap();
        assert_eq!(&out, b"pooled");
        assert!(matches!(
            buf.get_u64(30),
            Err(BufferError::OutOfBounds { index: 30, len: 8, capacity: 32 })
        ));
        buf.release().unwrap();
    }

    #[test]
    fn grows_in_place_within_class() {
        let pool = pool();
        let buf = pool.buffer(100).unwrap();
        let before = buf.address_range().unwrap();
        buf.set_capacity(112).unwrap();
        assert_eq!(buf.capacity(), 112);
        assert_eq!(buf.address_range().unwrap().start, before.start);
        buf.release().unwrap();
    }

    #[test]
    fn grows_by_moving_and_keeps_bytes() {
        let pool = pool();
        let buf = pool.buffer(16).unwrap();
        buf.set_bytes(0, b"0123456789abcdef").unwrap();
        buf.set_capacity(20_000).unwrap();
        assert_eq!(buf.capacity(), 20_000);
        assert_eq!(buf.tier(), Some(Tier::Normal));
        let mut out = [0; 16];
        buf.get_bytes(0, &mut out).unwrap();
        assert_eq!(&out, b"0123456789abcdef");
        buf.release().unwrap();
        assert_eq!(pool.metrics().active_bytes, 0);
    }

    #[test]
    fn shrink_hysteresis() {
        let pool = pool();
        let buf = pool.buffer(24_576).unwrap();
        let start = buf.address_range().unwrap().start;
        // Still more than half of the run: stays put.
        buf.set_capacity(16_000).unwrap();
        assert_eq!(buf.address_range().unwrap().start, start);
        // Below half: moves to a smaller class.
        buf.set_capacity(100).unwrap();
        assert_eq!(buf.tier(), Some(Tier::Small));
        buf.release().unwrap();
        assert_eq!(pool.metrics().active_bytes, 0);
    }

    #[test]
    fn capacity_limited_by_max() {
        let pool = pool();
        let buf = pool.buffer_with_max(16, 64).unwrap();
        assert!(matches!(
            buf.set_capacity(65),
            Err(BufferError::Alloc(AllocError::CapacityExceeded { requested: 65, max: 64 }))
        ));
        buf.release().unwrap();
    }

    #[test]
    fn dropped_without_release_is_reclaimed_and_reported() {
        let config = PoolConfig::default()
            .with_geometry(8192, 16)
            .with_arenas(1)
            .with_cache_sizes(0, 0);
        let detector = Arc::new(LeakDetector::new(LeakDetectionLevel::Paranoid, 1));
        let pool = BufferPool::with_leak_tracker(config, detector.clone()).unwrap();

        let kept = pool.buffer(64).unwrap();
        kept.touch("written");
        drop(pool.buffer(64).unwrap());
        assert_eq!(detector.leaks().len(), 1);
        assert_eq!(detector.leaks()[0].site.kind, "buffer");
        kept.release().unwrap();
        assert_eq!(detector.open_records(), 0);
        assert_eq!(detector.leaks().len(), 1);
        assert_eq!(pool.metrics().active_bytes, 0);
    }
}
