//! Derived views: slices and duplicates.
//!
//! A view never owns memory. It holds the root's shared state plus a window
//! into it, and every retain or release it sees is forwarded to the root's
//! counter. Views of views point straight at the root.
//!
//! A retained view was created with one reference taken on the root. It
//! counts the references it holds and has its own leak record, closed when
//! that count returns to zero. Dropping it while it still holds references
//! reports the leak and gives them back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use arenabuf_membrane::{TrackSite, TrackerHandle};

use super::pooled::{BufRoot, check_bounds};
use super::store::BackingStore;
use crate::error::BufferError;

#[derive(Debug)]
struct Retained {
    /// References taken on the root through this view and not yet released.
    held: AtomicU32,
    tracker: Option<TrackerHandle>,
}

/// A slice or duplicate of a pooled buffer.
#[derive(Debug)]
pub struct DerivedBuf {
    root: Arc<BufRoot>,
    /// Offset of the window inside the root.
    adjustment: usize,
    /// Fixed window length; `None` follows the root's capacity.
    length: Option<usize>,
    kind: &'static str,
    retained: Option<Retained>,
}

impl DerivedBuf {
    pub(crate) fn new_slice(
        root: &Arc<BufRoot>,
        index: usize,
        length: usize,
        retain: bool,
    ) -> Result<Self, BufferError> {
        check_bounds(index, length, live_capacity(root)?)?;
        let kind = if retain { "retained_slice" } else { "slice" };
        Self::derive(root, index, Some(length), kind, retain)
    }

    pub(crate) fn new_duplicate(root: &Arc<BufRoot>, retain: bool) -> Result<Self, BufferError> {
        live_capacity(root)?;
        let kind = if retain {
            "retained_duplicate"
        } else {
            "duplicate"
        };
        Self::derive(root, 0, None, kind, retain)
    }

    fn derive(
        root: &Arc<BufRoot>,
        adjustment: usize,
        length: Option<usize>,
        kind: &'static str,
        retain: bool,
    ) -> Result<Self, BufferError> {
        let retained = if retain {
            root.retain(1)?;
            let capacity = length.unwrap_or_else(|| root.capacity());
            Some(Retained {
                held: AtomicU32::new(1),
                tracker: root
                    .pool()
                    .leak_tracker()
                    .track(TrackSite::new(kind, capacity)),
            })
        } else {
            None
        };
        Ok(Self {
            root: Arc::clone(root),
            adjustment,
            length,
            kind,
            retained,
        })
    }

    /// "slice", "duplicate", "retained_slice" or "retained_duplicate".
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    #[must_use]
    pub fn is_retained(&self) -> bool {
        self.retained.is_some()
    }

    /// Offset of this view inside the root buffer.
    #[must_use]
    pub fn adjustment(&self) -> usize {
        self.adjustment
    }

    /// The root's count.
    #[must_use]
    pub fn ref_cnt(&self) -> u32 {
        self.root.ref_cnt()
    }

    /// References this view holds on the root. Always 0 for plain views.
    #[must_use]
    pub fn held(&self) -> u32 {
        self.retained
            .as_ref()
            .map_or(0, |r| r.held.load(Ordering::Acquire))
    }

    pub fn retain(&self) -> Result<u32, BufferError> {
        self.retain_by(1)
    }

    pub fn retain_by(&self, increment: u32) -> Result<u32, BufferError> {
        let count = self.root.retain(increment)?;
        if let Some(retained) = &self.retained {
            retained.held.fetch_add(increment, Ordering::AcqRel);
        }
        Ok(count)
    }

    /// Release through the root. Returns true if the root was deallocated.
    pub fn release(&self) -> Result<bool, BufferError> {
        self.release_by(1)
    }

    pub fn release_by(&self, decrement: u32) -> Result<bool, BufferError> {
        let zero = self.root.release(decrement)?;
        if let Some(retained) = &self.retained {
            let prev = if zero {
                retained.held.swap(0, Ordering::AcqRel)
            } else {
                retained
                    .held
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                        Some(held.saturating_sub(decrement))
                    })
                    .unwrap_or(0)
            };
            if prev > 0 && (zero || prev <= decrement) {
                self.close_record(retained);
            }
        }
        Ok(zero)
    }

    fn close_record(&self, retained: &Retained) {
        if let Some(handle) = retained.tracker {
            self.root.pool().leak_tracker().close(handle);
        }
    }

    /// Attach a hint to this view's leak record, or to the root's for a
    /// plain view.
    pub fn touch(&self, hint: &str) -> &Self {
        match self.retained.as_ref().and_then(|r| r.tracker) {
            Some(handle) => self.root.pool().leak_tracker().record(handle, hint),
            None => self.root.touch(hint),
        }
        self
    }

    /// A plain view of part of this view.
    pub fn slice(&self, index: usize, length: usize) -> Result<DerivedBuf, BufferError> {
        check_bounds(index, length, self.capacity())?;
        Self::new_slice(&self.root, self.adjustment + index, length, false)
    }

    pub fn duplicate(&self) -> Result<DerivedBuf, BufferError> {
        self.rederive(false)
    }

    pub fn retained_slice(&self, index: usize, length: usize) -> Result<DerivedBuf, BufferError> {
        check_bounds(index, length, self.capacity())?;
        Self::new_slice(&self.root, self.adjustment + index, length, true)
    }

    pub fn retained_duplicate(&self) -> Result<DerivedBuf, BufferError> {
        self.rederive(true)
    }

    fn rederive(&self, retain: bool) -> Result<DerivedBuf, BufferError> {
        live_capacity(&self.root)?;
        let kind = match (retain, self.length) {
            (true, Some(_)) => "retained_slice",
            (true, None) => "retained_duplicate",
            (false, Some(_)) => "slice",
            (false, None) => "duplicate",
        };
        Self::derive(&self.root, self.adjustment, self.length, kind, retain)
    }

    /// Root index of `[index, index + len)` of this view.
    fn translate(&self, index: usize, len: usize) -> Result<usize, BufferError> {
        live_capacity(&self.root)?;
        check_bounds(index, len, self.capacity())?;
        Ok(self.adjustment + index)
    }
}

fn live_capacity(root: &BufRoot) -> Result<usize, BufferError> {
    if root.ref_cnt() == 0 {
        return Err(BufferError::Released);
    }
    Ok(root.capacity())
}

impl BackingStore for DerivedBuf {
    fn capacity(&self) -> usize {
        match self.length {
            Some(length) => length,
            None => self.root.capacity().saturating_sub(self.adjustment),
        }
    }

    fn get_bytes(&self, index: usize, dst: &mut [u8]) -> Result<(), BufferError> {
        let index = self.translate(index, dst.len())?;
        self.root
            .with_memory(index, dst.len(), |region, offset| region.read(offset, dst))
    }

    fn set_bytes(&self, index: usize, src: &[u8]) -> Result<(), BufferError> {
        let index = self.translate(index, src.len())?;
        self.root
            .with_memory(index, src.len(), |region, offset| region.write(offset, src))
    }
}

impl Drop for DerivedBuf {
    fn drop(&mut self) {
        let Some(retained) = &self.retained else {
            return;
        };
        let held = retained.held.swap(0, Ordering::AcqRel);
        if held == 0 {
            return;
        }
        // Another handle took the root to zero, spending this view's references.
        if self.root.ref_cnt() == 0 {
            self.close_record(retained);
            return;
        }
        match retained.tracker {
            Some(handle) => self.root.pool().leak_tracker().report_leak(handle),
            None => tracing::trace!(kind = self.kind, held, "untracked view dropped before release"),
        }
        if let Err(err) = self.root.release(held) {
            tracing::debug!(kind = self.kind, held, error = %err, "leaked view references already released");
        }
    }
}
