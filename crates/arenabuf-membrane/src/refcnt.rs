//! Atomic reference counter for pooled buffers.
//!
//! Every pooled buffer starts with a count of one. `retain` and `release`
//! are lock-free compare-and-swap loops, so concurrent holders can never
//! observe zero twice, drive the count negative, or resurrect a buffer whose
//! count already reached zero.

use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

/// Misuse of the reference-counting protocol.
///
/// These are programming errors: the caller either retained a buffer that was
/// already deallocated or released more references than it holds.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RefCntError {
    /// Retain on a deallocated buffer, or the count would overflow.
    #[error("illegal reference count: {count}, increment: {increment}")]
    IllegalIncrement { count: u32, increment: u32 },
    /// Release of more references than are outstanding (double free).
    #[error("illegal reference count: {count}, decrement: {decrement}")]
    IllegalDecrement { count: u32, decrement: u32 },
    /// Retain or release by zero.
    #[error("reference count delta must be positive")]
    ZeroDelta,
}

/// Lock-free reference counter.
#[derive(Debug)]
pub struct RefCnt {
    count: AtomicU32,
}

impl RefCnt {
    /// Creates a counter holding one reference.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(1),
        }
    }

    /// Current count. Zero means the owner has been deallocated.
    #[must_use]
    pub fn get(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Returns true while at least one reference is outstanding.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.get() != 0
    }

    /// Adds `increment` references and returns the new count.
    pub fn retain(&self, increment: u32) -> Result<u32, RefCntError> {
        if increment == 0 {
            return Err(RefCntError::ZeroDelta);
        }
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count == 0 {
                    None
                } else {
                    count.checked_add(increment)
                }
            })
            .map(|prev| prev + increment)
            .map_err(|count| RefCntError::IllegalIncrement { count, increment })
    }

    /// Drops `decrement` references.
    ///
    /// Returns `Ok(true)` exactly once over the counter's lifetime: for the
    /// release that brought the count to zero. The caller must then run the
    /// owner's deallocation hook.
    pub fn release(&self, decrement: u32) -> Result<bool, RefCntError> {
        if decrement == 0 {
            return Err(RefCntError::ZeroDelta);
        }
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(decrement)
            })
            .map(|prev| prev == decrement)
            .map_err(|count| RefCntError::IllegalDecrement { count, decrement })
    }
}

impl Default for RefCnt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn starts_at_one() {
        let rc = RefCnt::new();
        assert_eq!(rc.get(), 1);
        assert!(rc.is_live());
    }

    #[test]
    fn retain_then_release_balances() {
        let rc = RefCnt::new();
        assert_eq!(rc.retain(2), Ok(3));
        assert_eq!(rc.release(1), Ok(false));
        assert_eq!(rc.release(1), Ok(false));
        assert_eq!(rc.release(1), Ok(true));
        assert_eq!(rc.get(), 0);
    }

    #[test]
    fn retain_after_zero_is_rejected() {
        let rc = RefCnt::new();
        assert_eq!(rc.release(1), Ok(true));
        assert_eq!(
            rc.retain(1),
            Err(RefCntError::IllegalIncrement {
                count: 0,
                increment: 1
            })
        );
        assert_eq!(rc.get(), 0);
    }

    #[test]
    fn double_release_is_rejected() {
        let rc = RefCnt::new();
        assert_eq!(rc.release(1), Ok(true));
        assert_eq!(
            rc.release(1),
            Err(RefCntError::IllegalDecrement {
                count: 0,
                decrement: 1
            })
        );
    }

    #[test]
    fn over_release_leaves_count_untouched() {
        let rc = RefCnt::new();
        rc.retain(1).unwrap();
        assert!(rc.release(5).is_err());
        assert_eq!(rc.get(), 2);
    }

    #[test]
    fn zero_delta_is_rejected() {
        let rc = RefCnt::new();
        assert_eq!(rc.retain(0), Err(RefCntError::ZeroDelta));
        assert_eq!(rc.release(0), Err(RefCntError::ZeroDelta));
        assert_eq!(rc.get(), 1);
    }

    #[test]
    fn overflow_is_rejected() {
        let rc = RefCnt::new();
        assert!(matches!(
            rc.retain(u32::MAX),
            Err(RefCntError::IllegalIncrement { count: 1, .. })
        ));
    }

    #[test]
    fn concurrent_releases_observe_zero_once() {
        const THREADS: usize = 8;
        const PER_THREAD: u32 = 1_000;

        let rc = Arc::new(RefCnt::new());
        rc.retain(THREADS as u32 * PER_THREAD - 1).unwrap();
        let zero_hits = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let rc = Arc::clone(&rc);
                let zero_hits = Arc::clone(&zero_hits);
                thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        if rc.release(1).expect("release within balance") {
                            zero_hits.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(zero_hits.load(Ordering::SeqCst), 1);
        assert_eq!(rc.get(), 0);
        assert!(rc.release(1).is_err());
    }

    #[test]
    fn racing_retain_and_release_never_resurrects() {
        for _ in 0..200 {
            let rc = Arc::new(RefCnt::new());
            let retainer = {
                let rc = Arc::clone(&rc);
                thread::spawn(move || rc.retain(1).is_ok())
            };
            let released_to_zero = rc.release(1).unwrap();
            let retained = retainer.join().unwrap();

            if released_to_zero {
                // The release won; a late retain must have been refused.
                assert!(!retained);
                assert_eq!(rc.get(), 0);
            } else {
                // The retain won, so one reference is still outstanding.
                assert!(retained);
                assert_eq!(rc.get(), 1);
            }
        }
    }
}
