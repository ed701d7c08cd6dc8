//! Leak tracking for pooled buffers.
//!
//! The pool notifies a [`LeakTracker`] whenever a buffer is allocated or a
//! retained view is derived (`track`), whenever a handle is touched
//! (`record`), and exactly once when the tracked reference reaches zero
//! (`close`). A handle that is dropped while its reference is still
//! outstanding is reported through `report_leak`.
//!
//! [`LeakDetector`] is the sampling implementation: depending on the
//! [`LeakDetectionLevel`] it tracks nothing, one in `sampling_interval`
//! allocations, or every allocation, and keeps a bounded tail of hints.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::LeakDetectionLevel;

/// Most recent hints kept per tracked buffer.
pub const MAX_HINTS: usize = 4;

/// What is being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackSite {
    /// Kind of handle ("buffer", "retained_slice", ...).
    pub kind: &'static str,
    /// Capacity of the handle when tracking started.
    pub capacity: usize,
}

impl TrackSite {
    #[must_use]
    pub const fn new(kind: &'static str, capacity: usize) -> Self {
        Self { kind, capacity }
    }
}

/// Opaque token returned by [`LeakTracker::track`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackerHandle(u64);

impl TrackerHandle {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrackerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Collaborator notified at every allocation, derivation, and release point.
pub trait LeakTracker: Send + Sync + fmt::Debug {
    /// Start tracking. Returns `None` when this object is not sampled.
    fn track(&self, site: TrackSite) -> Option<TrackerHandle>;

    /// Attach an access hint to an open record.
    fn record(&self, handle: TrackerHandle, hint: &str);

    /// The tracked reference reached zero. Returns false if the record was
    /// not open (already closed or reported).
    fn close(&self, handle: TrackerHandle) -> bool;

    /// The tracked handle went away while its reference was outstanding.
    fn report_leak(&self, handle: TrackerHandle);
}

/// Tracker that samples nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLeakTracker;

impl LeakTracker for NoopLeakTracker {
    fn track(&self, _site: TrackSite) -> Option<TrackerHandle> {
        None
    }

    fn record(&self, _handle: TrackerHandle, _hint: &str) {}

    fn close(&self, _handle: TrackerHandle) -> bool {
        false
    }

    fn report_leak(&self, _handle: TrackerHandle) {}
}

/// A leaked buffer, as reported by [`LeakDetector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakReport {
    pub handle: TrackerHandle,
    pub site: TrackSite,
    /// Most recent hints, oldest first.
    pub hints: Vec<String>,
    /// Hints discarded because the tail was full.
    pub dropped_hints: u64,
}

#[derive(Debug)]
struct Record {
    site: TrackSite,
    hints: VecDeque<String>,
    dropped_hints: u64,
}

/// Sampling leak detector.
#[derive(Debug)]
pub struct LeakDetector {
    level: LeakDetectionLevel,
    sampling_interval: u64,
    sample_counter: AtomicU64,
    next_id: AtomicU64,
    records: Mutex<HashMap<u64, Record>>,
    leaks: Mutex<Vec<LeakReport>>,
}

impl LeakDetector {
    /// `sampling_interval` of 0 or 1 samples every allocation.
    #[must_use]
    pub fn new(level: LeakDetectionLevel, sampling_interval: u64) -> Self {
        Self {
            level,
            sampling_interval: sampling_interval.max(1),
            sample_counter: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            records: Mutex::new(HashMap::new()),
            leaks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn level(&self) -> LeakDetectionLevel {
        self.level
    }

    /// Records currently open.
    #[must_use]
    pub fn open_records(&self) -> usize {
        self.records.lock().len()
    }

    /// Leaks reported so far.
    #[must_use]
    pub fn leaks(&self) -> Vec<LeakReport> {
        self.leaks.lock().clone()
    }

    /// Drain the reported leaks.
    pub fn take_leaks(&self) -> Vec<LeakReport> {
        std::mem::take(&mut *self.leaks.lock())
    }

    fn sampled(&self) -> bool {
        if !self.level.is_enabled() {
            return false;
        }
        if self.level.tracks_all() {
            return true;
        }
        self.sample_counter.fetch_add(1, Ordering::Relaxed) % self.sampling_interval == 0
    }
}

impl LeakTracker for LeakDetector {
    fn track(&self, site: TrackSite) -> Option<TrackerHandle> {
        if !self.sampled() {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.records.lock().insert(
            id,
            Record {
                site,
                hints: VecDeque::new(),
                dropped_hints: 0,
            },
        );
        Some(TrackerHandle(id))
    }

    fn record(&self, handle: TrackerHandle, hint: &str) {
        if !self.level.records_hints() {
            return;
        }
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(&handle.0) {
            if record.hints.len() == MAX_HINTS {
                record.hints.pop_front();
                record.dropped_hints += 1;
            }
            record.hints.push_back(hint.to_owned());
        }
    }

    fn close(&self, handle: TrackerHandle) -> bool {
        self.records.lock().remove(&handle.0).is_some()
    }

    fn report_leak(&self, handle: TrackerHandle) {
        let Some(record) = self.records.lock().remove(&handle.0) else {
            return;
        };
        let report = LeakReport {
            handle,
            site: record.site,
            hints: record.hints.into_iter().collect(),
            dropped_hints: record.dropped_hints,
        };
        tracing::error!(
            tracker = %handle,
            kind = report.site.kind,
            capacity = report.site.capacity,
            hints = ?report.hints,
            dropped_hints = report.dropped_hints,
            "LEAK: buffer dropped before its reference count reached zero"
        );
        self.leaks.lock().push(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn site() -> TrackSite {
        TrackSite::new("buffer", 64)
    }

    #[test]
    fn noop_tracks_nothing() {
        let t = NoopLeakTracker;
        assert!(t.track(site()).is_none());
        assert!(!t.close(TrackerHandle::from_raw(1)));
    }

    #[test]
    fn disabled_never_samples() {
        let d = LeakDetector::new(LeakDetectionLevel::Disabled, 1);
        assert!((0..100).all(|_| d.track(site()).is_none()));
        assert_eq!(d.open_records(), 0);
    }

    #[test]
    fn paranoid_tracks_everything() {
        let d = LeakDetector::new(LeakDetectionLevel::Paranoid, 1000);
        let handles: Vec<_> = (0..10).filter_map(|_| d.track(site())).collect();
        assert_eq!(handles.len(), 10);
        assert_eq!(d.open_records(), 10);
    }

    #[test]
    fn simple_samples_one_in_interval() {
        let d = LeakDetector::new(LeakDetectionLevel::Simple, 8);
        let tracked = (0..64).filter_map(|_| d.track(site())).count();
        assert_eq!(tracked, 8);
    }

    #[test]
    fn close_is_exactly_once() {
        let d = LeakDetector::new(LeakDetectionLevel::Paranoid, 1);
        let h = d.track(site()).unwrap();
        assert!(d.close(h));
        assert!(!d.close(h));
        assert_eq!(d.open_records(), 0);
        assert!(d.leaks().is_empty());
    }

    #[test]
    fn hints_only_recorded_at_advanced_levels() {
        let simple = LeakDetector::new(LeakDetectionLevel::Simple, 1);
        let h = simple.track(site()).unwrap();
        simple.record(h, "read");
        simple.report_leak(h);
        assert!(simple.leaks()[0].hints.is_empty());

        let paranoid = LeakDetector::new(LeakDetectionLevel::Paranoid, 1);
        let h = paranoid.track(site()).unwrap();
        paranoid.record(h, "read");
        paranoid.report_leak(h);
        assert_eq!(paranoid.leaks()[0].hints, vec!["read".to_owned()]);
    }

    #[test]
    fn hint_tail_is_bounded() {
        let d = LeakDetector::new(LeakDetectionLevel::Advanced, 1);
        let h = d.track(site()).unwrap();
        for i in 0..10 {
            d.record(h, &format!("hint-{i}"));
        }
        d.report_leak(h);
        let leak = d.take_leaks().pop().unwrap();
        assert_eq!(leak.hints.len(), MAX_HINTS);
        assert_eq!(leak.hints[0], "hint-6");
        assert_eq!(leak.dropped_hints, 6);
        assert!(d.leaks().is_empty());
    }

    #[test]
    fn closed_record_is_not_reported() {
        let d = LeakDetector::new(LeakDetectionLevel::Paranoid, 1);
        let h = d.track(site()).unwrap();
        d.close(h);
        d.report_leak(h);
        assert!(d.leaks().is_empty());
    }

    #[test]
    #[traced_test]
    fn leak_is_logged_at_error() {
        let d = LeakDetector::new(LeakDetectionLevel::Paranoid, 1);
        let h = d.track(TrackSite::new("retained_slice", 32)).unwrap();
        d.report_leak(h);
        assert!(logs_contain("LEAK"));
        assert!(logs_contain("retained_slice"));
        assert_eq!(d.leaks().len(), 1);
    }
}
