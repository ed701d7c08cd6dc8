//! Memory membrane for arenabuf.
//!
//! This crate owns everything below the allocation policy: the raw memory
//! that chunks and huge buffers are carved from, the atomic reference counter
//! every pooled buffer carries, and the leak-tracking collaborator that is
//! notified whenever a buffer is handed out or released.
//!
//! # Architecture
//!
//! - **Memory regions** (`region`): raw heap allocations with bounds-checked,
//!   race-free byte access
//! - **Reference counter** (`refcnt`): lock-free retain/release with
//!   decrement-to-zero detection
//! - **Leak tracking** (`leak`): the `LeakTracker` seam plus a sampling detector
//! - **Configuration** (`config`): process-wide leak-detection level

#![deny(unsafe_code)]

pub mod config;
pub mod leak;
pub mod refcnt;
pub mod region;

pub use config::LeakDetectionLevel;
pub use leak::{LeakDetector, LeakReport, LeakTracker, NoopLeakTracker, TrackSite, TrackerHandle};
pub use refcnt::{RefCnt, RefCntError};
pub use region::{MemoryRegion, RegionError};
