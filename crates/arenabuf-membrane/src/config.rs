//! Leak-detection level configuration.
//!
//! The level is set via the `ARENABUF_LEAK_DETECTION` environment variable:
//! - `disabled`: no buffer is tracked.
//! - `simple` (default): a sample of allocations is tracked; leaks are
//!   reported without access hints.
//! - `advanced`: a sample of allocations is tracked together with the most
//!   recent `touch` hints.
//! - `paranoid`: every allocation is tracked with hints. Test/debug only.

use std::sync::atomic::{AtomicU8, Ordering};

/// How aggressively pooled buffers are tracked for leaks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LeakDetectionLevel {
    /// Nothing is tracked.
    Disabled,
    /// Sampled tracking, no hints.
    #[default]
    Simple,
    /// Sampled tracking with access hints.
    Advanced,
    /// Every allocation tracked with access hints.
    Paranoid,
}

impl LeakDetectionLevel {
    /// Parse from string (case-insensitive). Unknown values map to the default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" | "off" | "none" => Self::Disabled,
            "simple" | "default" => Self::Simple,
            "advanced" => Self::Advanced,
            "paranoid" | "all" => Self::Paranoid,
            _ => Self::Simple,
        }
    }

    /// Returns true if any buffer can be tracked at this level.
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Returns true if `touch` hints are retained.
    #[must_use]
    pub const fn records_hints(self) -> bool {
        matches!(self, Self::Advanced | Self::Paranoid)
    }

    /// Returns true if every allocation is tracked rather than a sample.
    #[must_use]
    pub const fn tracks_all(self) -> bool {
        matches!(self, Self::Paranoid)
    }
}

// Atomic cache: 0=unresolved, 1..=4 = level, 255=resolving.
static CACHED_LEVEL: AtomicU8 = AtomicU8::new(0);

const LEVEL_UNRESOLVED: u8 = 0;
const LEVEL_DISABLED: u8 = 1;
const LEVEL_SIMPLE: u8 = 2;
const LEVEL_ADVANCED: u8 = 3;
const LEVEL_PARANOID: u8 = 4;
const LEVEL_RESOLVING: u8 = 255;

fn level_to_u8(level: LeakDetectionLevel) -> u8 {
    match level {
        LeakDetectionLevel::Disabled => LEVEL_DISABLED,
        LeakDetectionLevel::Simple => LEVEL_SIMPLE,
        LeakDetectionLevel::Advanced => LEVEL_ADVANCED,
        LeakDetectionLevel::Paranoid => LEVEL_PARANOID,
    }
}

fn u8_to_level(v: u8) -> LeakDetectionLevel {
    match v {
        LEVEL_DISABLED => LeakDetectionLevel::Disabled,
        LEVEL_ADVANCED => LeakDetectionLevel::Advanced,
        LEVEL_PARANOID => LeakDetectionLevel::Paranoid,
        _ => LeakDetectionLevel::Simple,
    }
}

/// Get the process-wide leak-detection level (reads the environment on first
/// call, caches thereafter).
///
/// Concurrent callers that race the first resolution see the default level
/// until the winning thread has stored its result.
#[must_use]
pub fn leak_detection_level() -> LeakDetectionLevel {
    let cached = CACHED_LEVEL.load(Ordering::Acquire);

    if cached != LEVEL_UNRESOLVED && cached != LEVEL_RESOLVING {
        return u8_to_level(cached);
    }
    if cached == LEVEL_RESOLVING {
        return LeakDetectionLevel::default();
    }

    if CACHED_LEVEL
        .compare_exchange(
            LEVEL_UNRESOLVED,
            LEVEL_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_LEVEL.load(Ordering::Acquire);
        return if v != LEVEL_UNRESOLVED && v != LEVEL_RESOLVING {
            u8_to_level(v)
        } else {
            LeakDetectionLevel::default()
        };
    }

    let level = std::env::var("ARENABUF_LEAK_DETECTION")
        .map(|v| LeakDetectionLevel::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_LEVEL.store(level_to_u8(level), Ordering::Release);
    level
}
