//! Pool configuration.
//!
//! A `PoolConfig` is fixed when the pool is built. `PoolConfig::default()`
//! gives the standard geometry; `PoolConfig::from_env()` overlays
//! `ARENABUF_*` environment variables on it:
//!
//! | variable                               | field                         |
//! |----------------------------------------|-------------------------------|
//! | `ARENABUF_PAGE_SIZE`                   | `page_size`                   |
//! | `ARENABUF_CHUNK_PAGES`                 | `chunk_pages`                 |
//! | `ARENABUF_ARENAS`                      | `arenas`                      |
//! | `ARENABUF_SMALL_CACHE_SIZE`            | `small_cache_size`            |
//! | `ARENABUF_NORMAL_CACHE_SIZE`           | `normal_cache_size`           |
//! | `ARENABUF_MAX_CACHED_BUFFER_CAPACITY`  | `max_cached_buffer_capacity`  |
//! | `ARENABUF_CACHE_TRIM_INTERVAL`         | `cache_trim_interval`         |
//! | `ARENABUF_ALIGNMENT`                   | `alignment`                   |
//! | `ARENABUF_MAX_CAPACITY`                | `max_capacity`                |
//! | `ARENABUF_LEAK_SAMPLING_INTERVAL`      | `leak_sampling_interval`      |
//! | `ARENABUF_LEAK_DETECTION`              | `leak_detection`              |
//!
//! Values that do not parse keep the default.

use arenabuf_membrane::LeakDetectionLevel;
use arenabuf_membrane::config::leak_detection_level;
use serde::Serialize;
use thiserror::Error;

use crate::alloc::run::MAX_RUN_PAGES;

pub const DEFAULT_PAGE_SIZE: usize = 8192;
pub const DEFAULT_CHUNK_PAGES: usize = 512;
pub const DEFAULT_SMALL_CACHE_SIZE: usize = 256;
pub const DEFAULT_NORMAL_CACHE_SIZE: usize = 64;
pub const DEFAULT_MAX_CACHED_BUFFER_CAPACITY: usize = 32 * 1024;
pub const DEFAULT_CACHE_TRIM_INTERVAL: usize = 8192;
pub const DEFAULT_LEAK_SAMPLING_INTERVAL: u64 = 128;
pub const DEFAULT_MAX_CAPACITY: usize = i32::MAX as usize;

const MIN_PAGE_SIZE: usize = 4096;
const MAX_PAGE_SIZE: usize = 1 << 20;
const MAX_CHUNK_PAGES: usize = 1 << 14;

/// Rejected configuration field.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("page size {0} must be a power of two between 4096 and 1 MiB")]
    PageSize(usize),
    #[error("chunk pages {0} must be a power of two no larger than 16384")]
    ChunkPages(usize),
    #[error("at least one arena is required")]
    NoArenas,
    #[error("alignment {alignment} must be 0 or a power of two no larger than the page size {page_size}")]
    Alignment { alignment: usize, page_size: usize },
    #[error("cache trim interval must be positive")]
    CacheTrimInterval,
    #[error("maximum capacity must be positive")]
    MaxCapacity,
}

/// Geometry and cache sizing of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolConfig {
    /// Bytes per page. Power of two, at least 4096.
    pub page_size: usize,
    /// Pages per chunk. Power of two, at most 16384.
    pub chunk_pages: usize,
    /// Number of arenas. Threads bind to the least used one.
    pub arenas: usize,
    /// Cached regions per small size class per thread. 0 disables.
    pub small_cache_size: usize,
    /// Cached regions per normal size class per thread. 0 disables.
    pub normal_cache_size: usize,
    /// Normal size classes above this are never cached.
    pub max_cached_buffer_capacity: usize,
    /// Cache allocations between two trims of a thread cache.
    pub cache_trim_interval: usize,
    /// Required alignment of buffer sizes (0 = none).
    pub alignment: usize,
    /// Largest capacity any buffer may grow to.
    pub max_capacity: usize,
    #[serde(skip)]
    pub leak_detection: LeakDetectionLevel,
    /// Simple/Advanced levels track one in this many allocations.
    pub leak_sampling_interval: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism().map_or(1, usize::from);
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            chunk_pages: DEFAULT_CHUNK_PAGES,
            arenas: parallelism * 2,
            small_cache_size: DEFAULT_SMALL_CACHE_SIZE,
            normal_cache_size: DEFAULT_NORMAL_CACHE_SIZE,
            max_cached_buffer_capacity: DEFAULT_MAX_CACHED_BUFFER_CAPACITY,
            cache_trim_interval: DEFAULT_CACHE_TRIM_INTERVAL,
            alignment: 0,
            max_capacity: DEFAULT_MAX_CAPACITY,
            leak_detection: LeakDetectionLevel::default(),
            leak_sampling_interval: DEFAULT_LEAK_SAMPLING_INTERVAL,
        }
    }
}

impl PoolConfig {
    /// Defaults overlaid with `ARENABUF_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok());
        config.leak_detection = leak_detection_level();
        config
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let read = |key: &str, slot: &mut usize| {
            if let Some(v) = lookup(key).and_then(|v| v.trim().parse().ok()) {
                *slot = v;
            }
        };
        read("ARENABUF_PAGE_SIZE", &mut config.page_size);
        read("ARENABUF_CHUNK_PAGES", &mut config.chunk_pages);
        read("ARENABUF_ARENAS", &mut config.arenas);
        read("ARENABUF_SMALL_CACHE_SIZE", &mut config.small_cache_size);
        read("ARENABUF_NORMAL_CACHE_SIZE", &mut config.normal_cache_size);
        read(
            "ARENABUF_MAX_CACHED_BUFFER_CAPACITY",
            &mut config.max_cached_buffer_capacity,
        );
        read("ARENABUF_CACHE_TRIM_INTERVAL", &mut config.cache_trim_interval);
        read("ARENABUF_ALIGNMENT", &mut config.alignment);
        read("ARENABUF_MAX_CAPACITY", &mut config.max_capacity);
        if let Some(v) = lookup("ARENABUF_LEAK_SAMPLING_INTERVAL").and_then(|v| v.trim().parse().ok()) {
            config.leak_sampling_interval = v;
        }
        if let Some(v) = lookup("ARENABUF_LEAK_DETECTION") {
            config.leak_detection = LeakDetectionLevel::from_str_loose(&v);
        }
        config
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(ConfigError::PageSize(self.page_size));
        }
        if !self.chunk_pages.is_power_of_two()
            || self.chunk_pages > MAX_CHUNK_PAGES
            || self.chunk_pages > MAX_RUN_PAGES
        {
            return Err(ConfigError::ChunkPages(self.chunk_pages));
        }
        if self.arenas == 0 {
            return Err(ConfigError::NoArenas);
        }
        if self.alignment != 0
            && (!self.alignment.is_power_of_two() || self.alignment > self.page_size)
        {
            return Err(ConfigError::Alignment {
                alignment: self.alignment,
                page_size: self.page_size,
            });
        }
        if self.cache_trim_interval == 0 {
            return Err(ConfigError::CacheTrimInterval);
        }
        if self.max_capacity == 0 {
            return Err(ConfigError::MaxCapacity);
        }
        Ok(())
    }

    /// Bytes per chunk.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.page_size * self.chunk_pages
    }

    #[must_use]
    pub fn with_geometry(mut self, page_size: usize, chunk_pages: usize) -> Self {
        self.page_size = page_size;
        self.chunk_pages = chunk_pages;
        self
    }

    #[must_use]
    pub fn with_arenas(mut self, arenas: usize) -> Self {
        self.arenas = arenas;
        self
    }

    #[must_use]
    pub fn with_cache_sizes(mut self, small: usize, normal: usize) -> Self {
        self.small_cache_size = small;
        self.normal_cache_size = normal;
        self
    }

    #[must_use]
    pub fn with_leak_detection(mut self, level: LeakDetectionLevel) -> Self {
        self.leak_detection = level;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_validate() {
        let config = PoolConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.chunk_size(), 4 * 1024 * 1024);
        assert!(config.arenas >= 2);
    }

    #[test]
    fn lookup_overrides_fields() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("ARENABUF_PAGE_SIZE", "4096"),
            ("ARENABUF_CHUNK_PAGES", "64"),
            ("ARENABUF_ARENAS", " 3 "),
            ("ARENABUF_LEAK_DETECTION", "paranoid"),
            ("ARENABUF_LEAK_SAMPLING_INTERVAL", "1"),
        ]));
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.chunk_pages, 64);
        assert_eq!(config.arenas, 3);
        assert_eq!(config.leak_detection, LeakDetectionLevel::Paranoid);
        assert_eq!(config.leak_sampling_interval, 1);
    }

    #[test]
    fn unparseable_values_keep_defaults() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("ARENABUF_PAGE_SIZE", "eight"),
            ("ARENABUF_SMALL_CACHE_SIZE", "-1"),
        ]));
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.small_cache_size, DEFAULT_SMALL_CACHE_SIZE);
    }

    #[test]
    fn rejects_bad_geometry() {
        let base = PoolConfig::default();
        assert_eq!(
            base.clone().with_geometry(3000, 16).validate(),
            Err(ConfigError::PageSize(3000))
        );
        assert_eq!(
            base.clone().with_geometry(2048, 16).validate(),
            Err(ConfigError::PageSize(2048))
        );
        assert_eq!(
            base.clone().with_geometry(8192, 12).validate(),
            Err(ConfigError::ChunkPages(12))
        );
        assert_eq!(
            base.clone().with_geometry(8192, 1 << 15).validate(),
            Err(ConfigError::ChunkPages(1 << 15))
        );
        assert_eq!(
            base.clone().with_arenas(0).validate(),
            Err(ConfigError::NoArenas)
        );
    }

    #[test]
    fn rejects_bad_alignment() {
        let mut config = PoolConfig::default();
        config.alignment = 48;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Alignment { alignment: 48, .. })
        ));
        config.alignment = 16384;
        assert!(config.validate().is_err());
        config.alignment = 64;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn serializes_to_json() {
        let json = serde_json::to_value(PoolConfig::default()).unwrap();
        assert_eq!(json["page_size"], 8192);
        assert!(json.get("leak_detection").is_none());
    }
}
