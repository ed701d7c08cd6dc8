//! # arenabuf-core
//!
//! Pooled, reference-counted byte buffers.
//!
//! Requests are rounded to a size class and served, in order, from the
//! calling thread's cache, a partially used subpage, a free run of some
//! chunk, or a fresh chunk. Requests above the chunk size get a dedicated
//! region. Buffers carry an atomic reference count; the release that brings
//! it to zero gives the memory back. No `unsafe` code is permitted here;
//! raw memory lives in `arenabuf-membrane`.

#![deny(unsafe_code)]

pub mod alloc;
pub mod buffer;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pool;

pub use crate::alloc::Allocation;
pub use crate::alloc::size_class::{SizeClass, SizeClasses, Tier};
pub use buffer::{BackingStore, DerivedBuf, PooledBuf, Swapped};
pub use config::{ConfigError, PoolConfig};
pub use error::{AllocError, BufferError};
pub use metrics::{ArenaMetrics, ChunkListMetrics, PoolMetrics, SubpageMetrics};
pub use pool::BufferPool;
