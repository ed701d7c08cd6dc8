//! Reference-counted buffers over pooled memory.
//!
//! [`PooledBuf`] is the root handle; [`DerivedBuf`] is a slice or duplicate
//! sharing the root's memory and counter. Both implement [`BackingStore`].

pub mod pooled;
pub mod store;
pub mod view;

pub use pooled::PooledBuf;
pub use store::{BackingStore, Swapped};
pub use view::DerivedBuf;
