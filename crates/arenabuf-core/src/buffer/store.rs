//! Primitive access to a buffer's bytes.
//!
//! Every buffer kind implements the two byte-slice primitives; the integer
//! accessors are provided on top of them in network (big-endian) order.
//! [`Swapped`] wraps any store and flips multi-byte values to little-endian.

use crate::error::BufferError;

/// Indexed read/write capability over a buffer's capacity.
pub trait BackingStore {
    /// Addressable bytes.
    fn capacity(&self) -> usize;

    /// Copy `dst.len()` bytes starting at `index` into `dst`.
    fn get_bytes(&self, index: usize, dst: &mut [u8]) -> Result<(), BufferError>;

    /// Copy `src` into the buffer starting at `index`.
    fn set_bytes(&self, index: usize, src: &[u8]) -> Result<(), BufferError>;

    fn get_u8(&self, index: usize) -> Result<u8, BufferError> {
        let mut b = [0; 1];
        self.get_bytes(index, &mut b)?;
        Ok(b[0])
    }

    fn set_u8(&self, index: usize, value: u8) -> Result<(), BufferError> {
        self.set_bytes(index, &[value])
    }

    fn get_u16(&self, index: usize) -> Result<u16, BufferError> {
        let mut b = [0; 2];
        self.get_bytes(index, &mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    fn set_u16(&self, index: usize, value: u16) -> Result<(), BufferError> {
        self.set_bytes(index, &value.to_be_bytes())
    }

    fn get_u32(&self, index: usize) -> Result<u32, BufferError> {
        let mut b = [0; 4];
        self.get_bytes(index, &mut b)?;
        Ok(u32::from_be_bytes(b))
    }

    fn set_u32(&self, index: usize, value: u32) -> Result<(), BufferError> {
        self.set_bytes(index, &value.to_be_bytes())
    }

    fn get_u64(&self, index: usize) -> Result<u64, BufferError> {
        let mut b = [0; 8];
        self.get_bytes(index, &mut b)?;
        Ok(u64::from_be_bytes(b))
    }

    fn set_u64(&self, index: usize, value: u64) -> Result<(), BufferError> {
        self.set_bytes(index, &value.to_be_bytes())
    }
}

impl<S: BackingStore + ?Sized> BackingStore for &S {
    fn capacity(&self) -> usize {
        (**self).capacity()
    }

    fn get_bytes(&self, index: usize, dst: &mut [u8]) -> Result<(), BufferError> {
        (**self).get_bytes(index, dst)
    }

    fn set_bytes(&self, index: usize, src: &[u8]) -> Result<(), BufferError> {
        (**self).set_bytes(index, src)
    }
}

/// Byte-order swapping decorator.
#[derive(Debug, Clone, Copy)]
pub struct Swapped<S> {
    inner: S,
}

impl<S: BackingStore> Swapped<S> {
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: BackingStore> BackingStore for Swapped<S> {
    fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    fn get_bytes(&self, index: usize, dst: &mut [u8]) -> Result<(), BufferError> {
        self.inner.get_bytes(index, dst)
    }

    fn set_bytes(&self, index: usize, src: &[u8]) -> Result<(), BufferError> {
        self.inner.set_bytes(index, src)
    }

    fn get_u16(&self, index: usize) -> Result<u16, BufferError> {
        self.inner.get_u16(index).map(u16::swap_bytes)
    }

    fn set_u16(&self, index: usize, value: u16) -> Result<(), BufferError> {
        self.inner.set_u16(index, value.swap_bytes())
    }

    fn get_u32(&self, index: usize) -> Result<u32, BufferError> {
        self.inner.get_u32(index).map(u32::swap_bytes)
    }

    fn set_u32(&self, index: usize, value: u32) -> Result<(), BufferError> {
        self.inner.set_u32(index, value.swap_bytes())
    }

    fn get_u64(&self, index: usize) -> Result<u64, BufferError> {
        self.inner.get_u64(index).map(u64::swap_bytes)
    }

    fn set_u64(&self, index: usize, value: u64) -> Result<(), BufferError> {
        self.inner.set_u64(index, value.swap_bytes())
    }
}
