//! GPU device handle, execution streams and device memory.
//!
//! The software device executes kernel work eagerly on the calling thread's
//! rayon pool, so a [`Stream`] carries no queue of its own; it exists so the
//! host-visible synchronization points stay explicit in the code that needs
//! size read-backs before allocating dependent buffers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::PciAddr;
use crate::error::Result;

/// GPU device handle.
pub struct Gpu {
    pci_addr: PciAddr,
    next_stream: AtomicU64,
}

impl Gpu {
    pub(crate) fn new(pci_addr: PciAddr) -> Self {
        Self {
            pci_addr,
            next_stream: AtomicU64::new(0),
        }
    }

    /// PCI address this device was opened at.
    #[inline]
    pub fn pci_addr(&self) -> PciAddr {
        self.pci_addr
    }

    /// Create a new execution stream on this device.
    pub fn create_stream(self: &Arc<Self>) -> Stream {
        Stream {
            gpu: Arc::clone(self),
            id: self.next_stream.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// Handle to one GPU execution stream.
#[derive(Clone)]
pub struct Stream {
    gpu: Arc<Gpu>,
    id: u64,
}

impl Stream {
    /// Stream identifier, unique per device.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Device this stream executes on.
    #[inline]
    pub fn gpu(&self) -> &Arc<Gpu> {
        &self.gpu
    }

    /// Block until all work queued on this stream has completed.
    ///
    /// Work completes eagerly in the software device, so this only marks the
    /// ordering point; callers still invoke it exactly where a hardware
    /// stream would require it.
    pub fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("gpu", &self.gpu.pci_addr)
            .field("id", &self.id)
            .finish()
    }
}

/// Typed device memory allocation.
pub struct DeviceBuffer<T> {
    data: Vec<T>,
}

impl<T: Copy + Default> DeviceBuffer<T> {
    /// Allocate `len` zeroed elements.
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: vec![T::default(); len],
        }
    }

    /// Allocate `len` zeroed elements with room reserved for `capacity`.
    ///
    /// Used where a configured default allocation size exceeds the incoming
    /// batch, so later growth within the default never reallocates.
    pub fn zeroed_with_capacity(len: usize, capacity: usize) -> Self {
        let mut data = Vec::with_capacity(capacity.max(len));
        data.resize(len, T::default());
        Self { data }
    }

    /// Allocate a buffer holding a copy of `src`.
    pub fn from_slice(src: &[T]) -> Self {
        Self { data: src.to_vec() }
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Allocation size in bytes.
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<T>()
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Device-to-device copy into a sub-range of this buffer.
    pub fn copy_from_slice_at(&mut self, offset: usize, src: &[T]) {
        self.data[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Consume the buffer, returning the underlying storage.
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
}
