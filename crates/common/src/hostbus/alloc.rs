//! Driver memory accounting
//!
//! Every resource a driver acquires during attach goes through an
//! [`Allocator`]. The returned [`Allocation`] token hands the resource back
//! when dropped, so releases happen exactly once and in the order Rust drops
//! owners: reverse declaration order for locals, declaration order for
//! struct fields.

use super::BusError;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// Source of driver memory
pub trait Allocator: Send + Sync {
    /// Reserve `size` bytes for the resource named `label`
    fn acquire(&self, label: &'static str, size: usize) -> Result<(), BusError>;

    /// Return a reservation made by [`Allocator::acquire`]
    fn release(&self, label: &'static str, size: usize);
}

/// A live reservation, released on drop
pub struct Allocation {
    allocator: Arc<dyn Allocator>,
    label: &'static str,
    size: usize,
}

impl Allocation {
    pub fn new(
        allocator: &Arc<dyn Allocator>,
        label: &'static str,
        size: usize,
    ) -> Result<Self, BusError> {
        allocator.acquire(label, size)?;
        Ok(Self {
            allocator: Arc::clone(allocator),
            label,
            size,
        })
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.allocator.release(self.label, self.size);
    }
}

impl fmt::Debug for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("label", &self.label)
            .field("size", &self.size)
            .finish()
    }
}

/// Process allocator with live-byte accounting
#[derive(Debug, Default)]
pub struct SystemAllocator {
    live_bytes: AtomicUsize,
    live_allocations: AtomicUsize,
}

impl SystemAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently reserved by drivers
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    /// Reservations currently outstanding
    pub fn live_allocations(&self) -> usize {
        self.live_allocations.load(Ordering::Acquire)
    }
}

impl Allocator for SystemAllocator {
    fn acquire(&self, label: &'static str, size: usize) -> Result<(), BusError> {
        self.live_bytes.fetch_add(size, Ordering::AcqRel);
        self.live_allocations.fetch_add(1, Ordering::AcqRel);
        trace!("acquire {} ({} bytes)", label, size);
        Ok(())
    }

    fn release(&self, label: &'static str, size: usize) {
        self.live_bytes.fetch_sub(size, Ordering::AcqRel);
        self.live_allocations.fetch_sub(1, Ordering::AcqRel);
        trace!("release {} ({} bytes)", label, size);
    }
}

struct DmaInner {
    bytes: Box<[u8]>,
    _allocation: Allocation,
}

/// Immutable transfer buffer
///
/// Clones share the same bytes. The reservation is returned when the last
/// clone drops, so a buffer bound to an in-flight request stays alive until
/// the request lets go of it.
#[derive(Clone)]
pub struct DmaBuf {
    inner: Arc<DmaInner>,
}

impl DmaBuf {
    /// Allocate a buffer holding a copy of `src`
    pub fn copy_from(
        allocator: &Arc<dyn Allocator>,
        label: &'static str,
        src: &[u8],
    ) -> Result<Self, BusError> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(src.len())
            .map_err(|_| BusError::NoMemory)?;
        bytes.extend_from_slice(src);

        let allocation = Allocation::new(allocator, label, src.len())?;

        Ok(Self {
            inner: Arc::new(DmaInner {
                bytes: bytes.into_boxed_slice(),
                _allocation: allocation,
            }),
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner.bytes
    }

    pub fn label(&self) -> &'static str {
        self.inner._allocation.label()
    }

    /// Number of live handles to this buffer
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// True if both handles share the same backing bytes
    pub fn same_buffer(&self, other: &DmaBuf) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Deref for DmaBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner.bytes
    }
}

impl fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuf")
            .field("label", &self.label())
            .field("bytes", &self.as_slice())
            .finish()
    }
}
