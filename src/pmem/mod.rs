//! The PMEM collaborator: allocator, cache-line flush, and store fence.
//!
//! Spec §1/§6 treat these as external to the index core. This module keeps
//! them behind a trait so a real implementation can later back `alloc`/`free`
//! with an actual persistent-memory region; the default [`HeapPmem`] runs the
//! same protocol on ordinary DRAM.

pub(crate) mod fault;
pub(crate) mod heap;

pub use fault::FaultInjectingPmem;
pub use heap::HeapPmem;

use std::sync::atomic::AtomicU64;

use crate::error::ArtError;

/// An opaque durable address. On real PMEM this is an offset into a mapped
/// file; `HeapPmem` uses the integer value of a leaked heap pointer.
pub type DurableAddr = usize;

/// The PMEM allocator collaborator (spec §6): `alloc`/`free` plus the single
/// durable slot holding the root inner-node pointer.
pub trait PmemAllocator: Send + Sync {
    /// Allocate `size` bytes aligned to `align`, durably.
    fn alloc(&self, size: usize, align: usize) -> Result<DurableAddr, ArtError>;

    /// Free a previously allocated address.
    ///
    /// # Safety
    /// `addr`/`size`/`align` must match a live allocation returned by `alloc`
    /// on `self`, and the caller must have already waited out every epoch
    /// active when the node was retired.
    unsafe fn free(&self, addr: DurableAddr, size: usize, align: usize);

    /// The durable root slot, encoding a [`crate::node::lock::ChildPtr`].
    fn root_slot(&self) -> &AtomicU64;
}

/// Persist a cache-line-granular range (spec §6). The bundled collaborators
/// run on DRAM, so this is a no-op placed at exactly the call sites a real
/// PMEM-backed allocator would wire to `clwb`/`clflushopt` + the surrounding
/// range math.
#[inline]
pub fn flush(_addr: usize, _len: usize) {}

/// Store fence enforcing persistence order (spec §6).
#[inline]
pub fn fence() {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}
