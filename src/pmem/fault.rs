//! `FaultInjectingPmem`: a test-only allocator that can be told to start
//! refusing allocations after N calls, simulating the allocator becoming
//! unavailable mid-crash (spec §7's `AllocationFailure`).
//!
//! Grounded on the teacher's layered-allocator idiom (`utils/arena.rs`'s
//! `BlockArena` wraps an inner block list the same way this wraps an inner
//! `PmemAllocator`).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::ArtError;
use crate::pmem::{DurableAddr, HeapPmem, PmemAllocator};

pub struct FaultInjectingPmem {
    inner: HeapPmem,
    alloc_calls: AtomicUsize,
    /// `None` = never crash. `Some(n)` = the n-th call to `alloc` (1-indexed)
    /// and every call after it fails with `AllocationFailure`.
    crash_after: Option<usize>,
}

impl FaultInjectingPmem {
    pub fn new() -> Self {
        Self {
            inner: HeapPmem::new(),
            alloc_calls: AtomicUsize::new(0),
            crash_after: None,
        }
    }

    pub fn crashing_after(crash_after: usize) -> Self {
        Self {
            inner: HeapPmem::new(),
            alloc_calls: AtomicUsize::new(0),
            crash_after: Some(crash_after),
        }
    }

    pub fn alloc_calls(&self) -> usize {
        self.alloc_calls.load(Ordering::SeqCst)
    }
}

impl Default for FaultInjectingPmem {
    fn default() -> Self {
        Self::new()
    }
}

impl PmemAllocator for FaultInjectingPmem {
    fn alloc(&self, size: usize, align: usize) -> Result<DurableAddr, ArtError> {
        let call = self.alloc_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.crash_after {
            if call >= limit {
                return Err(ArtError::AllocationFailure(format!(
                    "simulated PMEM crash at allocation #{call}"
                )));
            }
        }
        self.inner.alloc(size, align)
    }

    unsafe fn free(&self, addr: DurableAddr, size: usize, align: usize) {
        self.inner.free(addr, size, align)
    }

    fn root_slot(&self) -> &AtomicU64 {
        self.inner.root_slot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crashes_after_configured_call_count() {
        let pmem = FaultInjectingPmem::crashing_after(2);
        assert!(pmem.alloc(8, 8).is_ok());
        assert!(pmem.alloc(8, 8).is_err());
    }

    #[test]
    fn never_crashes_by_default() {
        let pmem = FaultInjectingPmem::new();
        for _ in 0..100 {
            assert!(pmem.alloc(8, 8).is_ok());
        }
    }
}
