//! `HeapPmem`: the default, DRAM-backed [`PmemAllocator`].
//!
//! Grounded on the teacher's `utils/arena.rs::BlockArena` (an `Arena` trait
//! over `unsafe fn allocate<T>(&self, layout) -> *mut T`, with an
//! `AtomicUsize` memory-usage counter). Unlike `BlockArena`'s bump allocator,
//! nodes here are freed individually on shrink/collapse/recovery, so this
//! wraps `std::alloc::{alloc, dealloc}` directly rather than bump-allocating
//! out of fixed blocks.

use std::alloc::Layout;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::ArtError;
use crate::pmem::{DurableAddr, PmemAllocator};

#[derive(Debug)]
pub struct HeapPmem {
    memory_usage: AtomicUsize,
    root: AtomicU64,
}

impl HeapPmem {
    pub fn new() -> Self {
        Self {
            memory_usage: AtomicUsize::new(0),
            root: AtomicU64::new(0),
        }
    }

    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Acquire)
    }
}

impl Default for HeapPmem {
    fn default() -> Self {
        Self::new()
    }
}

impl PmemAllocator for HeapPmem {
    fn alloc(&self, size: usize, align: usize) -> Result<DurableAddr, ArtError> {
        let layout = Layout::from_size_align(size, align)
            .map_err(|e| ArtError::AllocationFailure(e.to_string()))?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(ArtError::AllocationFailure(format!(
                "alloc({size}, {align}) returned null"
            )));
        }
        self.memory_usage.fetch_add(size, Ordering::Release);
        Ok(ptr as usize)
    }

    unsafe fn free(&self, addr: DurableAddr, size: usize, align: usize) {
        let layout = Layout::from_size_align_unchecked(size, align);
        std::alloc::dealloc(addr as *mut u8, layout);
        self.memory_usage.fetch_sub(size, Ordering::Release);
    }

    fn root_slot(&self) -> &AtomicU64 {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_tracks_memory_usage() {
        let pmem = HeapPmem::new();
        let addr = pmem.alloc(64, 8).unwrap();
        assert_eq!(pmem.memory_usage(), 64);
        unsafe { pmem.free(addr, 64, 8) };
        assert_eq!(pmem.memory_usage(), 0);
    }
}
