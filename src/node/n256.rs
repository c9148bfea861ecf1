//! N256: direct 256-entry child array, indexed by key byte.
//!
//! Grounded on spec §4.2's N256 row; the direct-indexing scheme needs no
//! per-node journal fallback beyond the shared `journaled_lookup` pattern
//! used by every other variant.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ArtError;
use crate::node::lock::{ChildPtr, Journal};
use crate::node::prefix::Prefix;
use crate::node::{layout_of, NodeHeader, NodeType};
use crate::pmem::{flush, PmemAllocator};

pub(crate) const CAPACITY: usize = 256;

#[repr(C)]
#[repr(align(64))]
pub(crate) struct Node256 {
    pub(crate) header: NodeHeader,
    pub(crate) children: [AtomicU64; CAPACITY],
}

pub(crate) fn allocate(
    allocator: &dyn PmemAllocator,
    level: u32,
    prefix: Prefix,
) -> Result<NonNull<Node256>, ArtError> {
    let layout = layout_of(NodeType::N256);
    let addr = allocator.alloc(layout.size(), layout.align())?;
    unsafe {
        let ptr = addr as *mut Node256;
        std::ptr::write(
            std::ptr::addr_of_mut!((*ptr).header),
            NodeHeader::new(NodeType::N256, level, prefix),
        );
        for i in 0..CAPACITY {
            std::ptr::write(
                std::ptr::addr_of_mut!((*ptr).children[i]),
                AtomicU64::new(0),
            );
        }
        flush(addr, layout.size());
        crate::pmem::fence();
        Ok(NonNull::new_unchecked(ptr))
    }
}

fn journaled_lookup(node: &Node256, slot: usize, current: ChildPtr) -> ChildPtr {
    let j = Journal::from_raw(node.header.journal.load(Ordering::SeqCst));
    if j.is_valid() && j.slot_index() as usize == slot {
        j.previous()
    } else {
        current
    }
}

pub(crate) fn get_child(node: &Node256, key: u8) -> ChildPtr {
    let child = ChildPtr(node.children[key as usize].load(Ordering::SeqCst));
    journaled_lookup(node, key as usize, child)
}

/// # Safety
/// Caller holds the write lock. N256 has no "full" state short of 256 children.
pub(crate) unsafe fn insert(node: &Node256, key: u8, child: ChildPtr) -> bool {
    let old = ChildPtr(node.children[key as usize].load(Ordering::SeqCst));
    node.header
        .journaled_store(&node.children[key as usize], key, old, child);
    node.header.increment_count();
    true
}

/// # Safety
/// Caller holds the write lock and `key` is present.
pub(crate) unsafe fn change(node: &Node256, key: u8, child: ChildPtr) {
    let old = ChildPtr(node.children[key as usize].load(Ordering::SeqCst));
    node.header
        .journaled_store(&node.children[key as usize], key, old, child);
}

/// # Safety
/// Caller holds the write lock.
pub(crate) unsafe fn remove(node: &Node256, key: u8) {
    let old = ChildPtr(node.children[key as usize].load(Ordering::SeqCst));
    node.header
        .journaled_store(&node.children[key as usize], key, old, ChildPtr::NULL);
    node.header.decrement_count();
}

pub(crate) fn get_any_child(node: &Node256) -> ChildPtr {
    let mut any = ChildPtr::NULL;
    for b in 0..=255u8 {
        let child = journaled_lookup(node, b as usize, ChildPtr(node.children[b as usize].load(Ordering::SeqCst)));
        if !child.is_null() {
            if child.is_leaf() {
                return child;
            }
            any = child;
        }
    }
    any
}

pub(crate) fn get_children(node: &Node256, start: u8, end: u8) -> Vec<(u8, ChildPtr)> {
    let mut out = Vec::new();
    for b in start..=end {
        let child = journaled_lookup(node, b as usize, ChildPtr(node.children[b as usize].load(Ordering::SeqCst)));
        if !child.is_null() {
            out.push((b, child));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::HeapPmem;

    fn new_node256() -> NonNull<Node256> {
        let pmem = Box::leak(Box::new(HeapPmem::new()));
        allocate(pmem, 0, Prefix::default()).unwrap()
    }

    #[test]
    fn direct_indexing_round_trip() {
        let ptr = new_node256();
        let node = unsafe { ptr.as_ref() };
        unsafe {
            for b in 0u8..=255 {
                assert!(insert(node, b, ChildPtr::leaf(b as usize + 1)));
            }
        }
        assert_eq!(node.header.count(), 256);
        for b in 0u8..=255 {
            assert_eq!(get_child(node, b), ChildPtr::leaf(b as usize + 1));
        }
    }

    #[test]
    fn remove_then_lookup_misses() {
        let ptr = new_node256();
        let node = unsafe { ptr.as_ref() };
        unsafe {
            insert(node, 5, ChildPtr::leaf(55));
            remove(node, 5);
        }
        assert!(get_child(node, 5).is_null());
    }
}
