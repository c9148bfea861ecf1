//! N16: unsorted parallel arrays of up to 16 (key byte, child) pairs,
//! laid out byte-comparable so a real implementation can SIMD-scan them.
//!
//! Grounded on spec §4.2's N16 row and `original_source/ART/N4.cpp`'s
//! pattern, generalized to 16 slots (the source's N16 source file was not
//! retrieved; the algorithm is identical to N4's with a wider capacity).

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::error::ArtError;
use crate::node::lock::{ChildPtr, Journal};
use crate::node::prefix::Prefix;
use crate::node::{layout_of, NodeHeader, NodeType};
use crate::pmem::{flush, PmemAllocator};

pub(crate) const CAPACITY: usize = 16;

#[repr(C)]
#[repr(align(64))]
pub(crate) struct Node16 {
    pub(crate) header: NodeHeader,
    pub(crate) keys: [AtomicU8; CAPACITY],
    pub(crate) children: [AtomicU64; CAPACITY],
}

pub(crate) fn allocate(
    allocator: &dyn PmemAllocator,
    level: u32,
    prefix: Prefix,
) -> Result<NonNull<Node16>, ArtError> {
    let layout = layout_of(NodeType::N16);
    let addr = allocator.alloc(layout.size(), layout.align())?;
    unsafe {
        let ptr = addr as *mut Node16;
        std::ptr::write(
            std::ptr::addr_of_mut!((*ptr).header),
            NodeHeader::new(NodeType::N16, level, prefix),
        );
        for i in 0..CAPACITY {
            std::ptr::write(std::ptr::addr_of_mut!((*ptr).keys[i]), AtomicU8::new(0));
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

fn journaled_lookup(node: &Node16, i: usize, current: ChildPtr) -> ChildPtr {
    let j = Journal::from_raw(node.header.journal.load(Ordering::SeqCst));
    if j.is_valid() && j.slot_index() as usize == i {
        j.previous()
    } else {
        current
    }
}

pub(crate) fn get_child(node: &Node16, key: u8) -> ChildPtr {
    let compact = node.header.compact_count() as usize;
    for i in 0..compact {
        let child = ChildPtr(node.children[i].load(Ordering::SeqCst));
        if !child.is_null() && node.keys[i].load(Ordering::SeqCst) == key {
            return journaled_lookup(node, i, child);
        }
    }
    let j = Journal::from_raw(node.header.journal.load(Ordering::SeqCst));
    if j.is_valid() {
        let idx = j.slot_index() as usize;
        if idx < CAPACITY && node.keys[idx].load(Ordering::SeqCst) == key {
            return j.previous();
        }
    }
    ChildPtr::NULL
}

/// # Safety
/// Caller holds the write lock.
pub(crate) unsafe fn insert(node: &Node16, key: u8, child: ChildPtr) -> bool {
    let compact = node.header.compact_count() as usize;
    if compact == CAPACITY {
        return false;
    }
    node.keys[compact].store(key, Ordering::SeqCst);
    flush(&node.keys[compact] as *const _ as usize, 1);

    node.header
        .journaled_store(&node.children[compact], compact as u8, ChildPtr::NULL, child);
    node.header.increment_count();
    true
}

/// # Safety
/// Caller holds the write lock and `key` is present.
pub(crate) unsafe fn change(node: &Node16, key: u8, child: ChildPtr) {
    let compact = node.header.compact_count() as usize;
    for i in 0..compact {
        let old = ChildPtr(node.children[i].load(Ordering::SeqCst));
        if !old.is_null() && node.keys[i].load(Ordering::SeqCst) == key {
            node.header.journaled_store(&node.children[i], i as u8, old, child);
            return;
        }
    }
}

/// # Safety
/// Caller holds the write lock.
pub(crate) unsafe fn remove(node: &Node16, key: u8) {
    let compact = node.header.compact_count() as usize;
    for i in 0..compact {
        let old = ChildPtr(node.children[i].load(Ordering::SeqCst));
        if !old.is_null() && node.keys[i].load(Ordering::SeqCst) == key {
            node.header
                .journaled_store(&node.children[i], i as u8, old, ChildPtr::NULL);
            node.header.decrement_count();
            return;
        }
    }
}

pub(crate) fn get_any_child(node: &Node16) -> ChildPtr {
    let compact = node.header.compact_count() as usize;
    let mut any = ChildPtr::NULL;
    for i in 0..compact {
        let child = journaled_lookup(node, i, ChildPtr(node.children[i].load(Ordering::SeqCst)));
        if !child.is_null() {
            if child.is_leaf() {
                return child;
            }
            any = child;
        }
    }
    any
}

pub(crate) fn get_children(node: &Node16, start: u8, end: u8) -> Vec<(u8, ChildPtr)> {
    let compact = node.header.compact_count() as usize;
    let mut out = Vec::with_capacity(compact);
    for i in 0..compact {
        let key = node.keys[i].load(Ordering::SeqCst);
        if key < start || key > end {
            continue;
        }
        let child = journaled_lookup(node, i, ChildPtr(node.children[i].load(Ordering::SeqCst)));
        if !child.is_null() {
            out.push((key, child));
        }
    }
    out.sort_by_key(|(k, _)| *k);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::HeapPmem;

    fn new_node16() -> NonNull<Node16> {
        let pmem = Box::leak(Box::new(HeapPmem::new()));
        allocate(pmem, 0, Prefix::default()).unwrap()
    }

    #[test]
    fn fills_to_sixteen_then_rejects() {
        let ptr = new_node16();
        let node = unsafe { ptr.as_ref() };
        unsafe {
            for b in 0u8..16 {
                assert!(insert(node, b, ChildPtr::leaf(0x100 + b as usize)));
            }
            assert!(!insert(node, 16, ChildPtr::leaf(0xFFFF)));
        }
        assert_eq!(node.header.count(), 16);
    }

    #[test]
    fn change_swaps_value() {
        let ptr = new_node16();
        let node = unsafe { ptr.as_ref() };
        unsafe {
            insert(node, b'x', ChildPtr::leaf(1));
            change(node, b'x', ChildPtr::leaf(2));
        }
        assert_eq!(get_child(node, b'x'), ChildPtr::leaf(2));
    }
}
