//! N48: a 256-byte index array mapping key byte -> slot in a 48-entry
//! child array.
//!
//! Grounded on spec §4.2's N48 row (`child[index[b]]`) and the journal
//! protocol from `original_source/ART/N4.cpp`, adapted to the indirect
//! indexing scheme (the source's N48 file was not retrieved; indices are
//! simply the slot into which the child was appended, matching how the
//! original ART paper's N48 reserves the next free child slot on insert).

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::error::ArtError;
use crate::node::lock::{ChildPtr, Journal};
use crate::node::prefix::Prefix;
use crate::node::{layout_of, NodeHeader, NodeType};
use crate::pmem::{flush, PmemAllocator};

pub(crate) const CAPACITY: usize = 48;
const EMPTY_INDEX: u8 = 0xFF;

#[repr(C)]
#[repr(align(64))]
pub(crate) struct Node48 {
    pub(crate) header: NodeHeader,
    /// `index[b] == EMPTY_INDEX` means key byte `b` has no child.
    pub(crate) index: [AtomicU8; 256],
    pub(crate) children: [AtomicU64; CAPACITY],
}

pub(crate) fn allocate(
    allocator: &dyn PmemAllocator,
    level: u32,
    prefix: Prefix,
) -> Result<NonNull<Node48>, ArtError> {
    let layout = layout_of(NodeType::N48);
    let addr = allocator.alloc(layout.size(), layout.align())?;
    unsafe {
        let ptr = addr as *mut Node48;
        std::ptr::write(
            std::ptr::addr_of_mut!((*ptr).header),
            NodeHeader::new(NodeType::N48, level, prefix),
        );
        for i in 0..256 {
            std::ptr::write(
                std::ptr::addr_of_mut!((*ptr).index[i]),
                AtomicU8::new(EMPTY_INDEX),
            );
        }
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

fn journaled_lookup(node: &Node48, slot: usize, current: ChildPtr) -> ChildPtr {
    let j = Journal::from_raw(node.header.journal.load(Ordering::SeqCst));
    if j.is_valid() && j.slot_index() as usize == slot {
        j.previous()
    } else {
        current
    }
}

pub(crate) fn get_child(node: &Node48, key: u8) -> ChildPtr {
    let idx = node.index[key as usize].load(Ordering::SeqCst);
    if idx == EMPTY_INDEX {
        return ChildPtr::NULL;
    }
    let child = ChildPtr(node.children[idx as usize].load(Ordering::SeqCst));
    journaled_lookup(node, idx as usize, child)
}

/// # Safety
/// Caller holds the write lock.
pub(crate) unsafe fn insert(node: &Node48, key: u8, child: ChildPtr) -> bool {
    let compact = node.header.compact_count() as usize;
    if compact == CAPACITY {
        return false;
    }
    let slot = compact as u8;
    node.index[key as usize].store(slot, Ordering::SeqCst);
    flush(&node.index[key as usize] as *const _ as usize, 1);

    node.header
        .journaled_store(&node.children[slot as usize], slot, ChildPtr::NULL, child);
    node.header.increment_count();
    true
}

/// # Safety
/// Caller holds the write lock and `key` is present.
pub(crate) unsafe fn change(node: &Node48, key: u8, child: ChildPtr) {
    let idx = node.index[key as usize].load(Ordering::SeqCst);
    if idx == EMPTY_INDEX {
        return;
    }
    let old = ChildPtr(node.children[idx as usize].load(Ordering::SeqCst));
    node.header
        .journaled_store(&node.children[idx as usize], idx, old, child);
}

/// # Safety
/// Caller holds the write lock.
pub(crate) unsafe fn remove(node: &Node48, key: u8) {
    let idx = node.index[key as usize].load(Ordering::SeqCst);
    if idx == EMPTY_INDEX {
        return;
    }
    let old = ChildPtr(node.children[idx as usize].load(Ordering::SeqCst));
    node.header
        .journaled_store(&node.children[idx as usize], idx, old, ChildPtr::NULL);
    node.index[key as usize].store(EMPTY_INDEX, Ordering::SeqCst);
    flush(&node.index[key as usize] as *const _ as usize, 1);
    node.header.decrement_count();
}

pub(crate) fn get_any_child(node: &Node48) -> ChildPtr {
    let mut any = ChildPtr::NULL;
    for b in 0..=255u8 {
        let idx = node.index[b as usize].load(Ordering::SeqCst);
        if idx == EMPTY_INDEX {
            continue;
        }
        let child =
            journaled_lookup(node, idx as usize, ChildPtr(node.children[idx as usize].load(Ordering::SeqCst)));
        if !child.is_null() {
            if child.is_leaf() {
                return child;
            }
            any = child;
        }
    }
    any
}

pub(crate) fn get_children(node: &Node48, start: u8, end: u8) -> Vec<(u8, ChildPtr)> {
    let mut out = Vec::new();
    for b in start..=end {
        let idx = node.index[b as usize].load(Ordering::SeqCst);
        if idx == EMPTY_INDEX {
            continue;
        }
        let child =
            journaled_lookup(node, idx as usize, ChildPtr(node.children[idx as usize].load(Ordering::SeqCst)));
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

    fn new_node48() -> NonNull<Node48> {
        let pmem = Box::leak(Box::new(HeapPmem::new()));
        allocate(pmem, 0, Prefix::default()).unwrap()
    }

    #[test]
    fn insert_lookup_remove() {
        let ptr = new_node48();
        let node = unsafe { ptr.as_ref() };
        unsafe {
            assert!(insert(node, b'z', ChildPtr::leaf(42)));
        }
        assert_eq!(get_child(node, b'z'), ChildPtr::leaf(42));
        unsafe {
            remove(node, b'z');
        }
        assert!(get_child(node, b'z').is_null());
        assert_eq!(node.header.count(), 0);
    }

    #[test]
    fn fills_to_48_then_rejects() {
        let ptr = new_node48();
        let node = unsafe { ptr.as_ref() };
        unsafe {
            for b in 0u8..48 {
                assert!(insert(node, b, ChildPtr::leaf(b as usize + 1)));
            }
            assert!(!insert(node, 48, ChildPtr::leaf(999)));
        }
    }
}
