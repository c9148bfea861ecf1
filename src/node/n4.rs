//! N4: unsorted parallel arrays of up to 4 (key byte, child) pairs.
//!
//! Grounded directly on `original_source/ART/N4.cpp` (`insert`/`change`/
//! `getChild`/`remove`/`getAnyChild`/`getChildren`, including the
//! old-pointer journal dance) and the teacher's `utils/art/node.rs::Node4`
//! layout.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::error::ArtError;
use crate::node::lock::{ChildPtr, Journal};
use crate::node::prefix::Prefix;
use crate::node::{layout_of, NodeHeader, NodeType};
use crate::pmem::{flush, PmemAllocator};

pub(crate) const CAPACITY: usize = 4;

#[repr(C)]
#[repr(align(64))]
pub(crate) struct Node4 {
    pub(crate) header: NodeHeader,
    pub(crate) keys: [AtomicU8; CAPACITY],
    pub(crate) children: [AtomicU64; CAPACITY],
}

pub(crate) fn allocate(
    allocator: &dyn PmemAllocator,
    level: u32,
    prefix: Prefix,
) -> Result<NonNull<Node4>, ArtError> {
    let layout = layout_of(NodeType::N4);
    let addr = allocator.alloc(layout.size(), layout.align())?;
    unsafe {
        let ptr = addr as *mut Node4;
        std::ptr::write(
            std::ptr::addr_of_mut!((*ptr).header),
            NodeHeader::new(NodeType::N4, level, prefix),
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

fn journaled_lookup(node: &Node4, i: usize, current: ChildPtr) -> ChildPtr {
    let j = Journal::from_raw(node.header.journal.load(Ordering::SeqCst));
    if j.is_valid() && j.slot_index() as usize == i {
        j.previous()
    } else {
        current
    }
}

pub(crate) fn get_child(node: &Node4, key: u8) -> ChildPtr {
    let compact = node.header.compact_count() as usize;
    for i in 0..compact {
        let child = ChildPtr(node.children[i].load(Ordering::SeqCst));
        if !child.is_null() && node.keys[i].load(Ordering::SeqCst) == key {
            return journaled_lookup(node, i, child);
        }
    }
    // Fallback: the journal may name a slot not yet reflected by compact_count.
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
pub(crate) unsafe fn insert(node: &Node4, key: u8, child: ChildPtr) -> bool {
    let compact = node.header.compact_count() as usize;
    if compact == CAPACITY {
        return false;
    }
    node.keys[compact].store(key, Ordering::SeqCst);
    flush(&node.keys[compact] as *const _ as usize, 1);

    node.header.journaled_store(
        &node.children[compact],
        compact as u8,
        ChildPtr::NULL,
        child,
    );
    node.header.increment_count();
    true
}

/// # Safety
/// Caller holds the write lock and `key` is present.
pub(crate) unsafe fn change(node: &Node4, key: u8, child: ChildPtr) {
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
pub(crate) unsafe fn remove(node: &Node4, key: u8) {
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

pub(crate) fn get_any_child(node: &Node4) -> ChildPtr {
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

pub(crate) fn get_children(node: &Node4, start: u8, end: u8) -> Vec<(u8, ChildPtr)> {
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

/// The "second child" of an N4 with exactly two live children, used by
/// collapse (spec §4.4: N4 with `count == 1` promotes its sole remaining
/// child, but the general two-child case is needed by split/compaction too).
pub(crate) fn get_second_child(node: &Node4, key: u8) -> Option<(u8, ChildPtr)> {
    let compact = node.header.compact_count() as usize;
    for i in 0..compact {
        let k = node.keys[i].load(Ordering::SeqCst);
        let child = ChildPtr(node.children[i].load(Ordering::SeqCst));
        if !child.is_null() && k != key {
            return Some((k, child));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::HeapPmem;

    fn new_node4() -> NonNull<Node4> {
        let pmem = Box::leak(Box::new(HeapPmem::new()));
        allocate(pmem, 0, Prefix::default()).unwrap()
    }

    #[test]
    fn insert_then_get_child() {
        let ptr = new_node4();
        let node = unsafe { ptr.as_ref() };
        unsafe {
            assert!(insert(node, b'a', ChildPtr::leaf(0x100)));
            assert!(insert(node, b'b', ChildPtr::leaf(0x200)));
        }
        assert_eq!(get_child(node, b'a'), ChildPtr::leaf(0x100));
        assert_eq!(get_child(node, b'b'), ChildPtr::leaf(0x200));
        assert!(get_child(node, b'c').is_null());
    }

    #[test]
    fn full_node_rejects_insert() {
        let ptr = new_node4();
        let node = unsafe { ptr.as_ref() };
        unsafe {
            for (i, b) in [b'a', b'b', b'c', b'd'].into_iter().enumerate() {
                assert!(insert(node, b, ChildPtr::leaf(0x100 + i)));
            }
            assert!(!insert(node, b'e', ChildPtr::leaf(0x999)));
        }
    }

    #[test]
    fn remove_clears_slot_and_count() {
        let ptr = new_node4();
        let node = unsafe { ptr.as_ref() };
        unsafe {
            insert(node, b'a', ChildPtr::leaf(0x100));
            insert(node, b'b', ChildPtr::leaf(0x200));
            remove(node, b'a');
        }
        assert!(get_child(node, b'a').is_null());
        assert_eq!(node.header.count(), 1);
    }

    #[test]
    fn get_children_sorted_and_bounded() {
        let ptr = new_node4();
        let node = unsafe { ptr.as_ref() };
        unsafe {
            insert(node, b'd', ChildPtr::leaf(4));
            insert(node, b'a', ChildPtr::leaf(1));
            insert(node, b'c', ChildPtr::leaf(3));
        }
        let kids = get_children(node, b'a', b'c');
        assert_eq!(kids.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![b'a', b'c']);
    }
}
