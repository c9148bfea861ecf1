//! Crash recovery: a single-threaded startup pass over the whole tree that
//! repairs any mutation a crash caught mid-flight, before any concurrent
//! access begins.
//!
//! Grounded on spec §4.7 and the journaled-write protocol from
//! `original_source/ART/N4.cpp`; logging follows the teacher's `lib.rs`
//! global `tracing_subscriber` init, used the same way the teacher logs
//! compaction/flush progress elsewhere.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use tracing::{info, warn};

use crate::node::lock::ChildPtr;
use crate::node::{InnerNodeRef, NodeHeader};
use crate::pmem::PmemAllocator;

/// Walk the tree rooted at `allocator`'s root slot and repair every node:
/// restore any in-flight indexed or `self_leaf` journal entry, clear
/// journals, reset version-lock words to unlocked/not-obsolete, and flag
/// stray dirty pointer tags. Must complete before `Art` begins serving
/// concurrent operations against this allocator.
pub fn recover(allocator: &dyn PmemAllocator) {
    let root = ChildPtr(allocator.root_slot().load(Ordering::SeqCst));
    if root.is_null() {
        info!("recovery: empty tree, nothing to repair");
        return;
    }
    if root.is_leaf() {
        info!("recovery: single-leaf root, nothing to repair");
        return;
    }

    let mut visited = 0usize;
    let root_header = unsafe { NonNull::new_unchecked(root.addr() as *mut NodeHeader) };
    walk(root_header, &mut visited);
    info!(nodes_repaired = visited, "recovery pass complete");
}

fn walk(header_ptr: NonNull<NodeHeader>, visited: &mut usize) {
    *visited += 1;

    // SAFETY: recovery runs single-threaded before the tree is published to
    // any reader or writer, so no concurrent access can race these repairs.
    let node = unsafe { InnerNodeRef::from_header(header_ptr) };
    unsafe { node.restore_journal() };

    let header = node.header();
    unsafe { header.restore_self_leaf_journal() };
    header.lock.reset_for_recovery();

    for (key_byte, child) in node.all_children() {
        if child.is_null() {
            continue;
        }
        if child.is_dirty() {
            // No write path in this crate currently sets the dirty tag (it
            // is carried in the wire format per spec for a future
            // write-combining optimization); flag it rather than silently
            // dropping a bit a future writer might come to rely on.
            warn!(key_byte, addr = child.addr(), "recovery: stray dirty tag on child pointer");
        }
        if !child.is_leaf() {
            let child_header = unsafe { NonNull::new_unchecked(child.addr() as *mut NodeHeader) };
            walk(child_header, visited);
        }
    }

    if let Some(self_leaf) = non_null_self_leaf(header) {
        if self_leaf.is_dirty() {
            warn!(addr = self_leaf.addr(), "recovery: stray dirty tag on self_leaf pointer");
        }
    }
}

fn non_null_self_leaf(header: &NodeHeader) -> Option<ChildPtr> {
    let leaf = header.get_self_leaf();
    if leaf.is_null() {
        None
    } else {
        Some(leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{allocate_leaf, allocate_node, NodeType};
    use crate::node::prefix::Prefix;
    use crate::pmem::HeapPmem;
    use bytes::Bytes;

    #[test]
    fn recovers_empty_tree_without_panicking() {
        let pmem = HeapPmem::new();
        recover(&pmem);
    }

    #[test]
    fn recovers_single_leaf_root_without_panicking() {
        let pmem = HeapPmem::new();
        let leaf = allocate_leaf(&pmem, Bytes::from_static(b"k"), Bytes::from_static(b"v")).unwrap();
        pmem.root_slot()
            .store(ChildPtr::leaf(leaf.as_ptr() as usize).0, Ordering::SeqCst);
        recover(&pmem);
    }

    #[test]
    fn clears_a_stale_indexed_journal_entry() {
        let pmem = HeapPmem::new();
        let node = allocate_node(&pmem, NodeType::N4, 0, Prefix::default()).unwrap();
        let leaf = allocate_leaf(&pmem, Bytes::from_static(b"k"), Bytes::from_static(b"v")).unwrap();
        unsafe {
            node.insert_child(b'a', ChildPtr::leaf(leaf.as_ptr() as usize));
        }
        // Simulate a crash that left a valid-but-stale journal entry behind.
        node.header().journal.store(
            crate::node::lock::Journal::new(0, ChildPtr::NULL).raw(),
            Ordering::SeqCst,
        );
        pmem.root_slot()
            .store(ChildPtr::inner(node.header_ptr().as_ptr() as usize).0, Ordering::SeqCst);

        recover(&pmem);

        assert_eq!(node.header().read_journal().raw(), 0);
        assert!(node.header().lock.read_valid().is_ok());
    }

    /// spec §8 scenario 5: a crash between the new-pointer store and the
    /// journal clear must not roll an already-durable write back to its old
    /// value — recovery should leave the slot alone and only clear the
    /// journal.
    #[test]
    fn recovery_preserves_durable_indexed_value_when_journal_still_valid() {
        let pmem = HeapPmem::new();
        let node = allocate_node(&pmem, NodeType::N4, 0, Prefix::default()).unwrap();
        let leaf = allocate_leaf(
            &pmem,
            Bytes::from_static(b"apricot"),
            Bytes::from_static(b"2"),
        )
        .unwrap();
        let leaf_ptr = ChildPtr::leaf(leaf.as_ptr() as usize);
        unsafe {
            assert!(node.insert_child(b'x', leaf_ptr));
        }
        // `insert_child` already completed and cleared its own journal; re-arm
        // a valid-but-already-applied journal entry to simulate a crash that
        // landed after the slot store + flush but before the journal clear.
        node.header().journal.store(
            crate::node::lock::Journal::new(0, ChildPtr::NULL).raw(),
            Ordering::SeqCst,
        );
        pmem.root_slot()
            .store(ChildPtr::inner(node.header_ptr().as_ptr() as usize).0, Ordering::SeqCst);

        recover(&pmem);

        assert_eq!(node.header().read_journal().raw(), 0);
        let recovered = node.get_child(b'x');
        assert_eq!(recovered, leaf_ptr, "durable new value must survive recovery");
        let recovered_leaf = unsafe { &*(recovered.addr() as *const crate::node::Leaf) };
        assert_eq!(recovered_leaf.value().as_ref(), b"2");
    }

    /// Same scenario for the `self_leaf` slot (the key-ends-here case, not an
    /// indexed child).
    #[test]
    fn recovery_preserves_durable_self_leaf_when_journal_still_valid() {
        let pmem = HeapPmem::new();
        let node = allocate_node(&pmem, NodeType::N4, 0, Prefix::default()).unwrap();
        let leaf = allocate_leaf(&pmem, Bytes::from_static(b"app"), Bytes::from_static(b"1")).unwrap();
        let leaf_ptr = ChildPtr::leaf(leaf.as_ptr() as usize);
        unsafe {
            node.header().set_self_leaf_journaled(leaf_ptr);
        }
        // Re-arm a valid-but-already-applied self_leaf journal entry (the
        // previous value was null, the only other state possible here).
        node.header()
            .self_leaf_journal
            .store(1u64 << 63, Ordering::SeqCst);
        pmem.root_slot()
            .store(ChildPtr::inner(node.header_ptr().as_ptr() as usize).0, Ordering::SeqCst);

        recover(&pmem);

        assert_eq!(node.header().self_leaf_journal.load(Ordering::SeqCst), 0);
        let recovered = node.header().get_self_leaf();
        assert_eq!(recovered, leaf_ptr, "durable self_leaf value must survive recovery");
        let recovered_leaf = unsafe { &*(recovered.addr() as *const crate::node::Leaf) };
        assert_eq!(recovered_leaf.value().as_ref(), b"1");
    }
}
