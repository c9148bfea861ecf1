//! Node taxonomy: the common header every inner node carries, the four
//! fan-out variants, and the dispatch that picks among them by the type tag
//! packed into the version-lock word (see `lock.rs`).
//!
//! Grounded on the teacher's `utils/art/node.rs` (`IntenalNode`, `Node4`,
//! `Node16`, `Node28`, `Node256` — all `#[repr(C)] #[repr(align(64))]`) and
//! `original_source/ART/N.h`'s `N`/`BaseNode`/`Prefix`.

pub(crate) mod leaf;
pub(crate) mod lock;
pub(crate) mod n16;
pub(crate) mod n256;
pub(crate) mod n4;
pub(crate) mod n48;
pub(crate) mod prefix;

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use crate::error::{ArtError, OptLockError, OptResult};
use crate::node::lock::{ChildPtr, Journal, VersionLock};
use crate::node::prefix::Prefix;
use crate::pmem::{flush, PmemAllocator};

pub(crate) use leaf::Leaf;
pub(crate) use n16::Node16;
pub(crate) use n256::Node256;
pub(crate) use n4::Node4;
pub(crate) use n48::Node48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeType {
    N4,
    N16,
    N48,
    N256,
}

impl NodeType {
    pub(crate) fn tag(self) -> u8 {
        match self {
            NodeType::N4 => 0,
            NodeType::N16 => 1,
            NodeType::N48 => 2,
            NodeType::N256 => 3,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Self {
        match tag {
            0 => NodeType::N4,
            1 => NodeType::N16,
            2 => NodeType::N48,
            3 => NodeType::N256,
            other => unreachable!("invalid node type tag {other}"),
        }
    }

    pub(crate) fn capacity(self) -> usize {
        match self {
            NodeType::N4 => 4,
            NodeType::N16 => 16,
            NodeType::N48 => 48,
            NodeType::N256 => 256,
        }
    }

    pub(crate) fn grows_to(self) -> Option<NodeType> {
        match self {
            NodeType::N4 => Some(NodeType::N16),
            NodeType::N16 => Some(NodeType::N48),
            NodeType::N48 => Some(NodeType::N256),
            NodeType::N256 => None,
        }
    }

    pub(crate) fn shrinks_to(self) -> Option<NodeType> {
        match self {
            NodeType::N256 => Some(NodeType::N48),
            NodeType::N48 => Some(NodeType::N16),
            NodeType::N16 => Some(NodeType::N4),
            NodeType::N4 => None,
        }
    }
}

/// Shrink triggers from spec §4.4: node shrinks when `count` drops to or
/// below the threshold for its current variant.
pub(crate) fn shrink_threshold(ty: NodeType) -> Option<u16> {
    match ty {
        NodeType::N256 => Some(37),
        NodeType::N48 => Some(12),
        NodeType::N16 => Some(3),
        NodeType::N4 => Some(1), // count == 1 triggers collapse, not shrink-to-variant
    }
}

/// The fields common to every inner node variant. Always the first field of
/// the concrete struct (`repr(C)`), so a pointer to the concrete node and a
/// pointer to its header are the same address.
#[repr(C)]
pub(crate) struct NodeHeader {
    pub(crate) lock: VersionLock,
    /// Encodes a `Journal` (see `lock.rs`); `0` means clean.
    pub(crate) journal: AtomicU64,
    pub(crate) prefix: UnsafeCell<Prefix>,
    /// Depth in the tree. Mutated in place when a node's position changes
    /// (split pushes it deeper, collapse pulls a child shallower) — always
    /// under the node's own write lock, mirroring `prefix`'s synchronization.
    pub(crate) level: UnsafeCell<u32>,
    pub(crate) count: AtomicU16,
    pub(crate) compact_count: AtomicU16,
    pub(crate) generation: AtomicU64,
    pub(crate) recovery_latch: AtomicU64,
    /// A leaf whose key ends exactly at this node's level (i.e. is a strict
    /// prefix of every sibling key below this node), encoded as a `ChildPtr`.
    /// `0` means none. Keyed separately from the byte-indexed child slots
    /// since no key byte identifies "the key stopped here".
    pub(crate) self_leaf: AtomicU64,
    /// Old-pointer journal for `self_leaf`, same crash-consistency protocol
    /// as the indexed `journal` field but without a slot index: bit 63 is
    /// the VALID flag, the remaining bits are the previous `ChildPtr`.
    pub(crate) self_leaf_journal: AtomicU64,
}

unsafe impl Send for NodeHeader {}
unsafe impl Sync for NodeHeader {}

const SELF_LEAF_JOURNAL_VALID_BIT: u64 = 1 << 63;

impl NodeHeader {
    fn new(ty: NodeType, level: u32, prefix: Prefix) -> Self {
        Self {
            lock: VersionLock::new(ty),
            journal: AtomicU64::new(0),
            prefix: UnsafeCell::new(prefix),
            level: UnsafeCell::new(level),
            count: AtomicU16::new(0),
            compact_count: AtomicU16::new(0),
            generation: AtomicU64::new(0),
            recovery_latch: AtomicU64::new(0),
            self_leaf: AtomicU64::new(0),
            self_leaf_journal: AtomicU64::new(0),
        }
    }

    pub(crate) fn node_type(&self) -> NodeType {
        self.lock.node_type()
    }

    pub(crate) fn count(&self) -> u16 {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) fn compact_count(&self) -> u16 {
        self.compact_count.load(Ordering::SeqCst)
    }

    /// # Safety
    /// Caller must hold a valid read version (racing with a concurrent
    /// `set_level` is only safe because the caller re-validates the version
    /// before trusting anything derived from this read, same as `prefix`).
    pub(crate) fn level(&self) -> usize {
        unsafe { *self.level.get() as usize }
    }

    /// # Safety
    /// Caller must hold the write lock, or be the sole owner during
    /// construction/recovery.
    pub(crate) unsafe fn prefix(&self) -> &Prefix {
        &*self.prefix.get()
    }

    /// # Safety
    /// Caller must hold the write lock on this node.
    pub(crate) unsafe fn set_prefix(&self, p: Prefix) {
        *self.prefix.get() = p;
    }

    /// # Safety
    /// Caller must hold the write lock on this node.
    pub(crate) unsafe fn set_level(&self, level: u32) {
        *self.level.get() = level;
    }

    pub(crate) fn read_journal(&self) -> Journal {
        Journal::from_raw(self.journal.load(Ordering::SeqCst))
    }

    /// The journaled slot write protocol from spec §4.2: record the old
    /// value, store the new value and flush it, then clear the journal.
    ///
    /// # Safety
    /// Caller must hold the write lock on this node.
    pub(crate) unsafe fn journaled_store(
        &self,
        slot: &AtomicU64,
        slot_index: u8,
        old: ChildPtr,
        new: ChildPtr,
    ) {
        self.journal
            .store(Journal::new(slot_index, old).raw(), Ordering::SeqCst);
        flush(&self.journal as *const _ as usize, 8);
        crate::pmem::fence();

        slot.store(new.0, Ordering::SeqCst);
        flush(slot as *const _ as usize, 8);
        crate::pmem::fence();

        self.journal.store(0, Ordering::SeqCst);
        flush(&self.journal as *const _ as usize, 8);
        crate::pmem::fence();
    }

    pub(crate) fn increment_count(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.compact_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_count(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current `self_leaf`, seeing through an in-flight torn write the same
    /// way `journaled_store`'s journal lets readers see through one.
    pub(crate) fn get_self_leaf(&self) -> ChildPtr {
        let j = self.self_leaf_journal.load(Ordering::SeqCst);
        if j & SELF_LEAF_JOURNAL_VALID_BIT != 0 {
            ChildPtr(j & !SELF_LEAF_JOURNAL_VALID_BIT)
        } else {
            ChildPtr(self.self_leaf.load(Ordering::SeqCst))
        }
    }

    /// # Safety
    /// Caller must hold the write lock on this node.
    pub(crate) unsafe fn set_self_leaf_journaled(&self, new: ChildPtr) {
        let old = self.self_leaf.load(Ordering::SeqCst);
        self.self_leaf_journal
            .store(old | SELF_LEAF_JOURNAL_VALID_BIT, Ordering::SeqCst);
        flush(&self.self_leaf_journal as *const _ as usize, 8);
        crate::pmem::fence();

        self.self_leaf.store(new.0, Ordering::SeqCst);
        flush(&self.self_leaf as *const _ as usize, 8);
        crate::pmem::fence();

        self.self_leaf_journal.store(0, Ordering::SeqCst);
        flush(&self.self_leaf_journal as *const _ as usize, 8);
        crate::pmem::fence();
    }

    /// Recovery-only counterpart to `set_self_leaf_journaled`: a valid journal
    /// only means the crash landed somewhere between the journal write and
    /// its clear (`journaled_store`'s step 3) — by the time the journal is
    /// observed valid, the new value's own store + flush (step 2) has always
    /// already happened, so `self_leaf` already durably holds the new value.
    /// There is nothing to roll back; just clear the stale journal.
    ///
    /// # Safety
    /// Single-threaded recovery only, before any other access to this node.
    pub(crate) unsafe fn restore_self_leaf_journal(&self) {
        self.self_leaf_journal.store(0, Ordering::SeqCst);
        flush(&self.self_leaf_journal as *const _ as usize, 8);
        crate::pmem::fence();
    }
}

/// RAII read guard following `utils/art/node.rs::ReadGuard`: holds the
/// optimistically-read version and validates it on `unlock`/`check_version`.
pub(crate) struct ReadGuard {
    pub(crate) ptr: NonNull<NodeHeader>,
    version: u64,
}

impl ReadGuard {
    pub(crate) fn acquire(ptr: NonNull<NodeHeader>) -> OptResult<Self> {
        let version = unsafe { ptr.as_ref() }.lock.read_valid()?;
        Ok(Self { ptr, version })
    }

    pub(crate) fn header(&self) -> &NodeHeader {
        unsafe { self.ptr.as_ref() }
    }

    pub(crate) fn check_version(&self) -> OptResult<()> {
        self.header().lock.check_or_restart(self.version)
    }

    pub(crate) fn unlock(self) -> OptResult<()> {
        self.check_version()
    }

    pub(crate) fn upgrade(self) -> Result<WriteGuard, (ReadGuard, OptLockError)> {
        match self.header().lock.lock_version_or_restart(self.version) {
            Ok(()) => Ok(WriteGuard { ptr: self.ptr }),
            Err(e) => Err((self, e)),
        }
    }
}

/// RAII write guard. Unlock-on-drop mirrors `utils/art/node.rs::WriteGuard`.
pub(crate) struct WriteGuard {
    pub(crate) ptr: NonNull<NodeHeader>,
}

impl WriteGuard {
    pub(crate) fn header(&self) -> &NodeHeader {
        unsafe { self.ptr.as_ref() }
    }

    pub(crate) fn mark_obsolete_and_forget(self) {
        self.header().lock.write_unlock_obsolete();
        std::mem::forget(self);
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.header().lock.write_unlock();
    }
}

/// A tagged reference to one of the four inner-node variants. Dispatch is
/// driven entirely by the type tag in the version-lock word, not by a vtable
/// (spec §9: the tag must be durable and recovery-observable).
#[derive(Clone, Copy)]
pub(crate) enum InnerNodeRef {
    N4(NonNull<Node4>),
    N16(NonNull<Node16>),
    N48(NonNull<Node48>),
    N256(NonNull<Node256>),
}

impl InnerNodeRef {
    /// # Safety
    /// `header` must point at a live node of the type its own lock word claims.
    pub(crate) unsafe fn from_header(header: NonNull<NodeHeader>) -> Self {
        match header.as_ref().node_type() {
            NodeType::N4 => InnerNodeRef::N4(header.cast()),
            NodeType::N16 => InnerNodeRef::N16(header.cast()),
            NodeType::N48 => InnerNodeRef::N48(header.cast()),
            NodeType::N256 => InnerNodeRef::N256(header.cast()),
        }
    }

    pub(crate) fn header_ptr(self) -> NonNull<NodeHeader> {
        match self {
            InnerNodeRef::N4(p) => p.cast(),
            InnerNodeRef::N16(p) => p.cast(),
            InnerNodeRef::N48(p) => p.cast(),
            InnerNodeRef::N256(p) => p.cast(),
        }
    }

    pub(crate) fn header(self) -> &'static NodeHeader {
        unsafe { self.header_ptr().as_ref() }
    }

    pub(crate) fn is_full(self) -> bool {
        self.header().compact_count() as usize >= self.header().node_type().capacity()
    }

    pub(crate) fn get_child(self, key_byte: u8) -> ChildPtr {
        match self {
            InnerNodeRef::N4(p) => n4::get_child(unsafe { p.as_ref() }, key_byte),
            InnerNodeRef::N16(p) => n16::get_child(unsafe { p.as_ref() }, key_byte),
            InnerNodeRef::N48(p) => n48::get_child(unsafe { p.as_ref() }, key_byte),
            InnerNodeRef::N256(p) => n256::get_child(unsafe { p.as_ref() }, key_byte),
        }
    }

    /// # Safety
    /// Caller must hold the write lock on this node and the slot must be empty.
    pub(crate) unsafe fn insert_child(self, key_byte: u8, child: ChildPtr) -> bool {
        match self {
            InnerNodeRef::N4(p) => n4::insert(p.as_ref(), key_byte, child),
            InnerNodeRef::N16(p) => n16::insert(p.as_ref(), key_byte, child),
            InnerNodeRef::N48(p) => n48::insert(p.as_ref(), key_byte, child),
            InnerNodeRef::N256(p) => n256::insert(p.as_ref(), key_byte, child),
        }
    }

    /// # Safety
    /// Caller must hold the write lock on this node.
    pub(crate) unsafe fn change_child(self, key_byte: u8, child: ChildPtr) {
        match self {
            InnerNodeRef::N4(p) => n4::change(p.as_ref(), key_byte, child),
            InnerNodeRef::N16(p) => n16::change(p.as_ref(), key_byte, child),
            InnerNodeRef::N48(p) => n48::change(p.as_ref(), key_byte, child),
            InnerNodeRef::N256(p) => n256::change(p.as_ref(), key_byte, child),
        }
    }

    /// # Safety
    /// Caller must hold the write lock on this node.
    pub(crate) unsafe fn remove_child(self, key_byte: u8) {
        match self {
            InnerNodeRef::N4(p) => n4::remove(p.as_ref(), key_byte),
            InnerNodeRef::N16(p) => n16::remove(p.as_ref(), key_byte),
            InnerNodeRef::N48(p) => n48::remove(p.as_ref(), key_byte),
            InnerNodeRef::N256(p) => n256::remove(p.as_ref(), key_byte),
        }
    }

    pub(crate) fn get_any_child(self) -> ChildPtr {
        match self {
            InnerNodeRef::N4(p) => n4::get_any_child(unsafe { p.as_ref() }),
            InnerNodeRef::N16(p) => n16::get_any_child(unsafe { p.as_ref() }),
            InnerNodeRef::N48(p) => n48::get_any_child(unsafe { p.as_ref() }),
            InnerNodeRef::N256(p) => n256::get_any_child(unsafe { p.as_ref() }),
        }
    }

    /// Sorted `(key_byte, child)` pairs with `key_byte` in `[start, end]`.
    pub(crate) fn get_children(self, start: u8, end: u8) -> Vec<(u8, ChildPtr)> {
        match self {
            InnerNodeRef::N4(p) => n4::get_children(unsafe { p.as_ref() }, start, end),
            InnerNodeRef::N16(p) => n16::get_children(unsafe { p.as_ref() }, start, end),
            InnerNodeRef::N48(p) => n48::get_children(unsafe { p.as_ref() }, start, end),
            InnerNodeRef::N256(p) => n256::get_children(unsafe { p.as_ref() }, start, end),
        }
    }

    /// Copy every live `(key_byte, child)` pair, used by growth/shrink/compaction.
    pub(crate) fn all_children(self) -> Vec<(u8, ChildPtr)> {
        self.get_children(0, 255)
    }

    /// Recovery-only: a valid journal only means the crash landed somewhere
    /// between `journaled_store`'s journal write and its clear (step 3) — by
    /// the time the journal is observed valid, the new value's own store +
    /// flush (step 2) has always already happened, so the slot already
    /// durably holds the new value (and if it hadn't, the slot still holds
    /// the old value naturally, never having been touched). There is nothing
    /// to restore in either case; just clear the stale journal.
    ///
    /// # Safety
    /// Single-threaded recovery only, before any other access to this node.
    pub(crate) unsafe fn restore_journal(self) {
        let header = self.header();
        header.journal.store(0, Ordering::SeqCst);
        flush(&header.journal as *const _ as usize, 8);
        crate::pmem::fence();
    }
}

/// Allocate and durably initialize a new inner node of `ty`, per the growth
/// protocol's step 1-2 (spec §4.4): allocate, initialize, flush in full.
pub(crate) fn allocate_node(
    allocator: &dyn PmemAllocator,
    ty: NodeType,
    level: u32,
    prefix: Prefix,
) -> Result<InnerNodeRef, ArtError> {
    match ty {
        NodeType::N4 => n4::allocate(allocator, level, prefix).map(InnerNodeRef::N4),
        NodeType::N16 => n16::allocate(allocator, level, prefix).map(InnerNodeRef::N16),
        NodeType::N48 => n48::allocate(allocator, level, prefix).map(InnerNodeRef::N48),
        NodeType::N256 => n256::allocate(allocator, level, prefix).map(InnerNodeRef::N256),
    }
}

/// Size/align of the concrete struct for `ty`, needed by `free`.
pub(crate) fn layout_of(ty: NodeType) -> std::alloc::Layout {
    match ty {
        NodeType::N4 => std::alloc::Layout::new::<Node4>(),
        NodeType::N16 => std::alloc::Layout::new::<Node16>(),
        NodeType::N48 => std::alloc::Layout::new::<Node48>(),
        NodeType::N256 => std::alloc::Layout::new::<Node256>(),
    }
}

pub(crate) fn allocate_leaf(
    allocator: &dyn PmemAllocator,
    key: bytes::Bytes,
    value: bytes::Bytes,
) -> Result<NonNull<Leaf>, ArtError> {
    let layout = std::alloc::Layout::new::<Leaf>();
    let addr = allocator.alloc(layout.size(), layout.align())?;
    unsafe {
        let ptr = addr as *mut Leaf;
        ptr.write(Leaf::new(key, value));
        flush(addr, layout.size());
        crate::pmem::fence();
        Ok(NonNull::new_unchecked(ptr))
    }
}

pub(crate) fn leaf_layout() -> std::alloc::Layout {
    std::alloc::Layout::new::<Leaf>()
}
