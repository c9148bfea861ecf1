//! The tree: root-to-leaf optimistic-lock-coupling descent, insert's five
//! cases, remove's shrink/collapse orchestration, and the bounded range scan.
//!
//! Grounded on the teacher's `utils/art/art_impl.rs` (`Art`/`ArtInner`,
//! the `get_inner`/`insert_inner` shape, and the `parent`/`cur_pos`
//! descent bookkeeping used to reach back up a level for growth), completed
//! against spec §4.4/§4.6's growth/shrink/collapse state machine and five
//! insert cases, which the teacher's version left as `todo!()`.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::epoch::{self, Guard};

use crate::comparator::Comparator;
use crate::config::{ArtOptions, GrowthThresholds};
use crate::error::{ArtError, ArtResult, OptLockError, OptResult};
use crate::node::lock::ChildPtr;
use crate::node::prefix::{self, Prefix, PrefixMatch};
use crate::node::{
    allocate_leaf, allocate_node, layout_of, leaf_layout, InnerNodeRef, Leaf, NodeHeader,
    NodeType, ReadGuard, WriteGuard,
};
use crate::pmem::{flush, PmemAllocator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
}

/// Internal control-flow error for a single descent attempt: either restart
/// from the root (the universal response to any version mismatch or lost
/// CAS) or a genuine allocation failure, which propagates to the caller.
enum OpError {
    Restart,
    Alloc(ArtError),
}

impl From<OptLockError> for OpError {
    fn from(_: OptLockError) -> Self {
        OpError::Restart
    }
}

impl From<ArtError> for OpError {
    fn from(e: ArtError) -> Self {
        OpError::Alloc(e)
    }
}

fn inner_header_ptr(cp: ChildPtr) -> NonNull<NodeHeader> {
    unsafe { NonNull::new_unchecked(cp.addr() as *mut NodeHeader) }
}

/// The public index handle.
pub struct Art {
    inner: ArtInner,
}

impl Art {
    pub fn new(options: ArtOptions) -> Self {
        Self {
            inner: ArtInner::new(options),
        }
    }

    pub fn get(&self, key: &[u8]) -> ArtResult<Option<Bytes>> {
        self.inner.get(key)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> ArtResult<PutOutcome> {
        self.inner.put(key, value)
    }

    pub fn remove(&self, key: &[u8]) -> ArtResult<RemoveOutcome> {
        self.inner.remove(key)
    }

    pub fn range(&self, lo: &[u8], hi: &[u8], limit: usize) -> ArtResult<Vec<(Bytes, Bytes)>> {
        self.inner.range(lo, hi, limit)
    }
}

pub(crate) struct ArtInner {
    allocator: Arc<dyn PmemAllocator>,
    comparator: Box<dyn Comparator>,
    thresholds: GrowthThresholds,
}

unsafe impl Send for ArtInner {}
unsafe impl Sync for ArtInner {}

impl ArtInner {
    pub(crate) fn new(options: ArtOptions) -> Self {
        Self {
            allocator: options.allocator,
            comparator: options.comparator,
            thresholds: options.thresholds,
        }
    }

    fn root_raw(&self) -> u64 {
        self.allocator.root_slot().load(Ordering::SeqCst)
    }

    fn cas_root(&self, old: u64, new: u64) -> bool {
        self.allocator
            .root_slot()
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn free_leaf(&self, ptr: NonNull<Leaf>) {
        let layout = leaf_layout();
        unsafe {
            self.allocator
                .free(ptr.as_ptr() as usize, layout.size(), layout.align());
        }
    }

    fn free_node(&self, node: InnerNodeRef) {
        let layout = layout_of(node.header().node_type());
        unsafe {
            self.allocator.free(
                node.header_ptr().as_ptr() as usize,
                layout.size(),
                layout.align(),
            );
        }
    }

    /// Defer the free of a leaf that was (or may have been) reachable by a
    /// concurrent reader until every epoch active now has drained.
    fn retire_leaf(&self, guard: &Guard, ptr: *mut Leaf) {
        let allocator = self.allocator.clone();
        let layout = leaf_layout();
        let addr = ptr as usize;
        unsafe {
            guard.defer_unchecked(move || {
                allocator.free(addr, layout.size(), layout.align());
            });
        }
    }

    fn retire_node(&self, guard: &Guard, ty: NodeType, ptr: NonNull<NodeHeader>) {
        let allocator = self.allocator.clone();
        let layout = layout_of(ty);
        let addr = ptr.as_ptr() as usize;
        unsafe {
            guard.defer_unchecked(move || {
                allocator.free(addr, layout.size(), layout.align());
            });
        }
    }

    fn shrink_threshold_for(&self, ty: NodeType) -> Option<u16> {
        match ty {
            NodeType::N256 => Some(self.thresholds.n256_shrink_at),
            NodeType::N48 => Some(self.thresholds.n48_shrink_at),
            NodeType::N16 => Some(self.thresholds.n16_shrink_at),
            NodeType::N4 => None,
        }
    }

    /// Best-effort lock-free probe for any descendant leaf, used to
    /// reconstruct the bytes of a prefix longer than the 4 stored inline
    /// (spec §4.5's "optimistic" case) or to pick a representative leaf for
    /// a pessimistic recheck. Bounded to guard against a malformed tree.
    fn sample_leaf_from(start: ChildPtr) -> Option<ChildPtr> {
        let mut cur = start;
        for _ in 0..64 {
            if cur.is_null() {
                return None;
            }
            if cur.is_leaf() {
                return Some(cur);
            }
            let inner = unsafe { InnerNodeRef::from_header(inner_header_ptr(cur)) };
            let mut next = inner.get_any_child();
            if next.is_null() {
                next = inner.header().get_self_leaf();
                if next.is_null() {
                    return None;
                }
            }
            cur = next;
        }
        None
    }

    /// Recover the full (not just the 4 stored) bytes of `prefix`, which
    /// begins at absolute key position `depth`.
    fn reconstruct_full_prefix(depth: usize, prefix: &Prefix, sample_source: ChildPtr) -> Option<Vec<u8>> {
        let full_len = prefix.len as usize;
        if full_len <= crate::node::prefix::MAX_STORED_PREFIX_LEN {
            return Some(prefix.stored().to_vec());
        }
        let leaf_ptr = Self::sample_leaf_from(sample_source)?;
        let leaf = unsafe { &*(leaf_ptr.addr() as *const Leaf) };
        let lk = leaf.key();
        if depth + full_len > lk.len() {
            return None;
        }
        Some(lk[depth..depth + full_len].to_vec())
    }

    // ---------------------------------------------------------------- get

    pub(crate) fn get(&self, key: &[u8]) -> ArtResult<Option<Bytes>> {
        if key.is_empty() {
            return Err(ArtError::InvalidKey);
        }
        let _guard = epoch::pin();
        loop {
            match self.get_inner(key) {
                Ok(v) => return Ok(v),
                Err(_) => continue,
            }
        }
    }

    fn get_inner(&self, key: &[u8]) -> OptResult<Option<Bytes>> {
        let root_raw = self.root_raw();
        let root = ChildPtr(root_raw);
        if root.is_null() {
            return Ok(None);
        }
        if root.is_leaf() {
            let leaf = unsafe { &*(root.addr() as *const Leaf) };
            let found = if leaf.check_key(key) { Some(leaf.value()) } else { None };
            if self.root_raw() != root_raw {
                return Err(OptLockError::VersionMismatch);
            }
            return Ok(found);
        }

        let mut node = ReadGuard::acquire(inner_header_ptr(root))?;
        loop {
            let header = node.header();
            let depth = header.level();
            if depth > key.len() {
                node.check_version()?;
                return Ok(None);
            }
            let node_prefix = unsafe { header.prefix() };
            if let PrefixMatch::Mismatch { .. } = prefix::match_prefix(node_prefix, &key[depth..]) {
                node.check_version()?;
                return Ok(None);
            }

            let child_depth = depth + node_prefix.len as usize;
            if child_depth == key.len() {
                let self_leaf = header.get_self_leaf();
                node.check_version()?;
                if self_leaf.is_null() {
                    return Ok(None);
                }
                let leaf = unsafe { &*(self_leaf.addr() as *const Leaf) };
                return Ok(if leaf.check_key(key) { Some(leaf.value()) } else { None });
            }
            if child_depth > key.len() {
                node.check_version()?;
                return Ok(None);
            }

            let key_byte = key[child_depth];
            let inner_ref = unsafe { InnerNodeRef::from_header(node.ptr) };
            let child = inner_ref.get_child(key_byte);
            node.check_version()?;

            if child.is_null() {
                return Ok(None);
            }
            if child.is_leaf() {
                let leaf = unsafe { &*(child.addr() as *const Leaf) };
                let result = if leaf.check_key(key) { Some(leaf.value()) } else { None };
                node.check_version()?;
                return Ok(result);
            }

            let next = ReadGuard::acquire(inner_header_ptr(child))?;
            node.check_version()?;
            node = next;
        }
    }

    // ---------------------------------------------------------------- put

    pub(crate) fn put(&self, key: &[u8], value: &[u8]) -> ArtResult<PutOutcome> {
        if key.is_empty() {
            return Err(ArtError::InvalidKey);
        }
        let guard = epoch::pin();
        loop {
            match self.put_inner(key, value, &guard) {
                Ok(outcome) => return Ok(outcome),
                Err(OpError::Restart) => continue,
                Err(OpError::Alloc(e)) => return Err(e),
            }
        }
    }

    fn put_inner(&self, key: &[u8], value: &[u8], guard: &Guard) -> Result<PutOutcome, OpError> {
        let root_raw = self.root_raw();
        let root = ChildPtr(root_raw);

        if root.is_null() {
            let leaf = allocate_leaf(&*self.allocator, Bytes::copy_from_slice(key), Bytes::copy_from_slice(value))?;
            let new_root = ChildPtr::leaf(leaf.as_ptr() as usize);
            if self.cas_root(root_raw, new_root.0) {
                return Ok(PutOutcome::Inserted);
            }
            self.free_leaf(leaf);
            return Err(OpError::Restart);
        }

        if root.is_leaf() {
            return self.put_into_leaf_root(key, value, root, root_raw, guard);
        }

        self.put_into_tree(key, value, root, root_raw, guard)
    }

    fn put_into_leaf_root(
        &self,
        key: &[u8],
        value: &[u8],
        root: ChildPtr,
        root_raw: u64,
        guard: &Guard,
    ) -> Result<PutOutcome, OpError> {
        let leaf_ptr_raw = root.addr() as *mut Leaf;
        let leaf = unsafe { &*leaf_ptr_raw };

        if leaf.check_key(key) {
            if leaf.update_in_place(value) {
                if self.root_raw() != root_raw {
                    return Err(OpError::Restart);
                }
                return Ok(PutOutcome::Updated);
            }
            let new_leaf = allocate_leaf(&*self.allocator, Bytes::copy_from_slice(key), Bytes::copy_from_slice(value))?;
            let new_ptr = ChildPtr::leaf(new_leaf.as_ptr() as usize);
            if self.cas_root(root_raw, new_ptr.0) {
                self.retire_leaf(guard, leaf_ptr_raw);
                return Ok(PutOutcome::Updated);
            }
            self.free_leaf(new_leaf);
            return Err(OpError::Restart);
        }

        // Case (c) at the root: split the lone leaf and the new key into a
        // fresh N4, handling the case where one key is a byte-for-byte
        // prefix of the other via `self_leaf`.
        let common = leaf.prefix_matches(key, 0);
        let new_node = allocate_node(&*self.allocator, NodeType::N4, 0, Prefix::new(&key[..common.min(key.len())]))?;
        let new_leaf = match allocate_leaf(&*self.allocator, Bytes::copy_from_slice(key), Bytes::copy_from_slice(value)) {
            Ok(l) => l,
            Err(e) => {
                self.free_node(new_node);
                return Err(e.into());
            }
        };
        let new_leaf_ptr = ChildPtr::leaf(new_leaf.as_ptr() as usize);

        let old_len = leaf.key_len();
        let new_len = key.len();
        unsafe {
            if common < old_len && common < new_len {
                new_node.insert_child(leaf.key()[common], root);
                new_node.insert_child(key[common], new_leaf_ptr);
            } else if common >= old_len {
                new_node.header().set_self_leaf_journaled(root);
                new_node.insert_child(key[common], new_leaf_ptr);
            } else {
                new_node.header().set_self_leaf_journaled(new_leaf_ptr);
                new_node.insert_child(leaf.key()[common], root);
            }
        }

        let new_root = ChildPtr::inner(new_node.header_ptr().as_ptr() as usize);
        if self.cas_root(root_raw, new_root.0) {
            return Ok(PutOutcome::Inserted);
        }
        self.free_node(new_node);
        self.free_leaf(new_leaf);
        Err(OpError::Restart)
    }

    fn put_into_tree(
        &self,
        key: &[u8],
        value: &[u8],
        root: ChildPtr,
        root_raw: u64,
        guard: &Guard,
    ) -> Result<PutOutcome, OpError> {
        let mut parent: Option<ReadGuard> = None;
        let mut parent_key_byte: u8 = 0;
        let mut cur = ReadGuard::acquire(inner_header_ptr(root))?;
        let mut cur_is_root = true;

        loop {
            let header = cur.header();
            let depth = header.level();
            if depth > key.len() {
                cur.check_version()?;
                return Err(OpError::Restart);
            }
            let node_prefix = unsafe { header.prefix() };
            let pm = prefix::match_prefix(node_prefix, &key[depth..]);

            let mismatch_at = match pm {
                PrefixMatch::Match => None,
                PrefixMatch::Mismatch { at } => Some(at),
                PrefixMatch::Optimistic => {
                    match Self::sample_leaf_from(ChildPtr::inner(cur.ptr.as_ptr() as usize)) {
                        Some(sample) => {
                            let leaf = unsafe { &*(sample.addr() as *const Leaf) };
                            match prefix::match_prefix_pessimistic(node_prefix, depth, leaf.key(), key) {
                                PrefixMatch::Mismatch { at } => Some(at),
                                _ => None,
                            }
                        }
                        None => None,
                    }
                }
            };

            if let Some(at) = mismatch_at {
                return self.split_node(
                    key, value, parent, parent_key_byte, cur, cur_is_root, root_raw, depth, at, guard,
                );
            }

            let child_depth = depth + node_prefix.len as usize;

            if child_depth == key.len() {
                return self.put_self_leaf(key, value, cur, guard);
            }
            if child_depth > key.len() {
                cur.check_version()?;
                return Err(OpError::Restart);
            }

            let key_byte = key[child_depth];
            let inner_ref = unsafe { InnerNodeRef::from_header(cur.ptr) };
            let child = inner_ref.get_child(key_byte);
            cur.check_version()?;

            if child.is_null() {
                if inner_ref.is_full() {
                    self.grow_and_retry(parent, parent_key_byte, cur, root_raw, cur_is_root, guard)?;
                    return Err(OpError::Restart);
                }
                let cur_w = cur.upgrade().map_err(|(_, e)| e)?;
                let new_leaf = allocate_leaf(&*self.allocator, Bytes::copy_from_slice(key), Bytes::copy_from_slice(value))?;
                unsafe {
                    InnerNodeRef::from_header(cur_w.ptr).insert_child(key_byte, ChildPtr::leaf(new_leaf.as_ptr() as usize));
                }
                return Ok(PutOutcome::Inserted);
            }

            if child.is_leaf() {
                let leaf_ptr_raw = child.addr() as *mut Leaf;
                let existing = unsafe { &*leaf_ptr_raw };
                if existing.check_key(key) {
                    if existing.update_in_place(value) {
                        cur.check_version()?;
                        return Ok(PutOutcome::Updated);
                    }
                    let cur_w = cur.upgrade().map_err(|(_, e)| e)?;
                    let new_leaf = allocate_leaf(&*self.allocator, Bytes::copy_from_slice(key), Bytes::copy_from_slice(value))?;
                    unsafe {
                        InnerNodeRef::from_header(cur_w.ptr)
                            .change_child(key_byte, ChildPtr::leaf(new_leaf.as_ptr() as usize));
                    }
                    self.retire_leaf(guard, leaf_ptr_raw);
                    return Ok(PutOutcome::Updated);
                }
                let cur_w = cur.upgrade().map_err(|(_, e)| e)?;
                return self.split_leaf_child(key, value, &cur_w, key_byte, child, existing, child_depth);
            }

            let next = ReadGuard::acquire(inner_header_ptr(child))?;
            cur.check_version()?;
            if let Some(p) = parent.take() {
                p.unlock()?;
            }
            parent = Some(cur);
            parent_key_byte = key_byte;
            cur = next;
            cur_is_root = false;
        }
    }

    fn put_self_leaf(&self, key: &[u8], value: &[u8], cur: ReadGuard, guard: &Guard) -> Result<PutOutcome, OpError> {
        let header = cur.header();
        let self_leaf = header.get_self_leaf();
        cur.check_version()?;

        if self_leaf.is_null() {
            let cur_w = cur.upgrade().map_err(|(_, e)| e)?;
            let new_leaf = allocate_leaf(&*self.allocator, Bytes::copy_from_slice(key), Bytes::copy_from_slice(value))?;
            unsafe { cur_w.header().set_self_leaf_journaled(ChildPtr::leaf(new_leaf.as_ptr() as usize)) };
            return Ok(PutOutcome::Inserted);
        }

        let leaf_ptr_raw = self_leaf.addr() as *mut Leaf;
        let existing = unsafe { &*leaf_ptr_raw };
        if existing.update_in_place(value) {
            cur.check_version()?;
            return Ok(PutOutcome::Updated);
        }
        let cur_w = cur.upgrade().map_err(|(_, e)| e)?;
        let new_leaf = allocate_leaf(&*self.allocator, Bytes::copy_from_slice(key), Bytes::copy_from_slice(value))?;
        unsafe { cur_w.header().set_self_leaf_journaled(ChildPtr::leaf(new_leaf.as_ptr() as usize)) };
        self.retire_leaf(guard, leaf_ptr_raw);
        Ok(PutOutcome::Updated)
    }

    /// Case (c): `key_byte` names a leaf child of `cur_w` whose key differs
    /// from `key`. Split it into a fresh N4 holding both.
    fn split_leaf_child(
        &self,
        key: &[u8],
        value: &[u8],
        cur_w: &WriteGuard,
        key_byte: u8,
        old_child: ChildPtr,
        existing: &Leaf,
        child_depth: usize,
    ) -> Result<PutOutcome, OpError> {
        let common_start = child_depth + 1;
        let common = existing.prefix_matches(key, common_start);
        let new_level = common_start + common;

        let common_bytes = &key[common_start.min(key.len())..(common_start + common).min(key.len())];
        let new_node = allocate_node(&*self.allocator, NodeType::N4, common_start as u32, Prefix::new(common_bytes))?;
        let new_leaf = match allocate_leaf(&*self.allocator, Bytes::copy_from_slice(key), Bytes::copy_from_slice(value)) {
            Ok(l) => l,
            Err(e) => {
                self.free_node(new_node);
                return Err(e.into());
            }
        };
        let new_leaf_ptr = ChildPtr::leaf(new_leaf.as_ptr() as usize);

        let old_len = existing.key_len();
        let new_len = key.len();
        unsafe {
            if new_level < old_len && new_level < new_len {
                new_node.insert_child(existing.key()[new_level], old_child);
                new_node.insert_child(key[new_level], new_leaf_ptr);
            } else if new_level >= old_len {
                new_node.header().set_self_leaf_journaled(old_child);
                if new_level < new_len {
                    new_node.insert_child(key[new_level], new_leaf_ptr);
                }
            } else {
                new_node.header().set_self_leaf_journaled(new_leaf_ptr);
                new_node.insert_child(existing.key()[new_level], old_child);
            }
        }

        let new_inner_ptr = ChildPtr::inner(new_node.header_ptr().as_ptr() as usize);
        unsafe { InnerNodeRef::from_header(cur_w.ptr).change_child(key_byte, new_inner_ptr) };
        Ok(PutOutcome::Inserted)
    }

    /// Case (d): `cur`'s stored prefix diverges from `key` at offset `at`.
    /// Split `cur` by inserting a fresh N4 above it.
    #[allow(clippy::too_many_arguments)]
    fn split_node(
        &self,
        key: &[u8],
        value: &[u8],
        parent: Option<ReadGuard>,
        parent_key_byte: u8,
        cur: ReadGuard,
        cur_is_root: bool,
        root_raw: u64,
        depth: usize,
        at: usize,
        guard: &Guard,
    ) -> Result<PutOutcome, OpError> {
        let _ = guard;
        let cur_w = cur.upgrade().map_err(|(_, e)| e)?;
        let full_prefix = unsafe { *cur_w.header().prefix() };
        let full_bytes = Self::reconstruct_full_prefix(depth, &full_prefix, ChildPtr::inner(cur_w.ptr.as_ptr() as usize))
            .ok_or(OpError::Restart)?;
        if at >= full_bytes.len() {
            return Err(OpError::Restart);
        }
        let old_byte = full_bytes[at];
        let remaining_old = full_bytes[at + 1..].to_vec();
        let common_bytes = &key[depth..(depth + at).min(key.len())];

        let new_node = allocate_node(&*self.allocator, NodeType::N4, depth as u32, Prefix::new(common_bytes))?;

        let new_key_end = depth + at;
        let new_leaf = match allocate_leaf(&*self.allocator, Bytes::copy_from_slice(key), Bytes::copy_from_slice(value)) {
            Ok(l) => l,
            Err(e) => {
                self.free_node(new_node);
                return Err(e.into());
            }
        };
        let new_leaf_ptr = ChildPtr::leaf(new_leaf.as_ptr() as usize);

        unsafe {
            cur_w.header().set_level((new_key_end + 1) as u32);
            cur_w.header().set_prefix(Prefix::new(&remaining_old));
        }
        let old_ptr = ChildPtr::inner(cur_w.ptr.as_ptr() as usize);

        unsafe {
            if new_key_end < key.len() {
                new_node.insert_child(old_byte, old_ptr);
                new_node.insert_child(key[new_key_end], new_leaf_ptr);
            } else {
                new_node.header().set_self_leaf_journaled(new_leaf_ptr);
                new_node.insert_child(old_byte, old_ptr);
            }
        }

        let new_inner_ptr = ChildPtr::inner(new_node.header_ptr().as_ptr() as usize);
        match parent {
            Some(parent_guard) => {
                let parent_w = parent_guard.upgrade().map_err(|(_, e)| e)?;
                unsafe { InnerNodeRef::from_header(parent_w.ptr).change_child(parent_key_byte, new_inner_ptr) };
            }
            None => {
                debug_assert!(cur_is_root);
                if !self.cas_root(root_raw, new_inner_ptr.0) {
                    self.free_node(new_node);
                    self.free_leaf(new_leaf);
                    return Err(OpError::Restart);
                }
            }
        }

        Ok(PutOutcome::Inserted)
    }

    fn grow_and_retry(
        &self,
        parent: Option<ReadGuard>,
        parent_key_byte: u8,
        cur: ReadGuard,
        root_raw: u64,
        cur_is_root: bool,
        guard: &Guard,
    ) -> Result<(), OpError> {
        let cur_ty = cur.header().node_type();
        let new_ty = cur_ty.grows_to().expect("is_full implies a larger variant exists");

        match parent {
            Some(parent_guard) => {
                let parent_w = parent_guard.upgrade().map_err(|(_, e)| e)?;
                let cur_w = cur.upgrade().map_err(|(_, e)| e)?;
                self.resize_locked(&parent_w, parent_key_byte, cur_w, cur_ty, new_ty, guard)
            }
            None => {
                debug_assert!(cur_is_root);
                let cur_w = cur.upgrade().map_err(|(_, e)| e)?;
                self.resize_root(root_raw, cur_w, cur_ty, new_ty, guard)
            }
        }
    }

    /// Common body of growth, shrink, and in-place compaction: allocate a
    /// node of `new_ty`, copy every live child plus `self_leaf`, publish it
    /// in the parent's slot, and retire the old node (spec §4.4 steps 1-5).
    fn resize_locked(
        &self,
        parent_w: &WriteGuard,
        parent_key_byte: u8,
        cur_w: WriteGuard,
        cur_ty: NodeType,
        new_ty: NodeType,
        guard: &Guard,
    ) -> Result<(), OpError> {
        let new_node = self.build_resized(&cur_w, new_ty)?;
        let new_ptr = ChildPtr::inner(new_node.header_ptr().as_ptr() as usize);
        unsafe { InnerNodeRef::from_header(parent_w.ptr).change_child(parent_key_byte, new_ptr) };

        let cur_ptr = cur_w.ptr;
        cur_w.mark_obsolete_and_forget();
        self.retire_node(guard, cur_ty, cur_ptr);
        Ok(())
    }

    fn resize_root(
        &self,
        root_raw: u64,
        cur_w: WriteGuard,
        cur_ty: NodeType,
        new_ty: NodeType,
        guard: &Guard,
    ) -> Result<(), OpError> {
        let new_node = self.build_resized(&cur_w, new_ty)?;
        let new_ptr = ChildPtr::inner(new_node.header_ptr().as_ptr() as usize);

        if !self.cas_root(root_raw, new_ptr.0) {
            self.free_node(new_node);
            return Err(OpError::Restart);
        }

        let cur_ptr = cur_w.ptr;
        cur_w.mark_obsolete_and_forget();
        self.retire_node(guard, cur_ty, cur_ptr);
        Ok(())
    }

    fn build_resized(&self, cur_w: &WriteGuard, new_ty: NodeType) -> Result<InnerNodeRef, OpError> {
        let header = cur_w.header();
        let level = header.level() as u32;
        let prefix = unsafe { *header.prefix() };
        let new_node = allocate_node(&*self.allocator, new_ty, level, prefix)?;
        for (byte, child) in unsafe { InnerNodeRef::from_header(cur_w.ptr) }.all_children() {
            unsafe { new_node.insert_child(byte, child) };
        }
        let self_leaf = header.get_self_leaf();
        if !self_leaf.is_null() {
            unsafe { new_node.header().set_self_leaf_journaled(self_leaf) };
        }
        let layout = layout_of(new_ty);
        flush(new_node.header_ptr().as_ptr() as usize, layout.size());
        crate::pmem::fence();
        Ok(new_node)
    }

    // ------------------------------------------------------------- remove

    pub(crate) fn remove(&self, key: &[u8]) -> ArtResult<RemoveOutcome> {
        if key.is_empty() {
            return Err(ArtError::InvalidKey);
        }
        let guard = epoch::pin();
        loop {
            match self.remove_inner(key, &guard) {
                Ok(outcome) => return Ok(outcome),
                Err(OpError::Restart) => continue,
                Err(OpError::Alloc(e)) => return Err(e),
            }
        }
    }

    fn remove_inner(&self, key: &[u8], guard: &Guard) -> Result<RemoveOutcome, OpError> {
        let root_raw = self.root_raw();
        let root = ChildPtr(root_raw);
        if root.is_null() {
            return Ok(RemoveOutcome::NotFound);
        }
        if root.is_leaf() {
            let leaf = unsafe { &*(root.addr() as *const Leaf) };
            if !leaf.check_key(key) {
                if self.root_raw() != root_raw {
                    return Err(OpError::Restart);
                }
                return Ok(RemoveOutcome::NotFound);
            }
            if !self.cas_root(root_raw, ChildPtr::NULL.0) {
                return Err(OpError::Restart);
            }
            self.retire_leaf(guard, root.addr() as *mut Leaf);
            return Ok(RemoveOutcome::Removed);
        }

        let mut parent: Option<ReadGuard> = None;
        let mut parent_key_byte: u8 = 0;
        let mut cur = ReadGuard::acquire(inner_header_ptr(root))?;
        let mut cur_is_root = true;

        loop {
            let header = cur.header();
            let depth = header.level();
            if depth > key.len() {
                cur.check_version()?;
                return Ok(RemoveOutcome::NotFound);
            }
            let node_prefix = unsafe { header.prefix() };
            if let PrefixMatch::Mismatch { .. } = prefix::match_prefix(node_prefix, &key[depth..]) {
                cur.check_version()?;
                return Ok(RemoveOutcome::NotFound);
            }

            let child_depth = depth + node_prefix.len as usize;
            if child_depth == key.len() {
                let self_leaf = header.get_self_leaf();
                cur.check_version()?;
                if self_leaf.is_null() {
                    return Ok(RemoveOutcome::NotFound);
                }
                let leaf = unsafe { &*(self_leaf.addr() as *const Leaf) };
                if !leaf.check_key(key) {
                    return Ok(RemoveOutcome::NotFound);
                }
                let cur_w = cur.upgrade().map_err(|(_, e)| e)?;
                unsafe { cur_w.header().set_self_leaf_journaled(ChildPtr::NULL) };
                self.retire_leaf(guard, self_leaf.addr() as *mut Leaf);
                return Ok(RemoveOutcome::Removed);
            }
            if child_depth > key.len() {
                cur.check_version()?;
                return Ok(RemoveOutcome::NotFound);
            }

            let key_byte = key[child_depth];
            let inner_ref = unsafe { InnerNodeRef::from_header(cur.ptr) };
            let child = inner_ref.get_child(key_byte);
            cur.check_version()?;

            if child.is_null() {
                return Ok(RemoveOutcome::NotFound);
            }

            if child.is_leaf() {
                let leaf = unsafe { &*(child.addr() as *const Leaf) };
                if !leaf.check_key(key) {
                    cur.check_version()?;
                    return Ok(RemoveOutcome::NotFound);
                }
                return self.remove_leaf_child(
                    key_byte, child, parent, parent_key_byte, cur, cur_is_root, root_raw, guard,
                );
            }

            let next = ReadGuard::acquire(inner_header_ptr(child))?;
            cur.check_version()?;
            if let Some(p) = parent.take() {
                p.unlock()?;
            }
            parent = Some(cur);
            parent_key_byte = key_byte;
            cur = next;
            cur_is_root = false;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn remove_leaf_child(
        &self,
        key_byte: u8,
        leaf_child: ChildPtr,
        parent: Option<ReadGuard>,
        parent_key_byte: u8,
        cur: ReadGuard,
        cur_is_root: bool,
        root_raw: u64,
        guard: &Guard,
    ) -> Result<RemoveOutcome, OpError> {
        let cur_w = cur.upgrade().map_err(|(_, e)| e)?;
        let cur_ty = cur_w.header().node_type();
        unsafe { InnerNodeRef::from_header(cur_w.ptr).remove_child(key_byte) };
        self.retire_leaf(guard, leaf_child.addr() as *mut Leaf);

        let count_after = cur_w.header().count();

        // A `self_leaf` doesn't count toward `count` (only indexed children
        // do), so an N4 with one indexed child left may still carry a
        // reachable self_leaf; collapsing it would drop that leaf on the
        // floor. Only collapse when there is truly nothing else here.
        if cur_ty == NodeType::N4 && count_after == 1 && cur_w.header().get_self_leaf().is_null() {
            if let Some((child_byte, remaining)) =
                unsafe { InnerNodeRef::from_header(cur_w.ptr) }.all_children().into_iter().next()
            {
                return self.collapse(
                    parent, parent_key_byte, cur_w, child_byte, remaining, cur_is_root, root_raw, guard,
                );
            }
            return Ok(RemoveOutcome::Removed);
        }

        if let Some(threshold) = self.shrink_threshold_for(cur_ty) {
            if count_after <= threshold {
                if let Some(smaller_ty) = cur_ty.shrinks_to() {
                    match parent {
                        Some(parent_guard) => {
                            let parent_w = parent_guard.upgrade().map_err(|(_, e)| e)?;
                            self.resize_locked(&parent_w, parent_key_byte, cur_w, cur_ty, smaller_ty, guard)?;
                        }
                        None => {
                            self.resize_root(root_raw, cur_w, cur_ty, smaller_ty, guard)?;
                        }
                    }
                    return Ok(RemoveOutcome::Removed);
                }
            }
        }

        // Not shrinking: compact in place once fragmentation (dead slots
        // left behind by prior removes) crosses the configured factor.
        if cur_w.header().compact_count() as u32 > self.thresholds.compaction_factor as u32 * count_after as u32 {
            match parent {
                Some(parent_guard) => {
                    let parent_w = parent_guard.upgrade().map_err(|(_, e)| e)?;
                    self.resize_locked(&parent_w, parent_key_byte, cur_w, cur_ty, cur_ty, guard)?;
                }
                None => {
                    self.resize_root(root_raw, cur_w, cur_ty, cur_ty, guard)?;
                }
            }
        }

        Ok(RemoveOutcome::Removed)
    }

    /// `cur_w` (an N4) has exactly one live child left: promote it into
    /// `cur_w`'s slot in its parent, merging prefixes (spec §4.4).
    #[allow(clippy::too_many_arguments)]
    fn collapse(
        &self,
        parent: Option<ReadGuard>,
        parent_key_byte: u8,
        cur_w: WriteGuard,
        child_byte: u8,
        child: ChildPtr,
        cur_is_root: bool,
        root_raw: u64,
        guard: &Guard,
    ) -> Result<RemoveOutcome, OpError> {
        let cur_level = cur_w.header().level() as u32;
        let cur_prefix = unsafe { *cur_w.header().prefix() };
        let cur_full = Self::reconstruct_full_prefix(
            cur_level as usize,
            &cur_prefix,
            ChildPtr::inner(cur_w.ptr.as_ptr() as usize),
        )
        .ok_or(OpError::Restart)?;

        let mut merged = cur_full;
        merged.push(child_byte);

        let child_w = if child.is_leaf() {
            None
        } else {
            let child_read = ReadGuard::acquire(inner_header_ptr(child))?;
            let child_w = child_read.upgrade().map_err(|(_, e)| e)?;
            let child_prefix = unsafe { *child_w.header().prefix() };
            let child_full = Self::reconstruct_full_prefix(cur_level as usize + 1, &child_prefix, child)
                .ok_or(OpError::Restart)?;
            merged.extend_from_slice(&child_full);
            Some(child_w)
        };

        match parent {
            Some(parent_guard) => {
                let parent_w = parent_guard.upgrade().map_err(|(_, e)| e)?;
                unsafe { InnerNodeRef::from_header(parent_w.ptr).change_child(parent_key_byte, child) };
            }
            None => {
                debug_assert!(cur_is_root);
                if !self.cas_root(root_raw, child.0) {
                    return Err(OpError::Restart);
                }
            }
        }

        if let Some(child_w) = child_w {
            unsafe {
                child_w.header().set_level(cur_level);
                child_w.header().set_prefix(Prefix::new(&merged));
            }
        }

        let cur_ty = cur_w.header().node_type();
        let cur_ptr = cur_w.ptr;
        cur_w.mark_obsolete_and_forget();
        self.retire_node(guard, cur_ty, cur_ptr);

        Ok(RemoveOutcome::Removed)
    }

    // -------------------------------------------------------------- range

    pub(crate) fn range(&self, lo: &[u8], hi: &[u8], limit: usize) -> ArtResult<Vec<(Bytes, Bytes)>> {
        if lo.is_empty() || hi.is_empty() {
            return Err(ArtError::InvalidKey);
        }
        if limit == 0 || self.comparator.compare(lo, hi) == std::cmp::Ordering::Greater {
            return Ok(Vec::new());
        }
        let _guard = epoch::pin();
        loop {
            let mut out = Vec::new();
            match self.range_inner(lo, hi, limit, &mut out) {
                Ok(()) => return Ok(out),
                Err(_) => continue,
            }
        }
    }

    fn in_range(&self, key: &[u8], lo: &[u8], hi: &[u8]) -> bool {
        self.comparator.compare(key, lo) != std::cmp::Ordering::Less
            && self.comparator.compare(key, hi) != std::cmp::Ordering::Greater
    }

    fn range_inner(&self, lo: &[u8], hi: &[u8], limit: usize, out: &mut Vec<(Bytes, Bytes)>) -> OptResult<()> {
        let root = ChildPtr(self.root_raw());
        if root.is_null() {
            return Ok(());
        }
        if root.is_leaf() {
            let leaf = unsafe { &*(root.addr() as *const Leaf) };
            if self.in_range(leaf.key(), lo, hi) {
                out.push((Bytes::copy_from_slice(leaf.key()), leaf.value()));
            }
            return Ok(());
        }
        let node = ReadGuard::acquire(inner_header_ptr(root))?;
        self.scan_node(node, lo, hi, limit, out)
    }

    fn scan_node(&self, node: ReadGuard, lo: &[u8], hi: &[u8], limit: usize, out: &mut Vec<(Bytes, Bytes)>) -> OptResult<()> {
        if out.len() >= limit {
            return node.unlock();
        }
        let header = node.header();
        let depth = header.level();

        let self_leaf = header.get_self_leaf();
        if !self_leaf.is_null() {
            let leaf = unsafe { &*(self_leaf.addr() as *const Leaf) };
            if self.in_range(leaf.key(), lo, hi) {
                out.push((Bytes::copy_from_slice(leaf.key()), leaf.value()));
            }
        }

        let start = lo.get(depth).copied().unwrap_or(0);
        let end = hi.get(depth).copied().unwrap_or(255);
        let inner_ref = unsafe { InnerNodeRef::from_header(node.ptr) };
        let children = inner_ref.get_children(start, end);
        node.check_version()?;

        for (_, child) in children {
            if out.len() >= limit {
                break;
            }
            if child.is_leaf() {
                let leaf = unsafe { &*(child.addr() as *const Leaf) };
                if self.in_range(leaf.key(), lo, hi) {
                    out.push((Bytes::copy_from_slice(leaf.key()), leaf.value()));
                }
            } else {
                let child_guard = ReadGuard::acquire(inner_header_ptr(child))?;
                self.scan_node(child_guard, lo, hi, limit, out)?;
            }
        }
        node.unlock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::HeapPmem;
    use std::sync::Arc as StdArc;

    fn new_art() -> Art {
        Art::new(ArtOptions::new(StdArc::new(HeapPmem::new())))
    }

    #[test]
    fn put_then_get_round_trips() {
        let art = new_art();
        assert_eq!(art.put(b"apple", b"1").unwrap(), PutOutcome::Inserted);
        assert_eq!(art.put(b"apricot", b"2").unwrap(), PutOutcome::Inserted);
        assert_eq!(art.get(b"apple").unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(art.get(b"apricot").unwrap().as_deref(), Some(&b"2"[..]));
        assert_eq!(art.get(b"app").unwrap(), None);
    }

    #[test]
    fn update_overwrites_value() {
        let art = new_art();
        art.put(b"k", b"v1").unwrap();
        assert_eq!(art.put(b"k", b"v2").unwrap(), PutOutcome::Updated);
        assert_eq!(art.get(b"k").unwrap().as_deref(), Some(&b"v2"[..]));
    }

    #[test]
    fn update_with_different_length_value() {
        let art = new_art();
        art.put(b"k", b"v").unwrap();
        assert_eq!(art.put(b"k", b"much-longer-value").unwrap(), PutOutcome::Updated);
        assert_eq!(art.get(b"k").unwrap().as_deref(), Some(&b"much-longer-value"[..]));
    }

    #[test]
    fn remove_then_get_misses() {
        let art = new_art();
        art.put(b"k", b"v").unwrap();
        assert_eq!(art.remove(b"k").unwrap(), RemoveOutcome::Removed);
        assert_eq!(art.get(b"k").unwrap(), None);
        assert_eq!(art.remove(b"k").unwrap(), RemoveOutcome::NotFound);
    }

    #[test]
    fn prefix_of_another_key_uses_self_leaf() {
        let art = new_art();
        art.put(b"apple", b"1").unwrap();
        art.put(b"app", b"2").unwrap();
        assert_eq!(art.get(b"apple").unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(art.get(b"app").unwrap().as_deref(), Some(&b"2"[..]));
        assert_eq!(art.remove(b"app").unwrap(), RemoveOutcome::Removed);
        assert_eq!(art.get(b"app").unwrap(), None);
        assert_eq!(art.get(b"apple").unwrap().as_deref(), Some(&b"1"[..]));
    }

    #[test]
    fn n4_fills_then_grows_to_n16() {
        let art = new_art();
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4"), ("e", "5")] {
            assert_eq!(art.put(k.as_bytes(), v.as_bytes()).unwrap(), PutOutcome::Inserted);
        }
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4"), ("e", "5")] {
            assert_eq!(art.get(k.as_bytes()).unwrap().as_deref(), Some(v.as_bytes()));
        }
    }

    #[test]
    fn all_single_byte_keys_grow_to_n256_and_shrink_back() {
        let art = new_art();
        for b in 0u8..=255 {
            art.put(&[b], &[b]).unwrap();
        }
        for b in 0u8..=255 {
            assert_eq!(art.get(&[b]).unwrap().as_deref(), Some(&[b][..]));
        }
        for b in 0u8..=254 {
            assert_eq!(art.remove(&[b]).unwrap(), RemoveOutcome::Removed);
        }
        assert_eq!(art.get(&[255]).unwrap().as_deref(), Some(&[255][..]));
        for b in 0u8..=254 {
            assert_eq!(art.get(&[b]).unwrap(), None);
        }
    }

    #[test]
    fn range_scans_bounded_and_ordered() {
        let art = new_art();
        for k in ["a", "b", "c", "d", "e"] {
            art.put(k.as_bytes(), k.as_bytes()).unwrap();
        }
        let got = art.range(b"b", b"d", 10).unwrap();
        let keys: Vec<_> = got.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![Bytes::from_static(b"b"), Bytes::from_static(b"c"), Bytes::from_static(b"d")]);
    }

    #[test]
    fn range_respects_limit() {
        let art = new_art();
        for k in ["a", "b", "c", "d", "e"] {
            art.put(k.as_bytes(), k.as_bytes()).unwrap();
        }
        let got = art.range(b"a", b"e", 2).unwrap();
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn empty_key_is_rejected() {
        let art = new_art();
        assert!(matches!(art.put(b"", b"v"), Err(ArtError::InvalidKey)));
        assert!(matches!(art.get(b""), Err(ArtError::InvalidKey)));
        assert!(matches!(art.remove(b""), Err(ArtError::InvalidKey)));
    }

    #[test]
    fn concurrent_random_put_get_remove_stays_consistent() {
        use rand::Rng;
        use std::sync::Arc;
        use std::thread;

        let art = Arc::new(new_art());
        const THREADS: usize = 8;
        const OPS_PER_THREAD: usize = 2_000;
        const KEY_SPACE: u32 = 500;

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let art = Arc::clone(&art);
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..OPS_PER_THREAD {
                        let k = rng.gen_range(0..KEY_SPACE).to_be_bytes();
                        match rng.gen_range(0..3) {
                            0 => {
                                art.put(&k, &k).unwrap();
                            }
                            1 => {
                                if let Some(v) = art.get(&k).unwrap() {
                                    assert_eq!(v.as_ref(), &k);
                                }
                            }
                            _ => {
                                art.remove(&k).unwrap();
                            }
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        // Every surviving key must still map to itself: no torn or cross-wired value.
        for k in 0u32..KEY_SPACE {
            let key = k.to_be_bytes();
            if let Some(v) = art.get(&key).unwrap() {
                assert_eq!(v.as_ref(), &key);
            }
        }
    }
}
