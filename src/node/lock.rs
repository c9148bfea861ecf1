//! The type-version-lock-obsolete word (optimistic lock coupling) and the
//! tagged child pointer / old-pointer journal words that sit beside it on
//! every inner node.
//!
//! Grounded on `utils/opt_lock.rs`'s `OptLock` (the `mark_lock`/unlock-by-add
//! trick) and `original_source/ART/N.h` / `N4.cpp` for the bit layout.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{OptLockError, OptResult};
use crate::node::NodeType;

const OBSOLETE_BIT: u64 = 1 << 0;
const LOCKED_BIT: u64 = 1 << 1;
/// Unlocking is `fetch_add(VERSION_UNIT)`: if the lock bit (bit 1) is set,
/// adding `0b10` carries it into bit 2, clearing the lock and bumping the
/// version in one atomic op. Locking is the same add from the unlocked side.
const VERSION_UNIT: u64 = 0b10;
const TYPE_SHIFT: u32 = 61;
const TYPE_MASK: u64 = 0b111 << TYPE_SHIFT;

#[inline]
fn is_locked(v: u64) -> bool {
    v & LOCKED_BIT != 0
}

#[inline]
fn is_obsolete(v: u64) -> bool {
    v & OBSOLETE_BIT != 0
}

#[inline]
fn node_type_of(v: u64) -> NodeType {
    NodeType::from_tag(((v & TYPE_MASK) >> TYPE_SHIFT) as u8)
}

/// `| 3b type | 59b version | 1b lock | 1b obsolete |`, least-significant bit first.
#[derive(Debug)]
pub(crate) struct VersionLock(AtomicU64);

impl VersionLock {
    pub(crate) fn new(node_type: NodeType) -> Self {
        let raw = VERSION_UNIT | ((node_type.tag() as u64) << TYPE_SHIFT);
        Self(AtomicU64::new(raw))
    }

    #[inline]
    pub(crate) fn read_version(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Read a version, failing if the node is currently locked or obsolete.
    pub(crate) fn read_valid(&self) -> OptResult<u64> {
        let v = self.read_version();
        if is_locked(v) {
            return Err(OptLockError::Locked);
        }
        if is_obsolete(v) {
            return Err(OptLockError::Obsolete);
        }
        Ok(v)
    }

    pub(crate) fn node_type(&self) -> NodeType {
        node_type_of(self.read_version())
    }

    /// Re-validate that the version observed at `start` is still current.
    pub(crate) fn check_or_restart(&self, start: u64) -> OptResult<()> {
        if self.read_version() == start {
            Ok(())
        } else {
            Err(OptLockError::VersionMismatch)
        }
    }

    /// CAS from an observed unlocked version to the locked version.
    pub(crate) fn lock_version_or_restart(&self, start: u64) -> OptResult<()> {
        self.0
            .compare_exchange(
                start,
                start + VERSION_UNIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .map(|_| ())
            .map_err(|_| OptLockError::VersionMismatch)
    }

    /// Lock from scratch: read a valid version then try to acquire it.
    pub(crate) fn write_lock_or_restart(&self) -> OptResult<()> {
        let v = self.read_valid()?;
        self.lock_version_or_restart(v)
    }

    /// Clears the lock bit and bumps the version. Caller must already hold the lock.
    pub(crate) fn write_unlock(&self) {
        self.0.fetch_add(VERSION_UNIT, Ordering::Release);
    }

    /// As `write_unlock`, additionally marking the node obsolete.
    pub(crate) fn write_unlock_obsolete(&self) {
        self.0.fetch_add(VERSION_UNIT | OBSOLETE_BIT, Ordering::Release);
    }

    /// Post-crash reset: clear the locked/obsolete bits and restart the
    /// version counter, keeping the type tag (spec §4.7). Only valid
    /// single-threaded, before any reader or writer can observe the node.
    pub(crate) fn reset_for_recovery(&self) {
        let type_bits = self.read_version() & TYPE_MASK;
        self.0.store(type_bits | VERSION_UNIT, Ordering::SeqCst);
    }
}

/// A child slot as stored on durable media: `| 3b unused | 1b dirty (bit 60) | ... | 47b addr | 1b leaf tag |`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChildPtr(pub(crate) u64);

const CP_LEAF_BIT: u64 = 1 << 0;
const CP_DIRTY_BIT: u64 = 1 << 60;
const CP_ADDR_SHIFT: u32 = 1;
const CP_ADDR_BITS: u32 = 47;
const CP_ADDR_MASK: u64 = (1u64 << CP_ADDR_BITS) - 1;

impl ChildPtr {
    pub(crate) const NULL: ChildPtr = ChildPtr(0);

    pub(crate) fn inner(addr: usize) -> Self {
        debug_assert!((addr as u64) <= CP_ADDR_MASK, "durable address exceeds 47 bits");
        ChildPtr((addr as u64) << CP_ADDR_SHIFT)
    }

    pub(crate) fn leaf(addr: usize) -> Self {
        debug_assert!((addr as u64) <= CP_ADDR_MASK, "durable address exceeds 47 bits");
        ChildPtr(((addr as u64) << CP_ADDR_SHIFT) | CP_LEAF_BIT)
    }

    pub(crate) fn is_null(self) -> bool {
        (self.0 & !CP_DIRTY_BIT) == 0
    }

    pub(crate) fn is_leaf(self) -> bool {
        self.0 & CP_LEAF_BIT != 0
    }

    pub(crate) fn is_dirty(self) -> bool {
        self.0 & CP_DIRTY_BIT != 0
    }

    pub(crate) fn set_dirty(self) -> Self {
        ChildPtr(self.0 | CP_DIRTY_BIT)
    }

    pub(crate) fn clear_dirty(self) -> Self {
        ChildPtr(self.0 & !CP_DIRTY_BIT)
    }

    pub(crate) fn addr(self) -> usize {
        ((self.0 >> CP_ADDR_SHIFT) & CP_ADDR_MASK) as usize
    }

    /// Low 48 bits: leaf tag plus shifted address, the portion the journal records.
    fn journal_bits(self) -> u64 {
        self.0 & ((1u64 << 48) - 1)
    }

    fn from_journal_bits(bits: u64) -> Self {
        ChildPtr(bits)
    }
}

/// The per-node old-pointer journal: `| 1b VALID (56) | 8b slot index (48-55) | 48b previous child pointer |`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Journal(u64);

const J_VALID_BIT: u64 = 1 << 56;
const J_INDEX_SHIFT: u32 = 48;
const J_INDEX_MASK: u64 = 0xFF;

impl Journal {
    pub(crate) const EMPTY: Journal = Journal(0);

    pub(crate) fn new(slot: u8, previous: ChildPtr) -> Self {
        Journal(J_VALID_BIT | ((slot as u64) << J_INDEX_SHIFT) | previous.journal_bits())
    }

    pub(crate) fn is_valid(self) -> bool {
        self.0 & J_VALID_BIT != 0
    }

    pub(crate) fn slot_index(self) -> u8 {
        ((self.0 >> J_INDEX_SHIFT) & J_INDEX_MASK) as u8
    }

    pub(crate) fn previous(self) -> ChildPtr {
        ChildPtr::from_journal_bits(self.0 & ((1u64 << 48) - 1))
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        Journal(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_word_round_trip() {
        let lock = VersionLock::new(NodeType::N16);
        assert_eq!(lock.node_type(), NodeType::N16);
        let v = lock.read_valid().unwrap();
        lock.write_lock_or_restart()
            .map_err(|_| ())
            .unwrap_or_else(|_| panic!("first lock must succeed"));
        // still-typed after locking
        assert_eq!(lock.node_type(), NodeType::N16);
        assert!(lock.read_valid().is_err());
        lock.write_unlock();
        assert_eq!(lock.read_version(), v + VERSION_UNIT);
    }

    #[test]
    fn contended_lock_fails() {
        let lock = VersionLock::new(NodeType::N4);
        lock.write_lock_or_restart().unwrap();
        assert!(matches!(
            lock.write_lock_or_restart(),
            Err(OptLockError::Locked)
        ));
    }

    #[test]
    fn obsolete_after_unlock_obsolete() {
        let lock = VersionLock::new(NodeType::N4);
        lock.write_lock_or_restart().unwrap();
        lock.write_unlock_obsolete();
        assert!(matches!(
            lock.read_valid(),
            Err(OptLockError::Obsolete)
        ));
    }

    #[test]
    fn child_ptr_tagging() {
        let p = ChildPtr::leaf(0x1000);
        assert!(p.is_leaf());
        assert!(!p.is_null());
        assert_eq!(p.addr(), 0x1000);

        let dirty = p.set_dirty();
        assert!(dirty.is_dirty());
        assert_eq!(dirty.addr(), 0x1000);
        assert!(dirty.is_leaf());
        assert!(!dirty.clear_dirty().is_dirty());
    }

    #[test]
    fn journal_round_trip() {
        let old = ChildPtr::inner(0x4242);
        let j = Journal::new(7, old);
        assert!(j.is_valid());
        assert_eq!(j.slot_index(), 7);
        assert_eq!(j.previous(), old);

        assert!(!Journal::EMPTY.is_valid());
    }
}
