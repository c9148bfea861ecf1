//! Durable leaf record.
//!
//! Grounded on `original_source/ART/N.h`'s `Leaf` (`key_len`, `val_len`,
//! `checkKey`, `getFingerPrint`) and the teacher's `utils/art/node.rs::LeafNode`,
//! widened to carry an actual value buffer (the teacher's stub only held a key).

use std::cell::UnsafeCell;

use bytes::Bytes;

use crate::pmem::{flush, fence};

/// A durable key/value record. Leaves are immutable except for the
/// equal-length in-place value update described in spec §4.3; any
/// length-changing update allocates a fresh `Leaf` and swaps the parent slot.
///
/// The value buffer is `UnsafeCell`-wrapped so an equal-length update can
/// overwrite it in place without taking any lock, per spec §4.3/§5: updates
/// never change the buffer's length, so a concurrent reader always sees a
/// validly-sized (if possibly torn) byte sequence, and identity is verified
/// under the parent's version before the read is trusted.
pub(crate) struct Leaf {
    key: Bytes,
    value: UnsafeCell<Box<[u8]>>,
}

// SAFETY: concurrent writers to `value` only ever replace bytes of the same
// length, and readers only trust the content after re-validating the
// parent's version, matching the contract in spec §5's "Shared resources".
unsafe impl Sync for Leaf {}
unsafe impl Send for Leaf {}

impl Leaf {
    pub(crate) fn new(key: Bytes, value: Bytes) -> Self {
        Self {
            key,
            value: UnsafeCell::new(value.to_vec().into_boxed_slice()),
        }
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.key
    }

    pub(crate) fn value(&self) -> Bytes {
        // SAFETY: length is immutable for the lifetime of the leaf; content
        // may be concurrently updated in place but never torn in length.
        Bytes::copy_from_slice(unsafe { &*self.value.get() })
    }

    pub(crate) fn key_len(&self) -> usize {
        self.key.len()
    }

    pub(crate) fn value_len(&self) -> usize {
        unsafe { (*self.value.get()).len() }
    }

    pub(crate) fn check_key(&self, key: &[u8]) -> bool {
        self.key.len() == key.len() && self.key.as_ref() == key
    }

    /// 16-bit hash of the full key, used to prune false positives before a
    /// full byte comparison. CRC32 truncated to 16 bits, matching the
    /// teacher's existing choice of `crc32fast` for checksum-style hashing.
    pub(crate) fn fingerprint(&self) -> u16 {
        (crc32fast::hash(&self.key) & 0xFFFF) as u16
    }

    /// How many bytes of `key` (starting at `depth`) agree with this leaf's
    /// key, used while splitting a leaf/leaf collision into a new N4.
    pub(crate) fn prefix_matches(&self, key: &[u8], depth: usize) -> usize {
        let a = &self.key[depth.min(self.key.len())..];
        let b = &key[depth.min(key.len())..];
        a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
    }

    /// In-place update, only valid when `new_value.len() == self.value.len()`.
    pub(crate) fn update_in_place(&self, new_value: &[u8]) -> bool {
        if new_value.len() != self.value_len() {
            return false;
        }
        unsafe {
            let slice = &mut *self.value.get();
            slice.copy_from_slice(new_value);
        }
        flush(self.value.get() as usize, new_value.len());
        fence();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_key_rejects_wrong_length_and_content() {
        let leaf = Leaf::new(Bytes::from_static(b"apple"), Bytes::from_static(b"1"));
        assert!(leaf.check_key(b"apple"));
        assert!(!leaf.check_key(b"app"));
        assert!(!leaf.check_key(b"aprle"));
    }

    #[test]
    fn in_place_update_requires_equal_length() {
        let leaf = Leaf::new(Bytes::from_static(b"k"), Bytes::from_static(b"aa"));
        assert!(!leaf.update_in_place(b"aaa"));
        assert!(leaf.update_in_place(b"bb"));
        assert_eq!(leaf.value().as_ref(), b"bb");
    }

    #[test]
    fn prefix_matches_counts_shared_bytes() {
        let leaf = Leaf::new(Bytes::from_static(b"apple"), Bytes::from_static(b"1"));
        assert_eq!(leaf.prefix_matches(b"apricot", 0), 2);
        assert_eq!(leaf.prefix_matches(b"apple", 0), 5);
    }
}
