//! Compressed path prefix, grounded on `original_source/ART/N.h`'s `Prefix`
//! (`maxStoredPrefixLength = 4`, `static_assert(sizeof(Prefix) == 8)`).

pub(crate) const MAX_STORED_PREFIX_LEN: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Prefix {
    pub(crate) len: u32,
    pub(crate) bytes: [u8; MAX_STORED_PREFIX_LEN],
}

impl Prefix {
    pub(crate) fn new(full: &[u8]) -> Self {
        let mut bytes = [0u8; MAX_STORED_PREFIX_LEN];
        let stored = full.len().min(MAX_STORED_PREFIX_LEN);
        bytes[..stored].copy_from_slice(&full[..stored]);
        Self {
            len: full.len() as u32,
            bytes,
        }
    }

    pub(crate) fn stored(&self) -> &[u8] {
        &self.bytes[..(self.len as usize).min(MAX_STORED_PREFIX_LEN)]
    }
}

pub(crate) enum PrefixMatch {
    /// Stored prefix fully matched the key bytes at this level.
    Match,
    /// Stored prefix diverges from the key; `at` is the offset of the first
    /// mismatching byte (relative to the start of the prefix).
    Mismatch { at: usize },
    /// `prefix.len > MAX_STORED_PREFIX_LEN`: only the stored 4 bytes were
    /// compared and they matched. The caller must fetch a descendant leaf
    /// and compare the rest (`pessimistic` comparison) before trusting this.
    Optimistic,
}

/// Compare `node_prefix` against `key[..]` (already offset to the node's level).
pub(crate) fn match_prefix(node_prefix: &Prefix, key: &[u8]) -> PrefixMatch {
    let stored = node_prefix.stored();
    if key.len() < stored.len() {
        for i in 0..key.len() {
            if stored[i] != key[i] {
                return PrefixMatch::Mismatch { at: i };
            }
        }
        return PrefixMatch::Mismatch { at: key.len() };
    }
    for (i, &b) in stored.iter().enumerate() {
        if key[i] != b {
            return PrefixMatch::Mismatch { at: i };
        }
    }
    if node_prefix.len as usize > MAX_STORED_PREFIX_LEN {
        PrefixMatch::Optimistic
    } else {
        PrefixMatch::Match
    }
}

/// Pessimistic comparison against a descendant leaf's full key, used when
/// `match_prefix` returned `Optimistic` or when the caller needs the exact
/// mismatch offset across the full (not just stored) prefix length.
pub(crate) fn match_prefix_pessimistic(
    node_prefix: &Prefix,
    level: usize,
    leaf_key: &[u8],
    key: &[u8],
) -> PrefixMatch {
    let full_len = node_prefix.len as usize;
    let end = level + full_len;
    if end > leaf_key.len() {
        // Degenerate: the descendant leaf is shorter than the claimed prefix.
        let shared = leaf_key.len().saturating_sub(level);
        for i in 0..shared.min(key.len()) {
            if leaf_key[level + i] != key.get(level + i).copied().unwrap_or(0) {
                return PrefixMatch::Mismatch { at: i };
            }
        }
        return PrefixMatch::Mismatch { at: shared };
    }
    for i in 0..full_len {
        let expected = leaf_key[level + i];
        match key.get(level + i) {
            Some(&b) if b == expected => continue,
            _ => return PrefixMatch::Mismatch { at: i },
        }
    }
    PrefixMatch::Match
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_prefix_matches() {
        let p = Prefix::new(b"ab");
        match match_prefix(&p, b"abcdef") {
            PrefixMatch::Match => {}
            _ => panic!("expected match"),
        }
    }

    #[test]
    fn mismatch_reports_offset() {
        let p = Prefix::new(b"abcd");
        match match_prefix(&p, b"abXd") {
            PrefixMatch::Mismatch { at } => assert_eq!(at, 2),
            _ => panic!("expected mismatch"),
        }
    }

    #[test]
    fn long_prefix_is_optimistic() {
        let p = Prefix::new(b"abcdefgh");
        assert_eq!(p.len, 8);
        assert_eq!(p.stored(), b"abcd");
        match match_prefix(&p, b"abcdZZZZ") {
            PrefixMatch::Optimistic => {}
            _ => panic!("expected optimistic match"),
        }
    }

    #[test]
    fn pessimistic_checks_full_length() {
        let p = Prefix::new(b"abcdefgh");
        let leaf_key = b"abcdefghZZ";
        match match_prefix_pessimistic(&p, 0, leaf_key, b"abcdefgh??") {
            PrefixMatch::Match => {}
            _ => panic!("expected match"),
        }
        match match_prefix_pessimistic(&p, 0, leaf_key, b"abcdXfgh??") {
            PrefixMatch::Mismatch { at } => assert_eq!(at, 4),
            _ => panic!("expected mismatch"),
        }
    }
}
