//! Crate configuration, following the teacher's `Options`/`Config` split:
//! `ArtOptions` is the user-facing knob set, analogous to the teacher's
//! `options::Options` + `config::Config` combined (this crate has no
//! block-level concerns, so the two collapse into one struct).

use std::sync::Arc;

use crate::comparator::{Comparator, LexicographicComparator};
use crate::pmem::{HeapPmem, PmemAllocator};

/// The variant-transition thresholds from spec §4.4, broken out so tests can
/// exercise grow/shrink paths without constructing thousands of keys.
#[derive(Debug, Clone, Copy)]
pub struct GrowthThresholds {
    /// `N256` shrinks to `N48` once `count` drops to or below this.
    pub n256_shrink_at: u16,
    /// `N48` shrinks to `N16` once `count` drops to or below this.
    pub n48_shrink_at: u16,
    /// `N16` shrinks to `N4` once `count` drops to or below this.
    pub n16_shrink_at: u16,
    /// A node is compacted in place once `compact_count` exceeds
    /// `compaction_factor * count`.
    pub compaction_factor: u16,
}

impl Default for GrowthThresholds {
    fn default() -> Self {
        Self {
            n256_shrink_at: 37,
            n48_shrink_at: 12,
            n16_shrink_at: 3,
            compaction_factor: 2,
        }
    }
}

pub struct ArtOptions {
    pub(crate) allocator: Arc<dyn PmemAllocator>,
    pub(crate) comparator: Box<dyn Comparator>,
    pub(crate) thresholds: GrowthThresholds,
}

impl ArtOptions {
    pub fn new(allocator: Arc<dyn PmemAllocator>) -> Self {
        Self {
            allocator,
            comparator: Box::new(LexicographicComparator),
            thresholds: GrowthThresholds::default(),
        }
    }

    pub fn with_comparator(mut self, comparator: Box<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn with_thresholds(mut self, thresholds: GrowthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }
}

impl Default for ArtOptions {
    fn default() -> Self {
        Self::new(Arc::new(HeapPmem::new()))
    }
}
