pub mod comparator;
pub mod config;
pub mod error;
mod node;
pub mod pmem;
pub mod recovery;
mod tree;

pub use comparator::{Comparator, LexicographicComparator};
pub use config::{ArtOptions, GrowthThresholds};
pub use error::{ArtError, ArtResult};
pub use pmem::{FaultInjectingPmem, HeapPmem, PmemAllocator};
pub use recovery::recover;
pub use tree::{Art, PutOutcome, RemoveOutcome};

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL_ALLOCATOR: MiMalloc = MiMalloc;

#[ctor::ctor]
fn init() {
    color_backtrace::install();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(true)
        .with_file(true)
        .with_level(true)
        .without_time()
        .with_thread_ids(true)
        .init();
}
