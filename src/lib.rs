//! # PagePool - Buffer-Pool Replacement Engine
//!
//! The replacement engine of a paged storage manager: a fixed pool of
//! page frames, the lists that order them, and the policies that decide
//! which resident page gives up its frame next.
//!
//! - **Scan-resistant LRU**: the recency list is split into a young
//!   prefix and an old suffix. New residents enter at the old boundary
//!   and are promoted to the head only after staying resident past a
//!   configurable age, so one-touch scans age out without displacing the
//!   working set.
//! - **Unzip-LRU**: decompressed frames of compressed pages are tracked
//!   separately and can be shed on their own, trading re-decompression
//!   CPU for memory, steered by a rolling I/O-vs-decompress rate window.
//! - **Allocator**: page faults pop the free list or evict from the
//!   list tails, retrying with a widening horizon and falling back to
//!   the external flusher under pressure.
//! - **Tablespace operations**: DROP and DISCARD clear a space's pages
//!   from the pool without writes, yielding the pool mutex periodically
//!   via sticky iterator anchors.
//! - **Warm-cache dump/restore**: the LRU order is persisted to
//!   `ib_lru_dump` and replayed after restart as rate-capped prefetch
//!   reads batched into physically-contiguous runs.
//!
//! The page hash, flush scheduling, adaptive hash index, compressed-frame
//! storage, file layer and read path are collaborator contracts (see
//! [`hooks`]); the engine owns descriptor lifecycles and list membership
//! only.
//!
//! ```no_run
//! use pagepool::{BufferPool, PageId, PoolConfig};
//!
//! let pool = BufferPool::new(
//!     PoolConfig::builder()
//!         .curr_size(10_000)
//!         .old_ratio_pct(37)
//!         .old_threshold_ms(1000)
//!         .build(),
//! );
//!
//! // Page fault: take a frame, install the page, pin it for access.
//! let slot = pool.get_free_block();
//! pool.install_page(slot, PageId::new(1, 42), None, false).unwrap();
//! let guard = pool.pin_page(PageId::new(1, 42)).unwrap();
//! let _bytes = guard.read();
//! ```

pub mod alloc;
pub mod config;
pub mod descriptor;
pub mod dump;
pub mod error;
pub mod evict;
pub mod hooks;
pub mod list;
pub mod lru;
pub mod page;
pub mod pool;
pub mod spaces;
pub mod stats;

pub use config::{PoolConfig, PoolConfigBuilder};
pub use descriptor::{Descriptor, DescriptorArena};
pub use dump::{DumpReport, RestoreReport, DUMP_FILE, DUMP_TEMP_FILE};
pub use error::{PoolError, Result};
pub use hooks::{
    AdaptiveIndex, BuddyAllocator, Collaborators, FlushScheduler, PageReader, SpaceDirectory,
};
pub use list::SlotId;
pub use page::{IoFix, PageFrame, PageId, PageState, ZipFrame, PAGE_SIZE};
pub use pool::{BufferPool, PinGuard, PoolStats};
pub use spaces::RemoveMode;
pub use stats::IntervalSample;
