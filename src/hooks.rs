// # Collaborator Contracts
//
// The engine owns replacement decisions only. Writing dirty pages, the
// adaptive hash index, compressed-frame storage accounting, tablespace
// metadata and the read path all live elsewhere and are reached through
// the traits below. Hook implementations must not block and must not
// call back into the pool while the caller holds the pool mutex.

use std::sync::Arc;

use crate::page::ZipFrame;

/// Flush scheduler: writes dirty pages and keeps a free-list margin.
pub trait FlushScheduler: Send + Sync {
    /// Ask the scheduler to flush from the LRU tail so future frame
    /// requests find free blocks. `searched` is how many LRU entries the
    /// caller already inspected without success, a pressure hint.
    fn free_margin(&self, searched: usize);
}

/// Adaptive hash index attached to uncompressed pages.
pub trait AdaptiveIndex: Send + Sync {
    /// Drop any hash entries pointing into the given page. `zip_size` is
    /// 0 for an uncompressed tablespace.
    fn drop_page(&self, space: u32, zip_size: usize, page_no: u32);

    /// Drop the hash entries of a block that is being evicted. Called
    /// without any pool lock held; the frame contents are still intact.
    fn drop_block(&self, space: u32, page_no: u32);
}

/// Tablespace metadata from the file layer.
pub trait SpaceDirectory: Send + Sync {
    /// Compressed page size of the space: `Some(0)` for an uncompressed
    /// space, `None` when the space does not exist.
    fn zip_size(&self, space: u32) -> Option<usize>;

    /// Whether the extent containing `page_no` exists on disk.
    fn extent_exists(&self, space: u32, page_no: u32) -> bool;

    /// Version token invalidated when the space is dropped or renamed.
    fn version(&self, space: u32) -> u64;

    /// Fairness accounting: the number of this space's pages on the LRU
    /// changed by `delta`.
    fn lru_count(&self, space: u32, delta: i64);
}

/// Asynchronous read path used by warm-cache restore.
pub trait PageReader: Send + Sync {
    /// Issue an async prefetch read. Returns false when the read was not
    /// queued (page already resident, space gone).
    fn read_page_async(&self, space: u32, page_no: u32, version: u64) -> bool;

    /// Kick the simulated-AIO handler threads.
    fn wake_handlers(&self);
}

/// Buddy allocator for compressed frames. Dropping the frame releases
/// the memory; the hook exists so the allocator can account for it.
pub trait BuddyAllocator: Send + Sync {
    fn free(&self, frame: ZipFrame);
}

// ============================================================================
// Bundle and defaults
// ============================================================================

/// The collaborator set handed to the pool at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub flush: Arc<dyn FlushScheduler>,
    pub ahi: Arc<dyn AdaptiveIndex>,
    pub space_dir: Arc<dyn SpaceDirectory>,
    pub reader: Arc<dyn PageReader>,
    pub buddy: Arc<dyn BuddyAllocator>,
}

impl Default for Collaborators {
    fn default() -> Self {
        let noop = Arc::new(Noop);
        Self {
            flush: noop.clone(),
            ahi: noop.clone(),
            space_dir: noop.clone(),
            reader: noop.clone(),
            buddy: noop,
        }
    }
}

/// Inert collaborator used where a concern is absent: every space exists
/// uncompressed with all extents present, nothing is hashed, reads are
/// accepted and dropped.
pub struct Noop;

impl FlushScheduler for Noop {
    fn free_margin(&self, _searched: usize) {}
}

impl AdaptiveIndex for Noop {
    fn drop_page(&self, _space: u32, _zip_size: usize, _page_no: u32) {}
    fn drop_block(&self, _space: u32, _page_no: u32) {}
}

impl SpaceDirectory for Noop {
    fn zip_size(&self, _space: u32) -> Option<usize> {
        Some(0)
    }

    fn extent_exists(&self, _space: u32, _page_no: u32) -> bool {
        true
    }

    fn version(&self, _space: u32) -> u64 {
        0
    }

    fn lru_count(&self, _space: u32, _delta: i64) {}
}

impl PageReader for Noop {
    fn read_page_async(&self, _space: u32, _page_no: u32, _version: u64) -> bool {
        true
    }

    fn wake_handlers(&self) {}
}

impl BuddyAllocator for Noop {
    fn free(&self, frame: ZipFrame) {
        drop(frame);
    }
}
