// # Tablespace Bulk Operations
//
// Dropping or discarding a tablespace must clear every trace of it from
// the pool without emitting writes. Both walks release the pool mutex
// periodically so a large tablespace does not stall every accessor; the
// sticky-anchor protocol keeps the current list position valid across
// the release.

use parking_lot::MutexGuard;
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::config::DROP_SEARCH_SIZE;
use crate::list::SlotId;
use crate::page::{IoFix, PageState};
use crate::pool::{BufferPool, PoolInner};

/// How to clear a tablespace out of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveMode {
    /// DISCARD: drop adaptive-hash entries, then evict every page of the
    /// space from the LRU, dirty or not. No writes are issued.
    AllNoWrite,
    /// DROP: the caller already cleared the adaptive hash. Dirty pages
    /// of the space are dropped from the flush set without writing; the
    /// pages age out of the LRU on their own.
    FlushNoWrite,
}

/// Pause between rescans while pinned or I/O-fixed pages drain.
const DRAIN_SLEEP: Duration = Duration::from_millis(20);

impl BufferPool {
    /// Remove every trace of a tablespace from the pool, per `mode`.
    pub fn flush_or_remove(&self, space: u32, mode: RemoveMode) {
        match mode {
            RemoveMode::AllNoWrite => {
                // Batched hash drops first; they are best effort, the
                // per-page walk below catches whatever they miss.
                self.drop_ahi_for_space(space);
                self.remove_all_pages(space);
            }
            RemoveMode::FlushNoWrite => {
                debug_assert_eq!(
                    self.drop_ahi_for_space(space),
                    0,
                    "caller must clear the adaptive hash before a DROP"
                );
                self.flush_dirty_pages(space);
            }
        }
    }

    // ------------------------------------------------------------------
    // Adaptive-hash batch drop
    // ------------------------------------------------------------------

    /// Collect pages of the space that may carry adaptive-hash entries
    /// and drop those entries in batches of `DROP_SEARCH_SIZE`,
    /// releasing the pool mutex for each batch. Best effort: pages that
    /// enter the LRU concurrently can be missed. Returns the number of
    /// pages handed to the index.
    pub(crate) fn drop_ahi_for_space(&self, space: u32) -> usize {
        let Some(zip_size) = self.hooks.space_dir.zip_size(space) else {
            // The tablespace vanished; nothing can be hashed.
            debug_assert!(false, "dropping hash entries of a missing space");
            return 0;
        };

        let mut batch: Vec<u32> = Vec::with_capacity(DROP_SEARCH_SIZE);
        let mut num_found = 0usize;

        let mut inner = self.inner.lock();
        'scan: loop {
            let mut cursor = inner.lru.tail();
            while let Some(slot) = cursor {
                let prev = inner.lru.prev(slot);
                let desc = self.arena.get(slot);
                debug_assert!(desc.in_file());

                // Compressed-only pages are never hashed; skip other
                // spaces and anything I/O-fixed or pinned (dealt with
                // later by the per-page walk).
                let hashed = desc.state() == PageState::FilePage
                    && desc.id().space == space
                    && desc.io_fix() == IoFix::None
                    && desc.buf_fix_count() == 0
                    && desc.ahi_attached();

                if hashed {
                    desc.set_ahi_attached(false);
                    batch.push(desc.id().page_no);
                    num_found += 1;

                    if batch.len() >= DROP_SEARCH_SIZE {
                        let drained = std::mem::take(&mut batch);
                        let hooks = &self.hooks;
                        MutexGuard::unlocked(&mut inner, || {
                            for page_no in &drained {
                                hooks.ahi.drop_page(space, zip_size, *page_no);
                            }
                        });

                        // The lists may have shifted while the mutex was
                        // released. Restart when the anchor or its
                        // neighbor left the LRU; otherwise carry on from
                        // the saved position, accepting that some pages
                        // may be revisited or missed.
                        if self.arena.get(slot).state() != PageState::FilePage {
                            continue 'scan;
                        }
                        if let Some(prev) = prev {
                            if !inner.lru.contains(prev) {
                                continue 'scan;
                            }
                        }
                    }
                }
                cursor = prev;
            }
            break;
        }
        drop(inner);

        for page_no in &batch {
            self.hooks.ahi.drop_page(space, zip_size, *page_no);
        }
        num_found
    }

    // ------------------------------------------------------------------
    // DISCARD walk
    // ------------------------------------------------------------------

    /// Evict every page of the space from the LRU regardless of
    /// dirtiness. Pinned or I/O-fixed pages force a rescan after a short
    /// sleep until the fixes drain.
    pub(crate) fn remove_all_pages(&self, space: u32) {
        loop {
            let mut all_freed = true;
            let mut removed = 0i64;

            let mut inner = self.inner.lock();
            let mut cursor = inner.lru.tail();
            while let Some(slot) = cursor {
                let prev = inner.lru.prev(slot);
                let desc = self.arena.get(slot);
                debug_assert!(desc.in_file());

                if desc.id().space != space {
                    cursor = prev;
                    continue;
                }
                if !desc.can_relocate() {
                    // Being read in, written out, or anchored by an
                    // iterator; retry once the holder lets go.
                    all_freed = false;
                    cursor = prev;
                    continue;
                }

                if desc.state() == PageState::FilePage && desc.ahi_attached() {
                    // Straggler the batch drop missed. The hash index
                    // takes page latches, so drop outside the pool mutex
                    // and restart the scan.
                    let page_no = desc.id().page_no;
                    let page_zip_size = desc.zip_size();
                    desc.set_ahi_attached(false);
                    let hooks = &self.hooks;
                    MutexGuard::unlocked(&mut inner, || {
                        hooks.ahi.drop_page(space, page_zip_size, page_no);
                    });
                    all_freed = true;
                    cursor = inner.lru.tail();
                    continue;
                }

                if desc.is_dirty() {
                    // Discard the modifications; no write is issued.
                    inner.flush_remove(&self.arena, slot);
                }
                debug!(space, page = desc.id().page_no, "dropping page");
                self.free_one_page_locked(&mut inner, slot);
                removed += 1;
                cursor = prev;
            }
            drop(inner);

            if removed != 0 {
                self.hooks.space_dir.lru_count(space, -removed);
            }
            if all_freed || self.is_shutting_down() {
                return;
            }
            thread::sleep(DRAIN_SLEEP);
        }
    }

    // ------------------------------------------------------------------
    // DROP walk
    // ------------------------------------------------------------------

    /// Drop the space's dirty pages from the flush set without writing.
    pub(crate) fn flush_dirty_pages(&self, space: u32) {
        loop {
            let all_freed = {
                let mut inner = self.inner.lock();
                self.flush_or_remove_pages_locked(&mut inner, space)
            };
            if all_freed || self.is_shutting_down() {
                return;
            }
            thread::sleep(DRAIN_SLEEP);
        }
    }

    fn flush_or_remove_pages_locked(
        &self,
        inner: &mut MutexGuard<'_, PoolInner>,
        space: u32,
    ) -> bool {
        let mut processed = 0usize;
        let mut all_freed = true;

        let mut cursor = inner.flush.tail();
        while let Some(slot) = cursor {
            let prev = inner.flush.prev(slot);

            if self.arena.get(slot).id().space == space
                && !self.flush_or_remove_page_locked(inner, slot)
            {
                // I/O in flight or pinned; rescan from the tail later.
                all_freed = false;
            }

            processed += 1;
            if self.try_flush_yield(inner, prev, processed) {
                processed = 0;
            }
            cursor = prev;
        }
        all_freed
    }

    /// Remove one page from the flush set if nothing holds it.
    fn flush_or_remove_page_locked(
        &self,
        inner: &mut MutexGuard<'_, PoolInner>,
        slot: SlotId,
    ) -> bool {
        let desc = self.arena.get(slot);
        if desc.io_fix() != IoFix::None {
            return false;
        }
        debug_assert!(desc.is_dirty());
        if desc.buf_fix_count() != 0 {
            return false;
        }
        inner.flush_remove(&self.arena, slot);
        true
    }

    // ------------------------------------------------------------------
    // Sticky yield protocol
    // ------------------------------------------------------------------

    /// Yield the pool mutex every `DROP_SEARCH_SIZE` processed pages so
    /// other threads get a turn. The anchor is made sticky first so its
    /// list position survives the release. Returns whether a yield
    /// happened.
    fn try_flush_yield(
        &self,
        inner: &mut MutexGuard<'_, PoolInner>,
        anchor: Option<SlotId>,
        processed: usize,
    ) -> bool {
        let Some(anchor) = anchor else {
            return false;
        };
        if processed < DROP_SEARCH_SIZE
            || self.arena.get(anchor).io_fix() != IoFix::None
        {
            return false;
        }

        let desc = self.arena.get(anchor);
        desc.set_sticky(true);
        MutexGuard::unlocked(inner, thread::yield_now);
        desc.set_sticky(false);

        // The anchor must not have left the flush set during the yield.
        debug_assert!(inner.flush.contains(anchor));
        true
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::RemoveMode;
    use crate::config::PoolConfig;
    use crate::hooks::{AdaptiveIndex, Collaborators};
    use crate::page::{PageId, ZipFrame};
    use crate::pool::BufferPool;

    #[derive(Default)]
    struct CountingAhi {
        drops: AtomicUsize,
    }

    impl AdaptiveIndex for CountingAhi {
        fn drop_page(&self, _space: u32, _zip_size: usize, _page_no: u32) {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }

        fn drop_block(&self, _space: u32, _page_no: u32) {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn pool_with_ahi(frames: usize) -> (BufferPool, Arc<CountingAhi>) {
        let ahi = Arc::new(CountingAhi::default());
        let hooks = Collaborators {
            ahi: ahi.clone(),
            ..Collaborators::default()
        };
        let config = PoolConfig::builder().curr_size(frames).build();
        (BufferPool::with_collaborators(config, hooks), ahi)
    }

    fn fault(pool: &BufferPool, space: u32, page_no: u32) -> u32 {
        let slot = pool.get_free_block();
        pool.install_page(slot, PageId::new(space, page_no), None, false)
            .unwrap();
        slot
    }

    #[test]
    fn discard_evicts_every_page_of_the_space() {
        let (pool, _ahi) = pool_with_ahi(64);
        for page_no in 0..20u32 {
            let slot = fault(&pool, 7, page_no);
            if page_no % 4 == 0 {
                pool.mark_dirty(slot, u64::from(page_no) + 1);
            }
        }
        for page_no in 0..10u32 {
            fault(&pool, 8, page_no);
        }

        pool.flush_or_remove(7, RemoveMode::AllNoWrite);

        for page_no in 0..20u32 {
            assert_eq!(pool.lookup(PageId::new(7, page_no)), None);
        }
        for page_no in 0..10u32 {
            assert!(pool.lookup(PageId::new(8, page_no)).is_some());
        }
        let stats = pool.stats();
        assert_eq!(stats.lru_len, 10);
        assert_eq!(stats.flush_len, 0);
        pool.validate();
    }

    #[test]
    fn discard_drops_straggler_hash_entries() {
        let (pool, ahi) = pool_with_ahi(32);
        for page_no in 0..8u32 {
            let slot = fault(&pool, 3, page_no);
            pool.arena.get(slot).set_ahi_attached(true);
        }

        pool.flush_or_remove(3, RemoveMode::AllNoWrite);

        assert_eq!(ahi.drops.load(Ordering::Relaxed), 8);
        assert_eq!(pool.stats().lru_len, 0);
        pool.validate();
    }

    #[test]
    fn discard_preserves_compressed_siblings_of_other_spaces() {
        let (pool, _ahi) = pool_with_ahi(32);
        let keep = pool.get_free_block();
        pool.install_page(keep, PageId::new(5, 1), Some(ZipFrame::new(2048)), false)
            .unwrap();
        fault(&pool, 6, 1);

        pool.flush_or_remove(6, RemoveMode::AllNoWrite);

        assert!(pool.lookup(PageId::new(5, 1)).is_some());
        assert_eq!(pool.stats().unzip_lru_len, 1);
        pool.validate();
    }

    #[test]
    fn drop_clears_the_flush_set_without_touching_residency() {
        let (pool, _ahi) = pool_with_ahi(64);
        for page_no in 0..12u32 {
            let slot = fault(&pool, 9, page_no);
            pool.mark_dirty(slot, u64::from(page_no) + 1);
        }
        let other = fault(&pool, 10, 0);
        pool.mark_dirty(other, 100);

        pool.flush_or_remove(9, RemoveMode::FlushNoWrite);

        // Dirty pages of space 9 are clean now but still resident.
        let stats = pool.stats();
        assert_eq!(stats.flush_len, 1);
        assert_eq!(stats.lru_len, 13);
        for page_no in 0..12u32 {
            let slot = pool.lookup(PageId::new(9, page_no)).unwrap();
            assert!(!pool.arena.get(slot).is_dirty());
        }
        assert!(pool.arena.get(other).is_dirty());
        pool.validate();
    }

    #[test]
    fn io_fixed_pages_survive_until_the_fix_drains() {
        let (pool, _ahi) = pool_with_ahi(32);
        let fixed = fault(&pool, 11, 0);
        fault(&pool, 11, 1);
        pool.begin_io(fixed, crate::page::IoFix::Write);

        let pool = Arc::new(pool);
        let clearer = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(60));
                pool.complete_io(fixed);
            })
        };

        pool.flush_or_remove(11, RemoveMode::AllNoWrite);
        clearer.join().unwrap();

        assert_eq!(pool.lookup(PageId::new(11, 0)), None);
        assert_eq!(pool.lookup(PageId::new(11, 1)), None);
        pool.validate();
    }
}
