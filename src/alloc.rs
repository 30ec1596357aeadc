// # Free-Block Allocation
//
// `get_free_block` is the single entry every page fault goes through: pop
// the free list, or evict a victim to refill it, or fall back to the
// flusher and retry with a widening search horizon. The loop is bounded
// per iteration; it never blocks while holding the pool mutex.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use tracing::{error, warn};

use crate::descriptor::DescriptorArena;
use crate::list::SlotId;
use crate::page::PageState;
use crate::pool::{BufferPool, PoolInner};

/// Sleep between retries once the allocator has looped this many times.
const SLOW_RETRY_ITERATIONS: usize = 10;

/// Emit a diagnostic once the allocator has looped this many times.
const DIAGNOSTIC_ITERATIONS: usize = 30;

impl PoolInner {
    /// Pop a block off the free list, or `None` when it is empty. The
    /// block comes back in state READY_FOR_USE with cleared accounting.
    pub(crate) fn get_free_only(&mut self, arena: &DescriptorArena) -> Option<SlotId> {
        let slot = self.free.head()?;
        debug_assert!(!self.lru.contains(slot));
        debug_assert!(!self.flush.contains(slot));
        self.free.remove(slot);

        let desc = arena.get(slot);
        debug_assert_eq!(desc.state(), PageState::NotUsed);
        desc.set_state(PageState::ReadyForUse);
        desc.reset_for_use();
        Some(slot)
    }
}

impl BufferPool {
    /// Produce a free block, evicting if necessary. Panics when the
    /// caller contract is violated so badly that under 5% of the pool is
    /// in the free list or LRU (too many blocks held outside the lists).
    pub fn get_free_block(&self) -> SlotId {
        let mut n_iterations = 1usize;

        loop {
            let mut inner = self.inner.lock();

            let available = inner.free.len() + inner.lru.len();
            if available < self.config.curr_size / 20 {
                error!(
                    available,
                    curr_size = self.config.curr_size,
                    "over 95 percent of the buffer pool is held outside the \
                     free list and LRU; check that accessors do not leak pins"
                );
                panic!("buffer pool exhausted: {available} of {} blocks reachable", self.config.curr_size);
            } else if available < self.config.curr_size / 3 {
                if !self.pressure_warned.swap(true, Ordering::AcqRel) {
                    warn!(
                        available,
                        curr_size = self.config.curr_size,
                        "over 67 percent of the buffer pool is held outside \
                         the free list and LRU; possible pin leak"
                    );
                }
            } else if self.pressure_warned.load(Ordering::Acquire) {
                // Pressure receded.
                self.pressure_warned.store(false, Ordering::Release);
            }

            if let Some(slot) = inner.get_free_only(&self.arena) {
                return slot;
            }

            // Free list empty: search from the LRU tail. Take the freed
            // block under the same mutex hold.
            let outcome = self.search_and_free_locked(&mut inner, n_iterations, true);
            drop(inner);

            if let Some(space) = outcome.evicted_space {
                self.hooks.space_dir.lru_count(space, -1);
            }
            if let Some(slot) = outcome.block {
                debug_assert!(outcome.freed);
                return slot;
            }
            if outcome.freed {
                // Freed but raced for the block; take another turn.
                continue;
            }

            if n_iterations > DIAGNOSTIC_ITERATIONS {
                warn!(
                    n_iterations,
                    "difficult to find free blocks in the buffer pool; \
                     consider increasing its size"
                );
            }

            // Nothing evictable within the horizon: have the flusher
            // clean the LRU tail, let the I/O handlers run, then retry
            // with a wider horizon.
            self.hooks.flush.free_margin(outcome.nsearched);
            self.wait_free.fetch_add(1, Ordering::Relaxed);
            self.hooks.reader.wake_handlers();

            let flushed_pending = self.inner.lock().lru_flush_ended > 0;
            if flushed_pending {
                self.try_free_flushed_blocks();
            }

            if n_iterations > SLOW_RETRY_ITERATIONS {
                thread::sleep(Duration::from_millis(500));
            }
            n_iterations += 1;
        }
    }

    /// Return a block obtained from `get_free_block` that ended up not
    /// holding a file page.
    pub fn release_block(&self, slot: SlotId) {
        let mut inner = self.inner.lock();
        inner.free_non_file(&self.arena, &self.hooks, slot);
    }

    /// Harvest blocks written by an LRU flush into the free list while
    /// the completion credit lasts.
    pub fn try_free_flushed_blocks(&self) {
        loop {
            if self.inner.lock().lru_flush_ended == 0 {
                return;
            }
            // A failed search zeroes the credit, so this terminates.
            self.search_and_free(1);
        }
    }

    /// Heuristic for admission control: under 25% of the pool reachable.
    pub fn running_out(&self) -> bool {
        let inner = self.inner.lock();
        inner.free.len() + inner.lru.len() < self.config.curr_size / 4
    }
}

// ============================================================================
// Tests
// ============================================================================
