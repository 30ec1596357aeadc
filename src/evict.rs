// # Eviction
//
// Victim selection and the per-candidate freeing protocol. Two sources
// feed the allocator: the unzip-LRU, where only the uncompressed frame
// of a compressed page is shed (dirty pages allowed, the compressed
// frame survives via descriptor relocation), and the main LRU, where a
// whole clean block is freed.
//
// The unzip-vs-full choice is workload-driven: an I/O-bound load sheds
// decompressed frames to make room for more distinct residents, a
// CPU-bound load keeps them to avoid re-decompressing.

use parking_lot::MutexGuard;
use tracing::{error, warn};

use crate::config::{FREE_SEARCH_LEN, OLD_MIN_LEN};
use crate::descriptor::DescriptorArena;
use crate::hooks::Collaborators;
use crate::list::SlotId;
use crate::page::{IoFix, PageState};
use crate::pool::{BufferPool, PoolInner};

/// What `remove_hashed` did with the descriptor.
pub(crate) enum RemovedKind {
    /// Uncompressed block unhashed, held in REMOVE_HASH pending its
    /// return to the free list.
    RemoveHash,
    /// Standalone compressed descriptor fully freed.
    ZipFree,
}

pub(crate) struct FreeOutcome {
    pub freed: bool,
    /// Whether the page left the LRU entirely (false when a compressed
    /// descriptor was relocated into its place).
    pub fully_removed: bool,
}

pub(crate) struct SearchOutcome {
    pub freed: bool,
    pub block: Option<SlotId>,
    pub nsearched: usize,
    pub evicted_space: Option<u32>,
}

// ============================================================================
// PoolInner: unhash and free-list return
// ============================================================================

impl PoolInner {
    /// Take a block out of the LRU and the page hash. The caller has
    /// verified the block is not pinned, not I/O-fixed and not sticky.
    pub(crate) fn remove_hashed(
        &mut self,
        arena: &DescriptorArena,
        hooks: &Collaborators,
        slot: SlotId,
        zip: bool,
    ) -> RemovedKind {
        let desc = arena.get(slot);
        debug_assert_eq!(desc.io_fix(), IoFix::None);
        debug_assert_eq!(desc.buf_fix_count(), 0);

        self.lru_remove(arena, slot);
        self.freed_page_clock += 1;

        let id = desc.id();
        match self.page_hash.get(&id) {
            Some(&hashed) if hashed == slot => {}
            other => {
                error!(page = %id, hashed = ?other, "page hash disagrees with LRU");
                panic!("page {id} not hashed to its LRU descriptor");
            }
        }
        self.page_hash.remove(&id);

        match desc.state() {
            PageState::ZipPage => {
                debug_assert!(!desc.is_dirty());
                debug_assert!(!arena.is_frame_slot(slot));
                #[cfg(debug_assertions)]
                self.zip_clean.remove(slot);

                let frame = desc
                    .take_zip()
                    .expect("compressed-only descriptor without a frame");
                hooks.buddy.free(frame);
                desc.set_state(PageState::ZipFree);

                // The descriptor itself returns to the spare pool.
                desc.set_state(PageState::NotUsed);
                desc.reset_for_use();
                self.spare.push(slot);
                RemovedKind::ZipFree
            }
            PageState::FilePage => {
                desc.frame().write().stamp_unhashed();
                desc.set_state(PageState::RemoveHash);
                if zip {
                    if let Some(frame) = desc.take_zip() {
                        hooks.buddy.free(frame);
                    }
                }
                RemovedKind::RemoveHash
            }
            state => unreachable!("remove_hashed on state {state:?}"),
        }
    }

    /// REMOVE_HASH -> MEMORY -> free list.
    pub(crate) fn block_free_hashed(
        &mut self,
        arena: &DescriptorArena,
        hooks: &Collaborators,
        slot: SlotId,
    ) {
        arena.get(slot).set_state(PageState::Memory);
        self.free_non_file(arena, hooks, slot);
    }

    /// Return a non-file block to the free list, wiping the frame.
    pub(crate) fn free_non_file(
        &mut self,
        arena: &DescriptorArena,
        hooks: &Collaborators,
        slot: SlotId,
    ) {
        let desc = arena.get(slot);
        debug_assert!(matches!(
            desc.state(),
            PageState::Memory | PageState::ReadyForUse
        ));
        debug_assert_eq!(desc.buf_fix_count(), 0);
        debug_assert!(!desc.is_dirty());
        debug_assert!(!self.lru.contains(slot));
        debug_assert!(!self.free.contains(slot));
        debug_assert!(!self.flush.contains(slot));

        desc.frame().write().reset_for_free();
        if let Some(frame) = desc.take_zip() {
            hooks.buddy.free(frame);
        }
        desc.set_state(PageState::NotUsed);
        desc.reset_for_use();
        self.free.push_front(slot);
    }

    /// Whether the next victim should come from the unzip-LRU.
    pub(crate) fn should_evict_unzip(
        &self,
        unzip_lru_pct: u64,
        io_to_unzip_factor: u64,
        live: crate::stats::IntervalSample,
    ) -> bool {
        let unzip_len = self.unzip.len();
        if unzip_len == 0 {
            return false;
        }

        // Keep hot decompressed frames while they are a small share of
        // the pool.
        let lru_len = self.lru.len().max(1);
        if (100 * unzip_len / lru_len) as u64 <= unzip_lru_pct {
            return false;
        }

        // Until eviction starts we assume the workload is disk bound.
        if self.freed_page_clock == 0 {
            return true;
        }

        let (io_avg, unzip_avg) = self.window.averages(live);
        unzip_avg <= io_avg * io_to_unzip_factor as f64
    }
}

// ============================================================================
// BufferPool: per-candidate freeing
// ============================================================================

impl BufferPool {
    /// Try to free one block. With `zip`, the compressed frame goes too
    /// and the block must be clean; without it, a surviving compressed
    /// frame is preserved by relocating it onto a fresh descriptor that
    /// takes the block's exact LRU position.
    ///
    /// Releases and reacquires the pool mutex when a block is freed, so
    /// list iterators held by the caller are only valid on failure.
    pub(crate) fn free_block_locked(
        &self,
        inner: &mut MutexGuard<'_, PoolInner>,
        slot: SlotId,
        zip: bool,
    ) -> FreeOutcome {
        const NOT_FREED: FreeOutcome = FreeOutcome {
            freed: false,
            fully_removed: false,
        };

        let desc = self.arena.get(slot);
        debug_assert!(desc.in_file());
        debug_assert!(inner.lru.contains(slot));
        debug_assert_eq!(desc.is_dirty(), inner.flush.contains(slot));

        if !desc.can_relocate() {
            return NOT_FREED;
        }

        let dirty = desc.is_dirty();
        let mut relocate = false;
        if zip || !desc.has_zip() {
            // This would free the whole block; dirty blocks stay for the
            // flusher.
            if dirty {
                return NOT_FREED;
            }
        } else if dirty {
            if desc.state() != PageState::FilePage {
                debug_assert_eq!(desc.state(), PageState::ZipDirty);
                return NOT_FREED;
            }
            relocate = true;
        } else if desc.state() == PageState::FilePage {
            relocate = true;
        }

        // Claim the standalone descriptor up front; refuse rather than
        // free something else to make room for it.
        let b_slot = if relocate {
            match inner.spare.pop() {
                Some(b) => Some(b),
                None => {
                    warn!(page = %desc.id(), "no spare descriptor for relocation");
                    return NOT_FREED;
                }
            }
        } else {
            None
        };

        // Position and inherited fields, captured before unhooking.
        let prev = inner.lru.prev(slot);
        let id = desc.id();
        let was_old = desc.is_old();
        let oldest = desc.oldest_modification();
        let access = desc.access_time_ms();
        let page_clock = desc.freed_page_clock();

        match inner.remove_hashed(&self.arena, &self.hooks, slot, zip) {
            RemovedKind::ZipFree => FreeOutcome {
                freed: true,
                fully_removed: true,
            },
            RemovedKind::RemoveHash => {
                let mut fully_removed = true;

                if let Some(b_slot) = b_slot {
                    let b = self.arena.get(b_slot);
                    debug_assert_eq!(b.state(), PageState::NotUsed);
                    debug_assert!(!inner.page_hash.contains_key(&id));

                    let frame = desc
                        .take_zip()
                        .expect("relocation without a compressed frame");
                    b.set_id(id);
                    b.put_zip(frame);
                    b.set_state(if oldest != 0 {
                        PageState::ZipDirty
                    } else {
                        PageState::ZipPage
                    });
                    b.set_oldest_modification(oldest);
                    b.set_freed_page_clock(page_clock);
                    if access != 0 {
                        b.mark_accessed(access);
                    }

                    inner.page_hash.insert(id, b_slot);
                    fully_removed = false;

                    // Splice the replacement into the evicted block's
                    // position.
                    if let Some(prev) = prev {
                        debug_assert!(inner.lru.contains(prev));
                        inner.lru.insert_after(prev, b_slot);

                        if inner.lru_old.is_none() {
                            b.set_old(false);
                        } else if was_old {
                            b.set_old(true);
                            inner.lru_old_len += 1;
                            if inner.lru_old == inner.lru.next(b_slot) {
                                // The replacement is now the first old block.
                                inner.lru_old = Some(b_slot);
                            }
                        } else {
                            b.set_old(false);
                        }

                        let lru_len = inner.lru.len();
                        if lru_len > OLD_MIN_LEN {
                            inner.old_adjust(&self.arena);
                        } else if lru_len == OLD_MIN_LEN {
                            inner.old_init(&self.arena);
                        }
                    } else {
                        inner.lru_add(&self.arena, b_slot, was_old);
                    }

                    if oldest != 0 {
                        inner.flush_relocate(&self.arena, slot, b_slot);
                    } else {
                        #[cfg(debug_assertions)]
                        inner.insert_zip_clean(&self.arena, b_slot);
                    }

                    // Nobody may decompress the replacement while the
                    // pool mutex is released below.
                    b.set_sticky(true);
                }

                // Drop the adaptive hash entries and stamp the compressed
                // checksum without holding the pool mutex.
                let arena = &self.arena;
                let hooks = &self.hooks;
                MutexGuard::unlocked(inner, || {
                    hooks.ahi.drop_block(id.space, id.page_no);
                    desc.set_ahi_attached(false);
                    if let Some(b_slot) = b_slot {
                        let mut zip_guard = arena.get(b_slot).zip();
                        if let Some(frame) = zip_guard.as_mut() {
                            frame.stamp_checksum();
                        }
                    }
                });

                if let Some(b_slot) = b_slot {
                    self.arena.get(b_slot).set_sticky(false);
                }

                inner.block_free_hashed(&self.arena, &self.hooks, slot);

                FreeOutcome {
                    freed: true,
                    fully_removed,
                }
            }
        }
    }

    /// Accessor surface for freeing one known block. Returns whether the
    /// block was freed.
    pub fn free_block(&self, slot: SlotId, zip: bool) -> bool {
        let mut inner = self.inner.lock();
        let space = self.arena.get(slot).id().space;
        let outcome = self.free_block_locked(&mut inner, slot, zip);
        drop(inner);
        if outcome.freed && outcome.fully_removed {
            self.hooks.space_dir.lru_count(space, -1);
        }
        outcome.freed
    }

    /// Unhash one page and put its descriptor on the free list. The
    /// compressed frame, if any, goes back to the buddy allocator.
    pub(crate) fn free_one_page_locked(
        &self,
        inner: &mut MutexGuard<'_, PoolInner>,
        slot: SlotId,
    ) {
        match inner.remove_hashed(&self.arena, &self.hooks, slot, true) {
            RemovedKind::RemoveHash => {
                inner.block_free_hashed(&self.arena, &self.hooks, slot)
            }
            RemovedKind::ZipFree => {}
        }
    }

    // ------------------------------------------------------------------
    // Tail searches
    // ------------------------------------------------------------------

    /// Shed an uncompressed frame from the unzip-LRU tail. Searches
    /// `100 + n_iterations * len / 5` entries; callers past four failed
    /// rounds skip the unzip-LRU entirely.
    pub(crate) fn free_from_unzip_locked(
        &self,
        inner: &mut MutexGuard<'_, PoolInner>,
        n_iterations: usize,
    ) -> bool {
        if n_iterations >= 5 {
            return false;
        }
        if !inner.should_evict_unzip(
            self.config.unzip_lru_pct,
            self.config.lru_io_to_unzip_factor,
            self.live.snapshot(),
        ) {
            return false;
        }

        let mut distance = 100 + n_iterations * inner.unzip.len() / 5;
        let mut cursor = inner.unzip.tail();
        while let Some(slot) = cursor {
            if distance == 0 {
                break;
            }
            debug_assert_eq!(self.arena.get(slot).state(), PageState::FilePage);
            debug_assert!(inner.lru.contains(slot));

            let prev = inner.unzip.prev(slot);
            let outcome = self.free_block_locked(inner, slot, false);
            if outcome.freed {
                // The compressed page stays resident.
                debug_assert!(!outcome.fully_removed);
                return true;
            }
            cursor = prev;
            distance -= 1;
        }
        false
    }

    /// Free a clean block from the main LRU tail. Returns whether one
    /// was freed, the space it belonged to when it left the LRU
    /// entirely, and the number of blocks inspected.
    pub(crate) fn free_from_common_locked(
        &self,
        inner: &mut MutexGuard<'_, PoolInner>,
        n_iterations: usize,
        limit: Option<usize>,
    ) -> (bool, Option<u32>, usize) {
        let init_distance =
            limit.unwrap_or(100 + n_iterations * self.config.curr_size / 10);
        let mut distance = init_distance;

        let mut cursor = inner.lru.tail();
        while let Some(slot) = cursor {
            if distance == 0 {
                break;
            }
            let desc = self.arena.get(slot);
            debug_assert!(desc.in_file());

            let prev = inner.lru.prev(slot);
            let accessed = desc.access_time_ms() != 0;
            let space = desc.id().space;

            let outcome = self.free_block_locked(inner, slot, true);
            if outcome.freed {
                if !accessed {
                    // Read ahead brought the page in for nothing.
                    inner.ra_evicted += 1;
                }
                let evicted_space = outcome.fully_removed.then_some(space);
                return (true, evicted_space, init_distance - distance + 1);
            }
            cursor = prev;
            distance -= 1;
        }
        (false, None, init_distance - distance + 1)
    }

    /// Try to free one replaceable block, preferring the unzip-LRU when
    /// the policy selects it. With `want_block`, a free block is popped
    /// for the caller before the pool mutex is released.
    pub(crate) fn search_and_free_locked(
        &self,
        inner: &mut MutexGuard<'_, PoolInner>,
        n_iterations: usize,
        want_block: bool,
    ) -> SearchOutcome {
        inner.searches_performed += 1;

        let mut freed = self.free_from_unzip_locked(inner, n_iterations);
        let mut evicted_space = None;
        let mut nsearched = 0;

        if !freed {
            // In fast-free-list mode the first iteration's scan is
            // capped: the flusher is about to be asked for margin anyway,
            // so searching deep into the LRU buys little.
            let limit = (want_block && self.config.fast_free_list && n_iterations == 1)
                .then_some(FREE_SEARCH_LEN);
            let (f, space, n) = self.free_from_common_locked(inner, n_iterations, limit);
            freed = f;
            evicted_space = space;
            nsearched = n;
        }

        let mut block = None;
        if !freed {
            inner.lru_flush_ended = 0;
        } else {
            if inner.lru_flush_ended > 0 {
                inner.lru_flush_ended -= 1;
            }
            if want_block {
                block = inner.get_free_only(&self.arena);
            }
        }

        SearchOutcome {
            freed,
            block,
            nsearched,
            evicted_space,
        }
    }

    /// Whether the next victim would come from the unzip-LRU under the
    /// current list lengths and rate window.
    pub fn evict_from_unzip_lru(&self) -> bool {
        let inner = self.inner.lock();
        inner.should_evict_unzip(
            self.config.unzip_lru_pct,
            self.config.lru_io_to_unzip_factor,
            self.live.snapshot(),
        )
    }

    /// Public entry: search the lists once and free one block if
    /// possible.
    pub fn search_and_free(&self, n_iterations: usize) -> bool {
        let mut inner = self.inner.lock();
        let outcome = self.search_and_free_locked(&mut inner, n_iterations, false);
        drop(inner);
        if let Some(space) = outcome.evicted_space {
            self.hooks.space_dir.lru_count(space, -1);
        }
        outcome.freed
    }
}

// ============================================================================
// Tests
// ============================================================================
