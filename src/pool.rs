// # Buffer Pool - Replacement Engine Core
//
// Process-wide pool of page descriptors plus the list structures the
// replacement policy runs on. One pool mutex guards every list, the
// old-sublist pointer, the page hash and the stat window; per-descriptor
// state (pins, I/O fixes, stickiness) is atomic and accessor-touchable
// without it. Eviction decisions depend on global list lengths, so the
// lists are deliberately not sharded.
//
// ## Architecture
//
// ```text
// ┌──────────────────────────────────────────────────────────┐
// │                      BufferPool                          │
// ├──────────────────────────────────────────────────────────┤
// │  DescriptorArena (frame slots | spare zip slots)         │
// ├──────────────────────────────────────────────────────────┤
// │  PoolInner (pool mutex)                                  │
// │    LRU list  ──young──►│LRU_old│──old──►  tail           │
// │    unzip-LRU list      free list       flush list        │
// │    page hash           stat window     freed_page_clock  │
// └──────────────────────────────────────────────────────────┘
//          │                  │                  │
//          ▼                  ▼                  ▼
//    FlushScheduler     SpaceDirectory     PageReader / AHI
// ```

use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crate::config::{clamp_old_ratio, PoolConfig, NON_OLD_MIN_LEN, OLD_MIN_LEN, OLD_RATIO_DIV, OLD_TOLERANCE};
use crate::descriptor::DescriptorArena;
use crate::error::{PoolError, Result};
use crate::hooks::Collaborators;
use crate::list::{IndexList, SlotId};
use crate::page::{IoFix, PageFrame, PageId, PageState, ZipFrame};
use crate::stats::{LiveCounters, StatWindow};

// ============================================================================
// Inner state (pool mutex)
// ============================================================================

pub(crate) struct PoolInner {
    /// Main recency list, head = most recently used.
    pub(crate) lru: IndexList,

    /// Descriptors in state NOT_USED, ready to hand out.
    pub(crate) free: IndexList,

    /// FILE_PAGE descriptors that also carry a compressed frame.
    pub(crate) unzip: IndexList,

    /// Dirty descriptors awaiting write, newest modification first.
    pub(crate) flush: IndexList,

    /// Clean standalone compressed descriptors, mirrored in LRU order.
    #[cfg(debug_assertions)]
    pub(crate) zip_clean: IndexList,

    /// First block of the old sublist, `None` while the LRU is shorter
    /// than `OLD_MIN_LEN`.
    pub(crate) lru_old: Option<SlotId>,
    pub(crate) lru_old_len: usize,

    /// Target old fraction in 1024ths.
    pub(crate) old_ratio: u32,

    /// Monotonic eviction clock, ticked on every removal-for-free.
    pub(crate) freed_page_clock: u64,

    /// Credit of LRU-flush completions that may be harvested into free
    /// blocks; cleared when an eviction search comes up empty.
    pub(crate) lru_flush_ended: usize,

    /// Resident-page index: identity to arena slot.
    pub(crate) page_hash: HashMap<PageId, SlotId>,

    /// Spare descriptor slots for standalone compressed pages.
    pub(crate) spare: Vec<SlotId>,

    /// Rolling I/O-vs-unzip window feeding the eviction choice.
    pub(crate) window: StatWindow,

    pub(crate) made_young: u64,
    pub(crate) ra_evicted: u64,

    /// Victim searches run against the list tails.
    pub(crate) searches_performed: u64,
}

impl PoolInner {
    pub(crate) fn new(config: &PoolConfig, arena: &DescriptorArena) -> Self {
        let capacity = arena.capacity();
        let mut free = IndexList::new(capacity);
        for slot in arena.frame_slots() {
            free.push_back(slot);
        }
        Self {
            lru: IndexList::new(capacity),
            free,
            unzip: IndexList::new(capacity),
            flush: IndexList::new(capacity),
            #[cfg(debug_assertions)]
            zip_clean: IndexList::new(capacity),
            lru_old: None,
            lru_old_len: 0,
            old_ratio: clamp_old_ratio(config.old_ratio),
            freed_page_clock: 0,
            lru_flush_ended: 0,
            page_hash: HashMap::with_capacity(capacity),
            spare: arena.spare_slots().rev().collect(),
            window: StatWindow::new(),
            made_young: 0,
            ra_evicted: 0,
            searches_performed: 0,
        }
    }

    /// Remove a descriptor from the flush list and mark it clean. A
    /// dirty compressed-only page becomes a clean one.
    pub(crate) fn flush_remove(&mut self, arena: &DescriptorArena, slot: SlotId) {
        debug_assert!(self.flush.contains(slot));
        self.flush.remove(slot);
        let desc = arena.get(slot);
        desc.set_oldest_modification(0);
        if desc.state() == PageState::ZipDirty {
            desc.set_state(PageState::ZipPage);
            #[cfg(debug_assertions)]
            self.insert_zip_clean(arena, slot);
        }
    }

    /// Replace `slot` with `to` on the flush list, preserving position.
    /// The displaced descriptor comes out clean; `to` must already carry
    /// the modification LSN.
    pub(crate) fn flush_relocate(&mut self, arena: &DescriptorArena, slot: SlotId, to: SlotId) {
        debug_assert!(self.flush.contains(slot));
        debug_assert!(arena.get(to).is_dirty());
        let prev = self.flush.prev(slot);
        self.flush.remove(slot);
        match prev {
            Some(prev) => self.flush.insert_after(prev, to),
            None => self.flush.push_front(to),
        }
        arena.get(slot).set_oldest_modification(0);
    }

    /// Insert a clean compressed descriptor into `zip_clean`, keeping the
    /// list ordered consistently with the LRU.
    #[cfg(debug_assertions)]
    pub(crate) fn insert_zip_clean(&mut self, arena: &DescriptorArena, slot: SlotId) {
        debug_assert_eq!(arena.get(slot).state(), PageState::ZipPage);
        debug_assert!(!self.zip_clean.contains(slot));

        // First successor of `slot` in the LRU that is also compressed-only.
        let mut cursor = self.lru.next(slot);
        while let Some(candidate) = cursor {
            if arena.get(candidate).state() == PageState::ZipPage {
                break;
            }
            cursor = self.lru.next(candidate);
        }
        match cursor.and_then(|successor| self.zip_clean.prev(successor)) {
            Some(before) => self.zip_clean.insert_after(before, slot),
            // No compressed successor, or the successor leads the list.
            None => self.zip_clean.push_front(slot),
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Snapshot of pool-level counters and list lengths.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub lru_len: usize,
    pub lru_old_len: usize,
    pub unzip_lru_len: usize,
    pub free_len: usize,
    pub flush_len: usize,
    pub freed_page_clock: u64,
    pub pages_made_young: u64,
    pub readahead_evicted: u64,
    pub searches_performed: u64,
    pub wait_free: u64,
}

/// The buffer-pool replacement engine.
pub struct BufferPool {
    pub(crate) arena: DescriptorArena,
    pub(crate) inner: Mutex<PoolInner>,
    pub(crate) hooks: Collaborators,
    pub(crate) config: PoolConfig,
    old_threshold_ms: AtomicU64,
    pub(crate) live: LiveCounters,
    shutdown: AtomicBool,
    pub(crate) pressure_warned: AtomicBool,
    pub(crate) wait_free: AtomicU64,
    epoch: Instant,
}

impl BufferPool {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_collaborators(config, Collaborators::default())
    }

    pub fn with_collaborators(config: PoolConfig, hooks: Collaborators) -> Self {
        // One spare descriptor per frame bounds relocation: a partial
        // eviction consumes one spare and frees one frame.
        let arena = DescriptorArena::new(config.curr_size, config.curr_size);
        let inner = PoolInner::new(&config, &arena);
        Self {
            arena,
            inner: Mutex::new(inner),
            hooks,
            old_threshold_ms: AtomicU64::new(config.old_threshold_ms),
            live: LiveCounters::default(),
            shutdown: AtomicBool::new(false),
            pressure_warned: AtomicBool::new(false),
            wait_free: AtomicU64::new(0),
            epoch: Instant::now(),
            config,
        }
    }

    #[inline]
    pub fn curr_size(&self) -> usize {
        self.config.curr_size
    }

    /// Direct descriptor access for accessors that already hold a slot.
    #[inline]
    pub fn descriptor(&self, slot: SlotId) -> &crate::descriptor::Descriptor {
        self.arena.get(slot)
    }

    #[inline]
    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Signal cooperative shutdown; long bulk operations exit promptly.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Lookup, pinning, touching
    // ------------------------------------------------------------------

    /// Resident-page lookup by identity.
    pub fn lookup(&self, id: PageId) -> Option<SlotId> {
        self.inner.lock().page_hash.get(&id).copied()
    }

    /// Pin a resident page for access and apply the promotion policy.
    pub fn pin_page(&self, id: PageId) -> Option<PinGuard<'_>> {
        let mut inner = self.inner.lock();
        let slot = *inner.page_hash.get(&id)?;
        let desc = self.arena.get(slot);
        desc.pin();
        self.touch_locked(&mut inner, slot);
        drop(inner);
        Some(PinGuard { pool: self, slot })
    }

    /// Pin by slot without the access-time bookkeeping.
    pub fn pin_slot(&self, slot: SlotId) -> PinGuard<'_> {
        self.arena.get(slot).pin();
        PinGuard { pool: self, slot }
    }

    /// Record an access and promote an old-sublist page that has been
    /// resident at least `old_threshold_ms`.
    pub fn touch(&self, slot: SlotId) {
        let mut inner = self.inner.lock();
        self.touch_locked(&mut inner, slot);
    }

    fn touch_locked(&self, inner: &mut PoolInner, slot: SlotId) {
        let desc = self.arena.get(slot);
        let now = self.now_ms();
        let first_access = desc.mark_accessed(now);
        if desc.is_old()
            && now.saturating_sub(first_access) >= self.old_threshold_ms.load(Ordering::Relaxed)
        {
            inner.make_young(&self.arena, slot);
        }
    }

    /// Move a block to the head of the LRU unconditionally.
    pub fn make_young(&self, slot: SlotId) {
        self.inner.lock().make_young(&self.arena, slot);
    }

    /// Move a block to the tail of the LRU, aging it out early.
    pub fn make_block_old(&self, slot: SlotId) {
        let mut inner = self.inner.lock();
        inner.lru_remove(&self.arena, slot);
        inner.lru_add_to_end(&self.arena, slot);
    }

    // ------------------------------------------------------------------
    // Residency
    // ------------------------------------------------------------------

    /// Publish a freshly read page: hash it and link it into the LRU.
    ///
    /// New residents enter at the head of the old sublist for scan
    /// resistance; pass `young = true` for pages known to be hot.
    pub fn install_page(
        &self,
        slot: SlotId,
        id: PageId,
        zip: Option<ZipFrame>,
        young: bool,
    ) -> Result<()> {
        let desc = self.arena.get(slot);
        debug_assert_eq!(desc.state(), PageState::ReadyForUse);

        let mut inner = self.inner.lock();
        if inner.page_hash.contains_key(&id) {
            return Err(PoolError::AlreadyResident(id));
        }
        desc.set_id(id);
        if let Some(frame) = zip {
            desc.put_zip(frame);
        }
        desc.set_state(PageState::FilePage);
        inner.page_hash.insert(id, slot);
        inner.lru_add(&self.arena, slot, !young);
        drop(inner);

        self.hooks.space_dir.lru_count(id.space, 1);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dirtiness and I/O fixes
    // ------------------------------------------------------------------

    /// Record the first unflushed modification of a page.
    pub fn mark_dirty(&self, slot: SlotId, lsn: u64) {
        debug_assert!(lsn != 0);
        let desc = self.arena.get(slot);
        let mut inner = self.inner.lock();
        if desc.oldest_modification() == 0 {
            desc.set_oldest_modification(lsn);
            if desc.state() == PageState::ZipPage {
                #[cfg(debug_assertions)]
                inner.zip_clean.remove(slot);
                desc.set_state(PageState::ZipDirty);
            }
            inner.flush.push_front(slot);
        }
    }

    /// Flush-scheduler callback: the page reached disk, drop it from the
    /// flush list.
    pub fn write_complete(&self, slot: SlotId) {
        let mut inner = self.inner.lock();
        inner.flush_remove(&self.arena, slot);
    }

    /// Mark an I/O in flight on the descriptor.
    pub fn begin_io(&self, slot: SlotId, fix: IoFix) {
        let desc = self.arena.get(slot);
        debug_assert_eq!(desc.io_fix(), IoFix::None);
        debug_assert_ne!(fix, IoFix::None);
        desc.set_io_fix(fix);
    }

    pub fn complete_io(&self, slot: SlotId) {
        self.arena.get(slot).set_io_fix(IoFix::None);
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Accessor-side counter: a page I/O completed.
    #[inline]
    pub fn stat_inc_io(&self) {
        self.live.inc_io();
    }

    /// Accessor-side counter: a page was decompressed.
    #[inline]
    pub fn stat_inc_unzip(&self) {
        self.live.inc_unzip();
    }

    /// Interval tick, nominally once per second. Rolls the live counter
    /// pair into the window; until eviction starts only the live pair is
    /// cleared.
    pub fn stat_tick(&self) {
        let sample = self.live.snapshot();
        {
            let mut inner = self.inner.lock();
            if inner.freed_page_clock > 0 {
                inner.window.roll(sample);
            }
        }
        self.live.clear();
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            lru_len: inner.lru.len(),
            lru_old_len: inner.lru_old_len,
            unzip_lru_len: inner.unzip.len(),
            free_len: inner.free.len(),
            flush_len: inner.flush.len(),
            freed_page_clock: inner.freed_page_clock,
            pages_made_young: inner.made_young,
            readahead_evicted: inner.ra_evicted,
            searches_performed: inner.searches_performed,
            wait_free: self.wait_free.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------
    // Tunables
    // ------------------------------------------------------------------

    /// Update the old-sublist target ratio (1024ths, clamped). With
    /// `adjust`, the old pointer is walked to the new target at once.
    /// Returns the ratio actually stored.
    pub fn set_old_ratio(&self, ratio: u32, adjust: bool) -> u32 {
        let ratio = clamp_old_ratio(ratio);
        let mut inner = self.inner.lock();
        if ratio != inner.old_ratio {
            inner.old_ratio = ratio;
            if adjust && inner.lru.len() >= OLD_MIN_LEN {
                inner.old_adjust(&self.arena);
            }
        }
        ratio
    }

    pub fn set_old_threshold_ms(&self, ms: u64) {
        self.old_threshold_ms.store(ms, Ordering::Relaxed);
    }

    /// Flush-scheduler callback: an LRU flush batch of `n` pages ended,
    /// the blocks may be harvested into the free list.
    pub fn note_lru_flush_completed(&self, n: usize) {
        self.inner.lock().lru_flush_ended += n;
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Walk every list and assert the structural invariants. Meant for
    /// tests and debug builds; cost is linear in the pool size.
    pub fn validate(&self) {
        let inner = self.inner.lock();

        if inner.lru.len() >= OLD_MIN_LEN {
            assert!(inner.lru_old.is_some(), "old pointer missing on a long LRU");
            let target = (inner.lru.len() * inner.old_ratio as usize / OLD_RATIO_DIV as usize)
                .min(inner.lru.len() - (OLD_TOLERANCE + NON_OLD_MIN_LEN));
            let drift = inner.lru_old_len as i64 - target as i64;
            assert!(
                drift.unsigned_abs() as usize <= OLD_TOLERANCE,
                "old sublist length {} drifted from target {}",
                inner.lru_old_len,
                target
            );
        } else {
            assert!(inner.lru_old.is_none());
            assert_eq!(inner.lru_old_len, 0);
        }

        let mut old_seen = 0usize;
        for slot in inner.lru.iter() {
            let desc = self.arena.get(slot);
            assert!(desc.in_file(), "non-resident state on LRU: {:?}", desc.state());
            if desc.state() == PageState::FilePage {
                assert_eq!(inner.unzip.contains(slot), desc.belongs_to_unzip_lru());
            }
            assert_eq!(
                inner.page_hash.get(&desc.id()).copied(),
                Some(slot),
                "page hash disagrees with LRU for {}",
                desc.id()
            );
            if desc.is_dirty() {
                assert!(inner.flush.contains(slot));
            }
            if desc.is_old() {
                if old_seen == 0 {
                    assert_eq!(inner.lru_old, Some(slot), "first old block is not LRU_old");
                }
                old_seen += 1;
                if let Some(next) = inner.lru.next(slot) {
                    assert!(self.arena.get(next).is_old(), "old flag not contiguous");
                }
            }
        }
        assert_eq!(inner.lru_old_len, old_seen);

        for slot in inner.free.iter() {
            assert_eq!(self.arena.get(slot).state(), PageState::NotUsed);
            assert!(!inner.lru.contains(slot), "descriptor on free and LRU at once");
        }

        for slot in inner.unzip.iter() {
            assert!(inner.lru.contains(slot));
            assert!(self.arena.get(slot).belongs_to_unzip_lru());
        }

        for slot in inner.flush.iter() {
            assert!(self.arena.get(slot).is_dirty());
        }
    }
}

// ============================================================================
// Pin guard
// ============================================================================

/// RAII accessor pin. While the guard lives the page cannot be evicted
/// or relocated; dropping it releases the pin.
pub struct PinGuard<'a> {
    pool: &'a BufferPool,
    slot: SlotId,
}

impl PinGuard<'_> {
    #[inline]
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    #[inline]
    pub fn id(&self) -> PageId {
        self.pool.arena.get(self.slot).id()
    }

    /// Read access to the uncompressed frame.
    pub fn read(&self) -> RwLockReadGuard<'_, PageFrame> {
        self.pool.arena.get(self.slot).frame().read()
    }

    /// Write access to the uncompressed frame. Dirtiness is tracked via
    /// `BufferPool::mark_dirty`, not by taking this lock.
    pub fn write(&self) -> RwLockWriteGuard<'_, PageFrame> {
        self.pool.arena.get(self.slot).frame().write()
    }
}

impl Drop for PinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.pool.arena.get(self.slot).unpin();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    fn small_pool() -> BufferPool {
        BufferPool::new(PoolConfig::builder().curr_size(16).build())
    }

    fn fault_page(pool: &BufferPool, space: u32, page_no: u32) -> SlotId {
        let slot = pool.get_free_block();
        pool.install_page(slot, PageId::new(space, page_no), None, false)
            .unwrap();
        slot
    }

    #[test]
    fn install_makes_a_page_resident_and_hashed() {
        let pool = small_pool();
        let id = PageId::new(1, 7);
        let slot = fault_page(&pool, 1, 7);

        assert_eq!(pool.lookup(id), Some(slot));
        let stats = pool.stats();
        assert_eq!(stats.lru_len, 1);
        assert_eq!(stats.free_len, 15);
        pool.validate();
    }

    #[test]
    fn double_install_is_rejected() {
        let pool = small_pool();
        fault_page(&pool, 1, 7);
        let slot = pool.get_free_block();
        let err = pool
            .install_page(slot, PageId::new(1, 7), None, false)
            .unwrap_err();
        assert!(matches!(err, PoolError::AlreadyResident(_)));
    }

    #[test]
    fn pin_guard_releases_on_drop() {
        let pool = small_pool();
        let slot = fault_page(&pool, 1, 1);

        {
            let guard = pool.pin_page(PageId::new(1, 1)).unwrap();
            assert_eq!(guard.slot(), slot);
            assert_eq!(pool.arena.get(slot).buf_fix_count(), 1);
        }
        assert_eq!(pool.arena.get(slot).buf_fix_count(), 0);
    }

    #[test]
    fn mark_dirty_and_write_complete_track_the_flush_list() {
        let pool = small_pool();
        let slot = fault_page(&pool, 1, 1);

        pool.mark_dirty(slot, 42);
        assert!(pool.arena.get(slot).is_dirty());
        assert_eq!(pool.stats().flush_len, 1);

        // A second modification keeps the oldest LSN.
        pool.mark_dirty(slot, 99);
        assert_eq!(pool.arena.get(slot).oldest_modification(), 42);

        pool.write_complete(slot);
        assert!(!pool.arena.get(slot).is_dirty());
        assert_eq!(pool.stats().flush_len, 0);
        pool.validate();
    }

    #[test]
    fn stat_tick_is_inert_until_eviction_starts() {
        let pool = small_pool();
        pool.stat_inc_io();
        pool.stat_tick();
        // Nothing was folded into the window, but the live pair cleared.
        assert_eq!(pool.live.snapshot(), crate::stats::IntervalSample::default());

        pool.inner.lock().freed_page_clock = 1;
        pool.stat_inc_io();
        pool.stat_tick();
        let inner = pool.inner.lock();
        let (io_avg, _) = inner.window.averages(crate::stats::IntervalSample::default());
        assert!(io_avg > 0.0);
    }

    #[test]
    fn make_block_old_sends_a_page_to_the_tail() {
        let pool = small_pool();
        for page_no in 0..5u32 {
            fault_page(&pool, 1, page_no);
        }
        let slot = pool.lookup(PageId::new(1, 4)).unwrap();
        assert_eq!(pool.inner.lock().lru.head(), Some(slot));

        pool.make_block_old(slot);
        assert_eq!(pool.inner.lock().lru.tail(), Some(slot));
        pool.validate();
    }

    #[test]
    fn old_ratio_updates_are_clamped() {
        let pool = small_pool();
        assert_eq!(pool.set_old_ratio(1, true), crate::config::OLD_RATIO_MIN);
        assert_eq!(pool.set_old_ratio(4096, true), crate::config::OLD_RATIO_MAX);
    }
}
