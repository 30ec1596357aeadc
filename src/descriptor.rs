// # Page Descriptors
//
// One descriptor per potentially-resident page. List linkage lives in the
// pool (see `list.rs`); the descriptor carries the per-page state that
// accessors read and write without the pool mutex: pin count, I/O fix,
// sticky flag, dirty LSN, access timestamp. Each field is individually
// atomic in the manner of a per-block mutex; compound decisions re-check
// under the pool mutex.

use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::list::SlotId;
use crate::page::{IoFix, PageFrame, PageId, PageState, ZipFrame, INVALID_PAGE_ID};

// ============================================================================
// Descriptor
// ============================================================================

/// Metadata record for one page slot.
///
/// Frame-backed descriptors own an uncompressed frame for their whole
/// life; spare descriptors never have one and only ever represent
/// compressed-only pages produced by partial eviction.
pub struct Descriptor {
    /// Packed page identity, `INVALID_PAGE_ID` when none.
    id: AtomicU64,

    state: AtomicU8,

    /// Number of outstanding accessor pins. Nonzero forbids relocation
    /// and eviction.
    buf_fix_count: AtomicU32,

    io_fix: AtomicU8,

    /// Relocation-forbidden flag used to anchor list iterators across
    /// dropped locks. Independent of the pin count.
    sticky: AtomicBool,

    /// Whether the page sits in the old sublist of the LRU. Written under
    /// the pool mutex, readable anywhere.
    old: AtomicBool,

    /// LSN of the earliest unflushed modification; 0 when clean.
    oldest_modification: AtomicU64,

    /// Pool eviction-clock value at the last youngening.
    freed_page_clock: AtomicU64,

    /// Milliseconds (pool epoch) of the first access after the page
    /// became resident; 0 when never accessed.
    access_time_ms: AtomicU64,

    /// Whether the adaptive hash index may hold entries for this page.
    ahi_attached: AtomicBool,

    /// Size of the attached compressed frame, 0 when none. Mirrors the
    /// `zip` slot for lock-free membership checks.
    zip_size: AtomicUsize,

    zip: Mutex<Option<ZipFrame>>,

    frame: Option<Box<RwLock<PageFrame>>>,
}

impl Descriptor {
    fn new(with_frame: bool) -> Self {
        Self {
            id: AtomicU64::new(INVALID_PAGE_ID),
            state: AtomicU8::new(PageState::NotUsed as u8),
            buf_fix_count: AtomicU32::new(0),
            io_fix: AtomicU8::new(IoFix::None as u8),
            sticky: AtomicBool::new(false),
            old: AtomicBool::new(false),
            oldest_modification: AtomicU64::new(0),
            freed_page_clock: AtomicU64::new(0),
            access_time_ms: AtomicU64::new(0),
            ahi_attached: AtomicBool::new(false),
            zip_size: AtomicUsize::new(0),
            zip: Mutex::new(None),
            frame: with_frame.then(|| Box::new(RwLock::new(PageFrame::new()))),
        }
    }

    // ------------------------------------------------------------------
    // Identity and state
    // ------------------------------------------------------------------

    #[inline(always)]
    pub fn id(&self) -> PageId {
        PageId::from_packed(self.id.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_id(&self, id: PageId) {
        self.id.store(id.to_packed(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn clear_id(&self) {
        self.id.store(INVALID_PAGE_ID, Ordering::Release);
    }

    #[inline(always)]
    pub fn state(&self) -> PageState {
        PageState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, to: PageState) {
        debug_assert!(
            self.state().can_transition(to),
            "illegal state transition {:?} -> {:?} for {}",
            self.state(),
            to,
            self.id()
        );
        self.state.store(to as u8, Ordering::Release);
    }

    #[inline]
    pub fn in_file(&self) -> bool {
        self.state().is_in_file()
    }

    // ------------------------------------------------------------------
    // Pins, I/O fixes, stickiness
    // ------------------------------------------------------------------

    #[inline(always)]
    pub fn buf_fix_count(&self) -> u32 {
        self.buf_fix_count.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn pin(&self) {
        self.buf_fix_count.fetch_add(1, Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn unpin(&self) {
        let old = self.buf_fix_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "unpin of unpinned descriptor {}", self.id());
    }

    #[inline(always)]
    pub fn io_fix(&self) -> IoFix {
        IoFix::from_raw(self.io_fix.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_io_fix(&self, fix: IoFix) {
        self.io_fix.store(fix as u8, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_sticky(&self) -> bool {
        self.sticky.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_sticky(&self, sticky: bool) {
        self.sticky.store(sticky, Ordering::Release);
    }

    /// A descriptor may be moved or evicted only when nobody pins it, no
    /// I/O is in flight, and no iterator anchored it.
    #[inline]
    pub fn can_relocate(&self) -> bool {
        self.buf_fix_count() == 0 && self.io_fix() == IoFix::None && !self.is_sticky()
    }

    // ------------------------------------------------------------------
    // Recency bookkeeping
    // ------------------------------------------------------------------

    #[inline(always)]
    pub fn is_old(&self) -> bool {
        self.old.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_old(&self, old: bool) {
        self.old.store(old, Ordering::Release);
    }

    #[inline]
    pub fn access_time_ms(&self) -> u64 {
        self.access_time_ms.load(Ordering::Relaxed)
    }

    /// Record the first access; later accesses keep the original stamp.
    /// Returns the stamp in effect afterwards.
    #[inline]
    pub(crate) fn mark_accessed(&self, now_ms: u64) -> u64 {
        let stamp = now_ms.max(1);
        match self.access_time_ms.compare_exchange(
            0,
            stamp,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => stamp,
            Err(existing) => existing,
        }
    }

    #[inline]
    pub(crate) fn clear_access_time(&self) {
        self.access_time_ms.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn freed_page_clock(&self) -> u64 {
        self.freed_page_clock.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_freed_page_clock(&self, clock: u64) {
        self.freed_page_clock.store(clock, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Dirtiness
    // ------------------------------------------------------------------

    #[inline(always)]
    pub fn oldest_modification(&self) -> u64 {
        self.oldest_modification.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_oldest_modification(&self, lsn: u64) {
        self.oldest_modification.store(lsn, Ordering::Release);
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.oldest_modification() != 0
    }

    // ------------------------------------------------------------------
    // Adaptive hash attachment
    // ------------------------------------------------------------------

    #[inline]
    pub fn ahi_attached(&self) -> bool {
        self.ahi_attached.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_ahi_attached(&self, attached: bool) {
        self.ahi_attached.store(attached, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    /// Compressed frame size, 0 when the descriptor has none.
    #[inline(always)]
    pub fn zip_size(&self) -> usize {
        self.zip_size.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_zip(&self) -> bool {
        self.zip_size() != 0
    }

    pub(crate) fn put_zip(&self, frame: ZipFrame) {
        let mut slot = self.zip.lock();
        debug_assert!(slot.is_none(), "descriptor {} already carries a zip frame", self.id());
        self.zip_size.store(frame.size(), Ordering::Release);
        *slot = Some(frame);
    }

    pub(crate) fn take_zip(&self) -> Option<ZipFrame> {
        let mut slot = self.zip.lock();
        self.zip_size.store(0, Ordering::Release);
        slot.take()
    }

    pub fn zip(&self) -> MutexGuard<'_, Option<ZipFrame>> {
        self.zip.lock()
    }

    #[inline]
    pub fn has_frame(&self) -> bool {
        self.frame.is_some()
    }

    /// Uncompressed frame; panics on a spare (compressed-only) slot.
    #[inline]
    pub fn frame(&self) -> &RwLock<PageFrame> {
        self.frame
            .as_deref()
            .unwrap_or_else(|| panic!("descriptor {} has no uncompressed frame", self.id()))
    }

    /// FILE_PAGE with an attached compressed frame: the uncompressed
    /// frame is separately evictable, so the page belongs on the
    /// unzip-LRU.
    #[inline]
    pub fn belongs_to_unzip_lru(&self) -> bool {
        self.state() == PageState::FilePage && self.has_zip()
    }

    /// Reset accounting when the slot is handed out from the free list.
    pub(crate) fn reset_for_use(&self) {
        debug_assert_eq!(self.buf_fix_count(), 0);
        debug_assert_eq!(self.io_fix(), IoFix::None);
        debug_assert!(!self.is_sticky());
        debug_assert_eq!(self.zip_size(), 0);
        self.clear_id();
        self.set_oldest_modification(0);
        self.clear_access_time();
        self.set_old(false);
        self.set_freed_page_clock(0);
        self.set_ahi_attached(false);
    }
}

// ============================================================================
// Arena
// ============================================================================

/// Fixed arena of descriptor slots. The first `n_frames` slots are
/// frame-backed; the remainder are spares for standalone compressed
/// descriptors. Slots are never deallocated, so a `SlotId` stays valid
/// for the life of the pool.
pub struct DescriptorArena {
    slots: Box<[Descriptor]>,
    n_frames: usize,
}

impl DescriptorArena {
    pub fn new(n_frames: usize, n_spare: usize) -> Self {
        let mut slots = Vec::with_capacity(n_frames + n_spare);
        for _ in 0..n_frames {
            slots.push(Descriptor::new(true));
        }
        for _ in 0..n_spare {
            slots.push(Descriptor::new(false));
        }
        Self {
            slots: slots.into_boxed_slice(),
            n_frames,
        }
    }

    #[inline(always)]
    pub fn get(&self, slot: SlotId) -> &Descriptor {
        &self.slots[slot as usize]
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.n_frames
    }

    #[inline]
    pub fn is_frame_slot(&self, slot: SlotId) -> bool {
        (slot as usize) < self.n_frames
    }

    pub fn frame_slots(&self) -> std::ops::Range<SlotId> {
        0..self.n_frames as SlotId
    }

    pub fn spare_slots(&self) -> std::ops::Range<SlotId> {
        self.n_frames as SlotId..self.capacity() as SlotId
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_and_unpin_balance() {
        let desc = Descriptor::new(true);
        desc.pin();
        desc.pin();
        assert_eq!(desc.buf_fix_count(), 2);
        assert!(!desc.can_relocate());
        desc.unpin();
        desc.unpin();
        assert!(desc.can_relocate());
    }

    #[test]
    fn io_fix_and_sticky_block_relocation() {
        let desc = Descriptor::new(true);
        assert!(desc.can_relocate());

        desc.set_io_fix(IoFix::Read);
        assert!(!desc.can_relocate());
        desc.set_io_fix(IoFix::None);

        desc.set_sticky(true);
        assert!(!desc.can_relocate());
        desc.set_sticky(false);
        assert!(desc.can_relocate());
    }

    #[test]
    fn first_access_stamp_is_stable() {
        let desc = Descriptor::new(true);
        assert_eq!(desc.access_time_ms(), 0);
        let first = desc.mark_accessed(100);
        assert_eq!(first, 100);
        // A later access keeps the original stamp.
        assert_eq!(desc.mark_accessed(500), 100);
    }

    #[test]
    fn zip_frame_attach_detach() {
        let desc = Descriptor::new(true);
        assert!(!desc.has_zip());
        desc.put_zip(ZipFrame::new(2048));
        assert_eq!(desc.zip_size(), 2048);

        let frame = desc.take_zip().unwrap();
        assert_eq!(frame.size(), 2048);
        assert!(!desc.has_zip());
    }

    #[test]
    fn arena_partitions_frame_and_spare_slots() {
        let arena = DescriptorArena::new(4, 2);
        assert_eq!(arena.capacity(), 6);
        assert_eq!(arena.frame_count(), 4);
        assert!(arena.is_frame_slot(3));
        assert!(!arena.is_frame_slot(4));
        assert!(arena.get(0).has_frame());
        assert!(!arena.get(5).has_frame());
    }
}
