// # LRU List Maintenance
//
// The recency list with its old/young partition, and the parallel
// unzip-LRU of decompressed frames. All entry points here run under the
// pool mutex.
//
// New residents enter at the head of the old sublist rather than the
// list head: a page touched exactly once by a scan ages out without
// displacing the working set. The `LRU_old` pointer is kept within
// `OLD_TOLERANCE` blocks of `len * old_ratio / 1024` by walking it one
// step at a time after every structural change.

use crate::config::{NON_OLD_MIN_LEN, OLD_MIN_LEN, OLD_RATIO_DIV, OLD_RATIO_MAX, OLD_RATIO_MIN, OLD_TOLERANCE};
use crate::descriptor::DescriptorArena;
use crate::list::SlotId;
use crate::pool::PoolInner;

impl PoolInner {
    // ------------------------------------------------------------------
    // Old-pointer maintenance
    // ------------------------------------------------------------------

    /// Walk `LRU_old` until the old-sublist length is within
    /// `OLD_TOLERANCE` of the target. Each step moves the pointer one
    /// block and flips one `old` flag.
    pub(crate) fn old_adjust(&mut self, arena: &DescriptorArena) {
        debug_assert!(self.lru_old.is_some());
        debug_assert!((OLD_RATIO_MIN..=OLD_RATIO_MAX).contains(&self.old_ratio));

        let len = self.lru.len();
        let new_len = (len * self.old_ratio as usize / OLD_RATIO_DIV as usize)
            .min(len - (OLD_TOLERANCE + NON_OLD_MIN_LEN));

        loop {
            let old_slot = self.lru_old.expect("old pointer lost during adjust");
            debug_assert!(self.lru.contains(old_slot));
            debug_assert!(arena.get(old_slot).is_old());

            if self.lru_old_len + OLD_TOLERANCE < new_len {
                // Grow the old sublist: the predecessor becomes old.
                let prev = self
                    .lru
                    .prev(old_slot)
                    .expect("old pointer would pass the list head");
                debug_assert!(!arena.get(prev).is_old());
                self.lru_old = Some(prev);
                arena.get(prev).set_old(true);
                self.lru_old_len += 1;
            } else if self.lru_old_len > new_len + OLD_TOLERANCE {
                // Shrink: the first old block becomes young.
                let next = self
                    .lru
                    .next(old_slot)
                    .expect("old pointer would pass the list tail");
                self.lru_old = Some(next);
                arena.get(old_slot).set_old(false);
                self.lru_old_len -= 1;
            } else {
                return;
            }
        }
    }

    /// Bring the old/young partition into existence once the list
    /// reaches `OLD_MIN_LEN`: mark everything old, point `LRU_old` at
    /// the head, then let the adjust walk find the real boundary.
    pub(crate) fn old_init(&mut self, arena: &DescriptorArena) {
        debug_assert_eq!(self.lru.len(), OLD_MIN_LEN);
        debug_assert!(self.lru_old.is_none());

        for slot in self.lru.iter() {
            arena.get(slot).set_old(true);
        }
        self.lru_old = self.lru.head();
        self.lru_old_len = self.lru.len();
        self.old_adjust(arena);
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Link a resident block into the LRU. With `old`, the block enters
    /// at the head of the old sublist; otherwise at the list head. A
    /// short list takes everything at the head regardless.
    pub(crate) fn lru_add(&mut self, arena: &DescriptorArena, slot: SlotId, old: bool) {
        let desc = arena.get(slot);
        debug_assert!(desc.in_file());
        debug_assert!(!self.lru.contains(slot));

        if !old || self.lru.len() < OLD_MIN_LEN {
            self.lru.push_front(slot);
            desc.set_freed_page_clock(self.freed_page_clock);
        } else {
            let anchor = self.lru_old.expect("old pointer defined on a long LRU");
            debug_assert!(arena.get(anchor).is_old());
            self.lru.insert_after(anchor, slot);
            self.lru_old_len += 1;
        }

        let len = self.lru.len();
        if len > OLD_MIN_LEN {
            debug_assert!(self.lru_old.is_some());
            desc.set_old(old);
            self.old_adjust(arena);
        } else if len == OLD_MIN_LEN {
            self.old_init(arena);
        } else {
            desc.set_old(self.lru_old.is_some());
        }

        if desc.belongs_to_unzip_lru() {
            self.unzip_add(slot, old);
        }
    }

    /// Link a block at the LRU tail, aging it ahead of everything else.
    pub(crate) fn lru_add_to_end(&mut self, arena: &DescriptorArena, slot: SlotId) {
        let desc = arena.get(slot);
        debug_assert!(desc.in_file());
        debug_assert!(!self.lru.contains(slot));

        self.lru.push_back(slot);

        let len = self.lru.len();
        if len > OLD_MIN_LEN {
            debug_assert!(self.lru_old.is_some());
            desc.set_old(true);
            self.lru_old_len += 1;
            self.old_adjust(arena);
        } else if len == OLD_MIN_LEN {
            self.old_init(arena);
        } else {
            desc.set_old(self.lru_old.is_some());
        }

        if desc.belongs_to_unzip_lru() {
            self.unzip_add(slot, true);
        }
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Unlink a block from the LRU (and the unzip-LRU when present),
    /// keeping the old pointer and length consistent.
    pub(crate) fn lru_remove(&mut self, arena: &DescriptorArena, slot: SlotId) {
        debug_assert!(self.lru.contains(slot));

        // The pointer never sits at the head, so a predecessor exists.
        if self.lru_old == Some(slot) {
            let prev = self.lru.prev(slot).expect("old pointer at the list head");
            debug_assert!(!arena.get(prev).is_old());
            self.lru_old = Some(prev);
            arena.get(prev).set_old(true);
            self.lru_old_len += 1;
        }

        self.lru.remove(slot);
        if self.unzip.contains(slot) {
            self.unzip.remove(slot);
        }

        if self.lru.len() < OLD_MIN_LEN {
            // Too short for the partition: dissolve it.
            for survivor in self.lru.iter() {
                arena.get(survivor).set_old(false);
            }
            self.lru_old = None;
            self.lru_old_len = 0;
            return;
        }

        if arena.get(slot).is_old() {
            self.lru_old_len -= 1;
        }
        self.old_adjust(arena);
    }

    // ------------------------------------------------------------------
    // Promotion and aging
    // ------------------------------------------------------------------

    /// Move a block to the LRU head.
    pub(crate) fn make_young(&mut self, arena: &DescriptorArena, slot: SlotId) {
        if arena.get(slot).is_old() {
            self.made_young += 1;
        }
        self.lru_remove(arena, slot);
        self.lru_add(arena, slot, false);
    }

    // ------------------------------------------------------------------
    // Unzip-LRU
    // ------------------------------------------------------------------

    pub(crate) fn unzip_add(&mut self, slot: SlotId, old: bool) {
        debug_assert!(!self.unzip.contains(slot));
        if old {
            self.unzip.push_back(slot);
        } else {
            self.unzip.push_front(slot);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use crate::config::{PoolConfig, OLD_MIN_LEN, OLD_RATIO_DIV, OLD_TOLERANCE};
    use crate::descriptor::DescriptorArena;
    use crate::page::{PageId, PageState, ZipFrame};
    use crate::pool::PoolInner;

    fn harness(frames: usize) -> (DescriptorArena, PoolInner) {
        let config = PoolConfig::builder().curr_size(frames).build();
        let arena = DescriptorArena::new(frames, frames);
        let inner = PoolInner::new(&config, &arena);
        (arena, inner)
    }

    fn make_resident(arena: &DescriptorArena, slot: u32, page_no: u32) {
        let desc = arena.get(slot);
        desc.set_id(PageId::new(1, page_no));
        desc.set_state(PageState::ReadyForUse);
        desc.set_state(PageState::FilePage);
    }

    fn target_old_len(inner: &PoolInner) -> usize {
        (inner.lru.len() * inner.old_ratio as usize / OLD_RATIO_DIV as usize)
            .min(inner.lru.len() - (OLD_TOLERANCE + crate::config::NON_OLD_MIN_LEN))
    }

    fn assert_tolerance(inner: &PoolInner) {
        let target = target_old_len(inner) as i64;
        let drift = inner.lru_old_len as i64 - target;
        assert!(
            drift.unsigned_abs() as usize <= OLD_TOLERANCE,
            "old len {} vs target {}",
            inner.lru_old_len,
            target
        );
    }

    /// The old flags form a suffix starting exactly at `LRU_old`.
    fn assert_old_suffix(arena: &DescriptorArena, inner: &PoolInner) {
        let mut old_count = 0;
        let mut first_old = None;
        for slot in inner.lru.iter() {
            if arena.get(slot).is_old() {
                if first_old.is_none() {
                    first_old = Some(slot);
                }
                old_count += 1;
            } else {
                assert!(first_old.is_none(), "young block inside the old suffix");
            }
        }
        assert_eq!(inner.lru_old, first_old);
        assert_eq!(inner.lru_old_len, old_count);
    }

    #[test]
    fn partition_appears_exactly_at_min_len() {
        let (arena, mut inner) = harness(256);
        for slot in 0..OLD_MIN_LEN as u32 - 1 {
            make_resident(&arena, slot, slot);
            inner.lru_add(&arena, slot, true);
            assert!(inner.lru_old.is_none());
        }

        let slot = OLD_MIN_LEN as u32 - 1;
        make_resident(&arena, slot, slot);
        inner.lru_add(&arena, slot, true);
        assert!(inner.lru_old.is_some());
        assert_tolerance(&inner);
    }

    #[test]
    fn partition_dissolves_below_min_len() {
        let (arena, mut inner) = harness(256);
        for slot in 0..OLD_MIN_LEN as u32 {
            make_resident(&arena, slot, slot);
            inner.lru_add(&arena, slot, true);
        }
        assert!(inner.lru_old.is_some());

        inner.lru_remove(&arena, 0);
        assert!(inner.lru_old.is_none());
        assert_eq!(inner.lru_old_len, 0);
        for slot in inner.lru.iter() {
            assert!(!arena.get(slot).is_old());
        }
    }

    #[test]
    fn old_inserts_enter_behind_the_boundary() {
        let (arena, mut inner) = harness(256);
        for slot in 0..128u32 {
            make_resident(&arena, slot, slot);
            inner.lru_add(&arena, slot, true);
        }
        let boundary = inner.lru_old.unwrap();

        make_resident(&arena, 128, 128);
        inner.lru_add(&arena, 128, true);

        // The newcomer sits right behind the pre-insert boundary, flagged
        // old, nowhere near the head.
        assert_eq!(inner.lru.prev(128), Some(boundary));
        assert!(arena.get(128).is_old());
        assert_ne!(inner.lru.head(), Some(128));
        assert_old_suffix(&arena, &inner);
        assert_tolerance(&inner);
    }

    #[test]
    fn young_inserts_enter_at_the_head() {
        let (arena, mut inner) = harness(256);
        for slot in 0..128u32 {
            make_resident(&arena, slot, slot);
            inner.lru_add(&arena, slot, true);
        }
        make_resident(&arena, 200, 200);
        inner.lru_add(&arena, 200, false);
        assert_eq!(inner.lru.head(), Some(200));
        assert!(!arena.get(200).is_old());
        assert_old_suffix(&arena, &inner);
        assert_tolerance(&inner);
    }

    #[test]
    fn removing_the_boundary_block_moves_the_pointer_back() {
        let (arena, mut inner) = harness(256);
        for slot in 0..128u32 {
            make_resident(&arena, slot, slot);
            inner.lru_add(&arena, slot, true);
        }
        let boundary = inner.lru_old.unwrap();

        inner.lru_remove(&arena, boundary);
        // The pointer stays off the list ends and the suffix stays
        // contiguous even though the boundary block itself vanished.
        assert!(inner.lru_old.is_some());
        assert_old_suffix(&arena, &inner);
        assert_tolerance(&inner);
    }

    #[test]
    fn tolerance_holds_across_churn() {
        let (arena, mut inner) = harness(512);
        for slot in 0..400u32 {
            make_resident(&arena, slot, slot);
            inner.lru_add(&arena, slot, slot % 5 != 0);
            if inner.lru_old.is_some() {
                assert_tolerance(&inner);
            }
        }
        // Remove from the tail half, checking the bound each step.
        for _ in 0..200 {
            let victim = inner.lru.tail().unwrap();
            inner.lru_remove(&arena, victim);
            if inner.lru.len() >= OLD_MIN_LEN {
                assert_tolerance(&inner);
            }
        }
    }

    #[test]
    fn make_young_promotes_and_counts() {
        let (arena, mut inner) = harness(256);
        for slot in 0..128u32 {
            make_resident(&arena, slot, slot);
            inner.lru_add(&arena, slot, true);
        }
        let victim = inner.lru.tail().unwrap();
        assert!(arena.get(victim).is_old());

        inner.make_young(&arena, victim);
        assert_eq!(inner.lru.head(), Some(victim));
        assert!(!arena.get(victim).is_old());
        assert_eq!(inner.made_young, 1);
        assert_tolerance(&inner);
    }

    #[test]
    fn unzip_membership_follows_the_compressed_frame() {
        let (arena, mut inner) = harness(64);
        make_resident(&arena, 0, 0);
        arena.get(0).put_zip(ZipFrame::new(2048));
        inner.lru_add(&arena, 0, false);
        assert!(inner.unzip.contains(0));

        make_resident(&arena, 1, 1);
        inner.lru_add(&arena, 1, false);
        assert!(!inner.unzip.contains(1));

        inner.lru_remove(&arena, 0);
        assert!(!inner.unzip.contains(0));
    }
}
