// Shared mock collaborators and fault helpers for the integration
// tests. Not every test target uses every item.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use pagepool::{BufferPool, PageId, PageReader, SlotId, SpaceDirectory, ZipFrame};

/// Records every prefetch request and counts handler wakes.
#[derive(Default)]
pub struct RecordingReader {
    reads: Mutex<Vec<(u32, u32)>>,
    wakes: AtomicUsize,
}

impl RecordingReader {
    pub fn reads(&self) -> Vec<(u32, u32)> {
        self.reads.lock().unwrap().clone()
    }

    pub fn woken(&self) -> bool {
        self.wakes.load(Ordering::Relaxed) > 0
    }
}

impl PageReader for RecordingReader {
    fn read_page_async(&self, space: u32, page_no: u32, _version: u64) -> bool {
        self.reads.lock().unwrap().push((space, page_no));
        true
    }

    fn wake_handlers(&self) {
        self.wakes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Space directory where space 999 does not exist and extents end at
/// `max_page`.
pub struct BoundedSpace {
    pub max_page: u32,
}

impl SpaceDirectory for BoundedSpace {
    fn zip_size(&self, space: u32) -> Option<usize> {
        (space != 999).then_some(0)
    }

    fn extent_exists(&self, _space: u32, page_no: u32) -> bool {
        page_no <= self.max_page
    }

    fn version(&self, _space: u32) -> u64 {
        7
    }

    fn lru_count(&self, _space: u32, _delta: i64) {}
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn fault(pool: &BufferPool, space: u32, page_no: u32, young: bool) -> SlotId {
    let slot = pool.get_free_block();
    pool.install_page(slot, PageId::new(space, page_no), None, young)
        .unwrap();
    slot
}

pub fn fault_zip(pool: &BufferPool, space: u32, page_no: u32) -> SlotId {
    let slot = pool.get_free_block();
    pool.install_page(slot, PageId::new(space, page_no), Some(ZipFrame::new(2048)), false)
        .unwrap();
    slot
}
