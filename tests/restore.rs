// Restore-path behaviors that need observable collaborators: the
// recording reader and a bounded space directory from the shared
// support module.

mod support;

use std::fs;
use std::sync::Arc;

use pagepool::{BufferPool, Collaborators, PoolConfig, DUMP_FILE};
use support::{fault, BoundedSpace, RecordingReader};

fn dump_pool(dir: &std::path::Path, frames: usize) -> BufferPool {
    BufferPool::new(
        PoolConfig::builder()
            .curr_size(frames)
            .dump_dir(dir)
            .build(),
    )
}

fn reader_pool(
    dir: &std::path::Path,
    frames: usize,
    hooks: Collaborators,
) -> BufferPool {
    BufferPool::with_collaborators(
        PoolConfig::builder()
            .curr_size(frames)
            .dump_dir(dir)
            .build(),
        hooks,
    )
}

#[test]
fn restore_tolerates_a_missing_terminator() {
    let dir = tempfile::tempdir().unwrap();
    let mut data = Vec::new();
    for page_no in 0..4u32 {
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(&page_no.to_be_bytes());
    }
    fs::write(dir.path().join(DUMP_FILE), &data).unwrap();

    let reader = Arc::new(RecordingReader::default());
    let hooks = Collaborators {
        reader: reader.clone(),
        ..Collaborators::default()
    };
    let pool = reader_pool(dir.path(), 8, hooks);

    let report = pool.restore_lru().unwrap();
    assert_eq!(report.records, 4);
    assert_eq!(report.issued, 4);
}

#[test]
fn restore_batches_contiguous_runs_in_physical_order() {
    let dir = tempfile::tempdir().unwrap();
    let pool = dump_pool(dir.path(), 32);
    // Fault pages so the LRU (priority) order is 30, 20, 10 but the
    // three pages 10, 20, 30 of space 1 are joined by 11 and 21.
    for page_no in [10u32, 11, 20, 21, 30] {
        fault(&pool, 1, page_no, false);
    }
    pool.dump_lru().unwrap();

    let reader = Arc::new(RecordingReader::default());
    let hooks = Collaborators {
        reader: reader.clone(),
        ..Collaborators::default()
    };
    let restore_pool = reader_pool(dir.path(), 32, hooks);
    let report = restore_pool.restore_lru().unwrap();

    assert_eq!(report.records, 5);
    assert_eq!(report.issued, 5);
    // Priority order 30, 21, 20, ... but each contiguous run is issued
    // ascending: 30; then 20, 21; then 10, 11.
    assert_eq!(
        reader.reads(),
        vec![(1, 30), (1, 20), (1, 21), (1, 10), (1, 11)]
    );
    assert!(reader.woken());
}

#[test]
fn restore_skips_unknown_spaces_and_missing_extents() {
    let dir = tempfile::tempdir().unwrap();
    let mut data = Vec::new();
    for (space, page_no) in [(999u32, 1u32), (1, 5), (1, 6), (1, 900)] {
        data.extend_from_slice(&space.to_be_bytes());
        data.extend_from_slice(&page_no.to_be_bytes());
    }
    data.extend_from_slice(&u32::MAX.to_be_bytes());
    data.extend_from_slice(&u32::MAX.to_be_bytes());
    fs::write(dir.path().join(DUMP_FILE), &data).unwrap();

    let reader = Arc::new(RecordingReader::default());
    let hooks = Collaborators {
        reader: reader.clone(),
        space_dir: Arc::new(BoundedSpace { max_page: 100 }),
        ..Collaborators::default()
    };
    let pool = reader_pool(dir.path(), 8, hooks);
    let report = pool.restore_lru().unwrap();

    // Space 999 is unknown, page 900 is past the last extent.
    assert_eq!(report.records, 4);
    assert_eq!(report.issued, 2);
    assert_eq!(reader.reads(), vec![(1, 5), (1, 6)]);
}

#[test]
fn restore_honors_the_entry_cap() {
    let dir = tempfile::tempdir().unwrap();
    let pool = dump_pool(dir.path(), 32);
    for page_no in 0..20u32 {
        // Leave gaps so no contiguous runs form.
        fault(&pool, 1, page_no * 2, false);
    }
    pool.dump_lru().unwrap();

    let reader = Arc::new(RecordingReader::default());
    let hooks = Collaborators {
        reader: reader.clone(),
        ..Collaborators::default()
    };
    let pool = BufferPool::with_collaborators(
        PoolConfig::builder()
            .curr_size(32)
            .dump_dir(dir.path())
            .load_max_entries(5)
            .build(),
        hooks,
    );
    let report = pool.restore_lru().unwrap();
    assert_eq!(report.requested, 5);
}

#[test]
fn shutdown_stops_a_restore_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let pool = dump_pool(dir.path(), 32);
    for page_no in 0..10u32 {
        fault(&pool, 1, page_no * 3, false);
    }
    pool.dump_lru().unwrap();

    let reader = Arc::new(RecordingReader::default());
    let hooks = Collaborators {
        reader: reader.clone(),
        ..Collaborators::default()
    };
    let pool = reader_pool(dir.path(), 32, hooks);
    pool.begin_shutdown();
    let report = pool.restore_lru().unwrap();
    assert_eq!(report.issued, 0);
}
