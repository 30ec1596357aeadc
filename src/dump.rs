// # LRU Dump and Restore
//
// Persists the recency order as a hint file so the pool can be
// pre-warmed after a restart. The file is a sequence of big-endian
// ⟨space, page⟩ pairs in LRU order (head first), zero-padded to
// page-sized blocks and closed by a ⟨0xFFFFFFFF, 0xFFFFFFFF⟩ pair. The
// dump is written to a temp file and renamed into place so a crashed
// dump never clobbers a good one.
//
// Restore walks the records in dump (priority) order but issues each
// read as part of the longest physically-contiguous run containing it,
// found through a sorted copy. That keeps the disk reading large
// sequential stretches while still warming the hottest pages first.

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::MutexGuard;
use std::fs::{self, File};
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{PoolError, Result};
use crate::page::PAGE_SIZE;
use crate::pool::BufferPool;

/// Hint file name, and the temp name it is staged under.
pub const DUMP_FILE: &str = "ib_lru_dump";
pub const DUMP_TEMP_FILE: &str = "ib_lru_dump.tmp";

const TERMINATOR: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DumpRecord {
    space: u32,
    page_no: u32,
}

/// What a dump pass wrote.
#[derive(Debug, Clone, Default)]
pub struct DumpReport {
    /// Records written, one per page walked.
    pub records: usize,
    /// Page-sized blocks written, including the final padded one.
    pub blocks: usize,
}

/// What a restore pass accomplished.
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    /// Records parsed out of the file.
    pub records: usize,
    /// Prefetch requests attempted.
    pub requested: usize,
    /// Requests the read layer actually queued.
    pub issued: usize,
}

impl BufferPool {
    // ------------------------------------------------------------------
    // Dump
    // ------------------------------------------------------------------

    /// Write the LRU order to the hint file, reporting how much was
    /// written.
    ///
    /// The walk holds the pool mutex but releases it for every
    /// page-sized block written; the successor descriptor is pinned
    /// across the release so the walk can continue from it.
    pub fn dump_lru(&self) -> Result<DumpReport> {
        let tmp_path = self.config.dump_dir.join(DUMP_TEMP_FILE);
        let final_path = self.config.dump_dir.join(DUMP_FILE);

        let mut file = File::create(&tmp_path)?;
        let mut block = BytesMut::with_capacity(PAGE_SIZE);
        let mut blocks_written = 0usize;

        let mut inner = self.inner.lock();
        let first = inner.lru.head();
        let total_pages = inner.lru.len();
        let mut pages_written = 0usize;
        let mut cursor = first;

        while let Some(slot) = cursor {
            let desc = self.arena.get(slot);
            if !self.config.dump_old_pages && desc.is_old() {
                // Only the young prefix is wanted; the first old page
                // ends the walk.
                break;
            }
            if pages_written >= total_pages {
                break;
            }
            pages_written += 1;

            let next = inner.lru.next(slot);
            if next.is_some() && next == first {
                drop(inner);
                warn!("cycle detected in the LRU, abandoning dump");
                return Err(PoolError::ListCycle);
            }

            let id = desc.id();
            block.put_u32(id.space);
            block.put_u32(id.page_no);

            if block.len() == PAGE_SIZE {
                // Pin the successor so the link stays valid while the
                // block is written without the pool mutex.
                if let Some(next) = next {
                    self.arena.get(next).pin();
                }
                let write_result = {
                    let block = &block;
                    let file = &mut file;
                    MutexGuard::unlocked(&mut inner, || file.write_all(block))
                };
                if let Some(next) = next {
                    self.arena.get(next).unpin();
                }
                if let Err(err) = write_result {
                    drop(inner);
                    warn!(block = blocks_written, "cannot write LRU dump block");
                    return Err(err.into());
                }
                blocks_written += 1;
                block.clear();
            }
            cursor = next;
        }
        drop(inner);

        block.put_u32(TERMINATOR);
        block.put_u32(TERMINATOR);
        block.resize(PAGE_SIZE, 0);
        file.write_all(&block)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &final_path)?;
        let report = DumpReport {
            records: pages_written,
            blocks: blocks_written + 1,
        };
        info!(
            records = report.records,
            blocks = report.blocks,
            path = %final_path.display(),
            "LRU dump written"
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------

    /// Issue prefetch reads for the pages recorded in the hint file.
    ///
    /// Reads are rate-capped at `io_capacity` per second: after every
    /// `io_capacity` requests the handlers are woken, the flusher asked
    /// for margin, and the remainder of the second slept away. The rate
    /// window is measured once per batch, so a batch that takes longer
    /// than a second simply starts the next window late.
    pub fn restore_lru(&self) -> Result<RestoreReport> {
        let path = self.config.dump_dir.join(DUMP_FILE);
        let data = fs::read(&path)?;
        if data.is_empty() || data.len() % 8 != 0 {
            warn!(path = %path.display(), size = data.len(), "broken LRU dump file");
            return Err(PoolError::BrokenDump(format!(
                "size {} is not a positive multiple of 8",
                data.len()
            )));
        }

        let mut records = Vec::with_capacity(data.len() / 8);
        let mut buf = &data[..];
        let mut terminated = false;
        while buf.remaining() >= 8 {
            let space = buf.get_u32();
            let page_no = buf.get_u32();
            if space == TERMINATOR || page_no == TERMINATOR {
                terminated = true;
                break;
            }
            records.push(DumpRecord { space, page_no });
        }
        if !terminated {
            warn!(
                path = %path.display(),
                "no end-of-file marker in the LRU dump; processing what was read"
            );
        }

        // A sorted copy identifies physically-contiguous runs while the
        // original keeps the priority order.
        let mut sorted = records.clone();
        sorted.sort_unstable();
        let mut loaded = vec![false; sorted.len()];

        let mut report = RestoreReport {
            records: records.len(),
            ..RestoreReport::default()
        };
        let io_capacity = self.config.io_capacity.max(1);
        let mut window_start = Instant::now();

        'records: for record in records.iter().take(self.config.load_max_entries) {
            if self.hooks.space_dir.zip_size(record.space).is_none() {
                // Unknown tablespace; nothing to read.
                continue;
            }

            let mut idx = match sorted.binary_search(record) {
                Ok(idx) => idx,
                Err(_) => {
                    debug_assert!(false, "dump record missing from its own sorted copy");
                    continue;
                }
            };
            if loaded[idx] {
                // Already read as part of an earlier run.
                continue;
            }

            // Rewind to the start of the contiguous run.
            while idx > 0 {
                let prev = sorted[idx - 1];
                if prev.space != sorted[idx].space
                    || prev.page_no + 1 != sorted[idx].page_no
                {
                    break;
                }
                idx -= 1;
            }

            // Issue the whole run in physical order.
            loop {
                if self.is_shutting_down() {
                    self.hooks.reader.wake_handlers();
                    break 'records;
                }

                let current = sorted[idx];
                loaded[idx] = true;

                if !self.hooks.space_dir.extent_exists(current.space, current.page_no) {
                    break;
                }
                let version = self.hooks.space_dir.version(current.space);

                report.requested += 1;
                if report.requested % io_capacity == 0 {
                    self.hooks.reader.wake_handlers();
                    self.hooks.flush.free_margin(0);

                    let elapsed = window_start.elapsed();
                    if elapsed < Duration::from_secs(1) {
                        thread::sleep(Duration::from_secs(1) - elapsed);
                    }
                    window_start = Instant::now();
                }

                if self
                    .hooks
                    .reader
                    .read_page_async(current.space, current.page_no, version)
                {
                    report.issued += 1;
                }
                self.stat_inc_io();

                let next_idx = idx + 1;
                if next_idx >= sorted.len() {
                    break;
                }
                let next = sorted[next_idx];
                if next.space != current.space || current.page_no + 1 != next.page_no {
                    break;
                }
                idx = next_idx;
            }
        }

        self.hooks.reader.wake_handlers();
        self.hooks.flush.free_margin(0);
        info!(
            records = report.records,
            requested = report.requested,
            issued = report.issued,
            "LRU restore finished issuing prefetch reads"
        );
        Ok(report)
    }
}

// ============================================================================
// Tests
// ============================================================================
