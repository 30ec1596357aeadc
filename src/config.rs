// # Pool Configuration
//
// Tunables of the replacement policy plus the constants the algorithms
// are calibrated against. Follows the config-struct-plus-builder shape
// used across the storage layer.

use std::path::PathBuf;

/// Denominator of the old-sublist ratio: `old_ratio` is stored in
/// 1024ths of the LRU length.
pub const OLD_RATIO_DIV: u32 = 1024;

/// Allowed drift, in blocks, between the actual old-sublist length and
/// the target before the old pointer is walked.
pub const OLD_TOLERANCE: usize = 20;

/// LRU length at which the old/young partition comes into existence.
pub const OLD_MIN_LEN: usize = 80;

/// Minimum number of non-old blocks while the partition exists.
pub const NON_OLD_MIN_LEN: usize = 5;

/// Lower clamp of `old_ratio`. Must keep
/// `OLD_RATIO_MIN * OLD_MIN_LEN > OLD_RATIO_DIV * (OLD_TOLERANCE +
/// NON_OLD_MIN_LEN)` so the old pointer can never reach either end of
/// the list.
pub const OLD_RATIO_MIN: u32 = 322;

/// Upper clamp of `old_ratio` (95%).
pub const OLD_RATIO_MAX: u32 = 972;

const _: () = assert!(
    OLD_RATIO_MIN as usize * OLD_MIN_LEN > OLD_RATIO_DIV as usize * (OLD_TOLERANCE + NON_OLD_MIN_LEN)
);
const _: () = assert!(NON_OLD_MIN_LEN < OLD_MIN_LEN);

/// Batch size of adaptive-hash drops, and the yield period of bulk
/// flush-list walks. Keeps the pool mutex from being held across very
/// large tablespaces.
pub const DROP_SEARCH_SIZE: usize = 1024;

/// Number of one-second intervals kept in the I/O-vs-unzip stat window.
pub const STAT_N_INTERVAL: usize = 50;

/// LRU scan cap of the first eviction iteration in fast-free-list mode.
pub const FREE_SEARCH_LEN: usize = 100;

// ============================================================================
// Config
// ============================================================================

/// Buffer pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Total number of frames owned by the pool.
    pub curr_size: usize,

    /// Target old-sublist fraction in 1024ths, clamped to
    /// `[OLD_RATIO_MIN, OLD_RATIO_MAX]`.
    pub old_ratio: u32,

    /// Minimum age of the first access before an old-sublist page may be
    /// promoted on a later access. 0 promotes immediately.
    pub old_threshold_ms: u64,

    /// Consider the unzip-LRU for eviction only while it holds more than
    /// this percentage of the LRU.
    pub unzip_lru_pct: u64,

    /// Weight of the I/O rate in the unzip-vs-full decision.
    pub lru_io_to_unzip_factor: u64,

    /// Cap the first LRU eviction scan at `FREE_SEARCH_LEN` entries.
    pub fast_free_list: bool,

    /// Include old-sublist pages in the LRU dump.
    pub dump_old_pages: bool,

    /// Upper bound on restore work, in dump records.
    pub load_max_entries: usize,

    /// Restore read-rate cap, requests per second.
    pub io_capacity: usize,

    /// Directory holding the dump file.
    pub dump_dir: PathBuf,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            curr_size: 1000,
            old_ratio: 3 * OLD_RATIO_DIV / 8,
            old_threshold_ms: 1000,
            unzip_lru_pct: 10,
            lru_io_to_unzip_factor: 50,
            fast_free_list: false,
            dump_old_pages: true,
            load_max_entries: usize::MAX,
            io_capacity: 200,
            dump_dir: PathBuf::from("."),
        }
    }
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }
}

/// Clamp a raw ratio into the legal band.
pub fn clamp_old_ratio(ratio: u32) -> u32 {
    ratio.clamp(OLD_RATIO_MIN, OLD_RATIO_MAX)
}

/// Convert a percentage of the pool reserved for old blocks into
/// 1024ths, clamped.
pub fn old_ratio_from_pct(pct: u32) -> u32 {
    clamp_old_ratio(pct * OLD_RATIO_DIV / 100)
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn curr_size(mut self, frames: usize) -> Self {
        self.config.curr_size = frames;
        self
    }

    pub fn old_ratio_pct(mut self, pct: u32) -> Self {
        self.config.old_ratio = old_ratio_from_pct(pct);
        self
    }

    pub fn old_ratio(mut self, ratio: u32) -> Self {
        self.config.old_ratio = clamp_old_ratio(ratio);
        self
    }

    pub fn old_threshold_ms(mut self, ms: u64) -> Self {
        self.config.old_threshold_ms = ms;
        self
    }

    pub fn unzip_lru_pct(mut self, pct: u64) -> Self {
        self.config.unzip_lru_pct = pct;
        self
    }

    pub fn lru_io_to_unzip_factor(mut self, factor: u64) -> Self {
        self.config.lru_io_to_unzip_factor = factor;
        self
    }

    pub fn fast_free_list(mut self, on: bool) -> Self {
        self.config.fast_free_list = on;
        self
    }

    pub fn dump_old_pages(mut self, on: bool) -> Self {
        self.config.dump_old_pages = on;
        self
    }

    pub fn load_max_entries(mut self, cap: usize) -> Self {
        self.config.load_max_entries = cap;
        self
    }

    pub fn io_capacity(mut self, per_second: usize) -> Self {
        self.config.io_capacity = per_second.max(1);
        self
    }

    pub fn dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.dump_dir = dir.into();
        self
    }

    pub fn build(self) -> PoolConfig {
        self.config
    }
}

// ============================================================================
// Tests
// ============================================================================
