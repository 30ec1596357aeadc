// # Interval Statistics
//
// Two counters feed the unzip-vs-full eviction choice: page I/O
// completions and decompressions. Accessors bump the live pair without
// any lock; a once-per-second tick folds the pair into a circular window
// of the last `STAT_N_INTERVAL` samples. Readers combine the window
// average with the live pair for a mildly-smoothed rate.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::STAT_N_INTERVAL;

/// One sampled interval of the counter pair.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IntervalSample {
    pub io: u64,
    pub unzip: u64,
}

/// Live counters, bumped lock-free by accessors and cleared on each tick.
#[derive(Default)]
pub struct LiveCounters {
    io: AtomicU64,
    unzip: AtomicU64,
}

impl LiveCounters {
    #[inline(always)]
    pub fn inc_io(&self) {
        self.io.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn inc_unzip(&self) {
        self.unzip.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the pair once. The counters are not cleared; ticks clear them
    /// separately so a racing increment lands in the next interval.
    pub fn snapshot(&self) -> IntervalSample {
        IntervalSample {
            io: self.io.load(Ordering::Relaxed),
            unzip: self.unzip.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        self.io.store(0, Ordering::Relaxed);
        self.unzip.store(0, Ordering::Relaxed);
    }
}

/// Circular window of past samples plus their running sum. Protected by
/// the pool mutex.
pub struct StatWindow {
    samples: [IntervalSample; STAT_N_INTERVAL],
    cursor: usize,
    sum: IntervalSample,
}

impl StatWindow {
    pub fn new() -> Self {
        Self {
            samples: [IntervalSample::default(); STAT_N_INTERVAL],
            cursor: 0,
            sum: IntervalSample::default(),
        }
    }

    /// Fold one interval into the window: subtract the entry about to be
    /// overwritten, add the new sample, advance the cursor.
    pub fn roll(&mut self, sample: IntervalSample) {
        let slot = &mut self.samples[self.cursor];
        self.cursor = (self.cursor + 1) % STAT_N_INTERVAL;

        self.sum.io = self.sum.io + sample.io - slot.io;
        self.sum.unzip = self.sum.unzip + sample.unzip - slot.unzip;
        *slot = sample;
    }

    /// Smoothed rates: window average plus the current live pair.
    pub fn averages(&self, live: IntervalSample) -> (f64, f64) {
        let io = self.sum.io as f64 / STAT_N_INTERVAL as f64 + live.io as f64;
        let unzip = self.sum.unzip as f64 / STAT_N_INTERVAL as f64 + live.unzip as f64;
        (io, unzip)
    }
}

impl Default for StatWindow {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_counters_accumulate_until_cleared() {
        let live = LiveCounters::default();
        live.inc_io();
        live.inc_io();
        live.inc_unzip();
        assert_eq!(live.snapshot(), IntervalSample { io: 2, unzip: 1 });

        live.clear();
        assert_eq!(live.snapshot(), IntervalSample::default());
    }

    #[test]
    fn window_sum_tracks_the_last_n_samples() {
        let mut window = StatWindow::new();
        for _ in 0..STAT_N_INTERVAL {
            window.roll(IntervalSample { io: 10, unzip: 2 });
        }
        let (io_avg, unzip_avg) = window.averages(IntervalSample::default());
        assert_eq!(io_avg, 10.0);
        assert_eq!(unzip_avg, 2.0);

        // Overwriting a full window subtracts the displaced entries.
        for _ in 0..STAT_N_INTERVAL {
            window.roll(IntervalSample { io: 0, unzip: 0 });
        }
        let (io_avg, unzip_avg) = window.averages(IntervalSample::default());
        assert_eq!(io_avg, 0.0);
        assert_eq!(unzip_avg, 0.0);
    }

    #[test]
    fn averages_include_the_live_interval() {
        let mut window = StatWindow::new();
        window.roll(IntervalSample {
            io: STAT_N_INTERVAL as u64,
            unzip: 0,
        });
        let (io_avg, unzip_avg) = window.averages(IntervalSample { io: 3, unzip: 7 });
        assert_eq!(io_avg, 1.0 + 3.0);
        assert_eq!(unzip_avg, 7.0);
    }
}
