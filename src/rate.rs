//! Sliding-window transfer rate measurement.
//!
//! A [`RateWindow`] accumulates uploaded and downloaded byte counts for the
//! current tick. Each call to [`RateWindow::tick`] closes the current tick,
//! appends it as the newest bucket and drops the oldest, so the window always
//! holds the last `size` completed ticks.
//!
//! The session keeps one window for overall throughput and every peer
//! connection owns its own, which is what sizes its request pipeline.
//!
//! ```
//! use swarmbit::rate::RateWindow;
//!
//! let mut rates = RateWindow::new(4);
//! rates.record(0, 30_000);
//! rates.tick();
//! assert_eq!(rates.down(), 30_000);
//! assert_eq!(rates.down_avg(), 7_500.0);
//! ```

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Bucket {
    up: u64,
    down: u64,
}

/// Fixed-length ring of per-tick `(up, down)` byte counts.
#[derive(Debug, Clone)]
pub struct RateWindow {
    buckets: VecDeque<Bucket>,
    current: Bucket,
}

impl RateWindow {
    /// Creates a window of `size` zeroed ticks. A size of zero is bumped to one.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            buckets: std::iter::repeat(Bucket::default()).take(size).collect(),
            current: Bucket::default(),
        }
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    /// Adds bytes to the tick in progress.
    pub fn record(&mut self, up: u64, down: u64) {
        self.current.up += up;
        self.current.down += down;
    }

    /// Closes the tick in progress and rotates in a fresh one.
    pub fn tick(&mut self) {
        self.buckets.pop_front();
        self.buckets.push_back(std::mem::take(&mut self.current));
    }

    /// Bytes uploaded during the most recent completed tick.
    pub fn up(&self) -> u64 {
        self.buckets.back().map_or(0, |b| b.up)
    }

    /// Bytes downloaded during the most recent completed tick.
    pub fn down(&self) -> u64 {
        self.buckets.back().map_or(0, |b| b.down)
    }

    /// Mean bytes uploaded per tick across the whole window.
    pub fn up_avg(&self) -> f64 {
        self.average(|b| b.up)
    }

    pub fn down_avg(&self) -> f64 {
        self.average(|b| b.down)
    }

    fn average(&self, field: impl Fn(&Bucket) -> u64) -> f64 {
        let total: u64 = self.buckets.iter().map(field).sum();
        total as f64 / self.size() as f64
    }
}
