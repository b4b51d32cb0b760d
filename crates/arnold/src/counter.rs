use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

/// Counter of transfer rates over a sliding time window, used for the
/// bytes sent to and received from a peer.
///
/// Samples older than the window are dropped, the estimate is the sum of
/// what is left divided by the window length.
#[derive(Debug, Clone)]
pub struct WindowCounter {
    window: Duration,
    samples: VecDeque<(u64, Instant)>,
    // -- cumulative counters --
    sum: u64,
    total: u64,
    sample_count: u64,
}

impl WindowCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            sum: 0,
            total: 0,
            sample_count: 0,
        }
    }

    /// Record a transfer of `bytes` that happened now.
    pub fn record(&mut self, bytes: u64) {
        self.record_at(bytes, Instant::now());
    }

    pub fn record_at(&mut self, bytes: u64, at: Instant) {
        self.samples.push_back((bytes, at));
        self.sum += bytes;
        self.total += bytes;
        self.sample_count += 1;
        self.expire(at);
    }

    /// Bytes per second over the window ending now.
    pub fn rate(&mut self) -> f64 {
        self.rate_at(Instant::now())
    }

    pub fn rate_at(&mut self, now: Instant) -> f64 {
        self.expire(now);
        self.sum as f64 / self.window.as_secs_f64()
    }

    /// Every byte ever recorded.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(bytes, at)) = self.samples.front() {
            if now.saturating_duration_since(at) < self.window {
                break;
            }
            self.sum -= bytes;
            self.samples.pop_front();
        }
    }
}
