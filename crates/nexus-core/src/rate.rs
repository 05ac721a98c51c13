//! Request-rate measurement
//!
//! Frontends count requests per beacon interval and fold the counts into an
//! exponentially-weighted moving average; the scheduler consumes the smoothed
//! rate through workload reports.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counts events within fixed intervals. Incremented on the request path,
/// drained once per interval by the reporting loop.
#[derive(Debug, Default)]
pub struct IntervalCounter {
    count: AtomicU64,
}

impl IntervalCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one event
    pub fn increase(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the events accumulated since the last drain
    pub fn drain(&self) -> u64 {
        self.count.swap(0, Ordering::Relaxed)
    }

    /// Current count without draining
    pub fn peek(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Exponentially-weighted moving average of a request rate.
///
/// The rate is negative until the first sample arrives, which lets callers
/// suppress leading zeros (an idle session should not drag the average down
/// before it has ever seen traffic).
#[derive(Debug, Clone)]
pub struct EwmaRate {
    interval_sec: f64,
    alpha: f64,
    rate: f64,
}

impl EwmaRate {
    /// `interval_sec` is the sampling period, `avg_interval_sec` the averaging
    /// horizon the decay factor is derived from.
    pub fn new(interval_sec: u64, avg_interval_sec: u64) -> Self {
        let interval = interval_sec.max(1) as f64;
        let horizon = avg_interval_sec.max(1) as f64;
        Self {
            interval_sec: interval,
            alpha: 1.0 - (-interval / horizon).exp(),
            rate: -1.0,
        }
    }

    /// Fold one interval's event count into the average
    pub fn add_sample(&mut self, count: u64) {
        let sample = count as f64 / self.interval_sec;
        if self.rate < 0.0 {
            self.rate = sample;
        } else {
            self.rate = self.alpha * sample + (1.0 - self.alpha) * self.rate;
        }
    }

    /// Smoothed rate in events/s; negative before the first sample
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_counter_drain() {
        let counter = IntervalCounter::new();
        counter.increase();
        counter.increase();
        counter.increase();
        assert_eq!(counter.peek(), 3);
        assert_eq!(counter.drain(), 3);
        assert_eq!(counter.drain(), 0);
    }

    #[test]
    fn test_ewma_starts_negative() {
        let rate = EwmaRate::new(1, 5);
        assert!(rate.rate() < 0.0);
    }

    #[test]
    fn test_ewma_first_sample_is_exact() {
        let mut rate = EwmaRate::new(1, 5);
        rate.add_sample(30);
        assert_eq!(rate.rate(), 30.0);
    }

    #[test]
    fn test_ewma_converges_to_steady_rate() {
        let mut rate = EwmaRate::new(1, 5);
        for _ in 0..100 {
            rate.add_sample(80);
        }
        assert!((rate.rate() - 80.0).abs() < 1e-6);
    }

    #[test]
    fn test_ewma_tracks_rate_change() {
        let mut rate = EwmaRate::new(1, 5);
        rate.add_sample(30);
        for _ in 0..50 {
            rate.add_sample(80);
        }
        assert!(rate.rate() > 75.0);
        assert!(rate.rate() <= 80.0);
    }
}
