//! Throughput statistics
//!
//! Rate windows sampled by the scheduler's stats tick: instantaneous rate
//! from bytes-since-last-sample, a smoothed running average, and the ETA
//! derived from it.

use std::time::Instant;

/// Smoothing factor for the running average (per sample)
const EWMA_ALPHA: f64 = 0.3;

/// Download rate estimator fed from a monotonically increasing byte counter
pub struct RateEstimator {
    last_bytes: u64,
    last_at: Instant,
    instant_rate: u64,
    average_rate: f64,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self {
            last_bytes: 0,
            last_at: Instant::now(),
            instant_rate: 0,
            average_rate: 0.0,
        }
    }

    /// Record the current total byte count and update both rates
    pub fn sample(&mut self, total_bytes: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_at).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }

        let delta = total_bytes.saturating_sub(self.last_bytes);
        self.instant_rate = (delta as f64 / elapsed) as u64;
        self.average_rate = if self.average_rate == 0.0 {
            self.instant_rate as f64
        } else {
            EWMA_ALPHA * self.instant_rate as f64 + (1.0 - EWMA_ALPHA) * self.average_rate
        };

        self.last_bytes = total_bytes;
        self.last_at = now;
    }

    /// Rate over the last sample window, bytes/sec
    pub fn instant_rate(&self) -> u64 {
        self.instant_rate
    }

    /// Smoothed rate, bytes/sec
    pub fn average_rate(&self) -> u64 {
        self.average_rate as u64
    }

    /// Seconds until `remaining` bytes arrive at the average rate
    pub fn eta_seconds(&self, remaining: u64) -> Option<u64> {
        if remaining == 0 {
            return Some(0);
        }
        let rate = self.average_rate as u64;
        if rate == 0 {
            return None;
        }
        Some(remaining / rate)
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rates_follow_samples() {
        let mut est = RateEstimator::new();
        assert_eq!(est.instant_rate(), 0);
        assert_eq!(est.eta_seconds(100), None);
        assert_eq!(est.eta_seconds(0), Some(0));

        std::thread::sleep(Duration::from_millis(20));
        est.sample(100_000);
        assert!(est.instant_rate() > 0);
        assert!(est.average_rate() > 0);
        assert!(est.eta_seconds(est.average_rate()).unwrap() <= 1);
    }

    #[test]
    fn stalled_transfer_has_no_eta() {
        let mut est = RateEstimator::new();
        std::thread::sleep(Duration::from_millis(5));
        est.sample(0);
        assert_eq!(est.instant_rate(), 0);
        assert_eq!(est.eta_seconds(1_000), None);
    }
}
