//! One-way latency estimation from round-trip samples.
//!
//! An exponentially weighted mean and variance. The first sample seeds the
//! mean. After a warm-up, samples further than a few standard deviations
//! from the mean are rejected as stalls. A run of consecutive rejections is
//! taken as a genuine regime change and accepted.

use std::collections::VecDeque;

/// EWMA latency and spread estimator.
#[derive(Debug, Clone)]
pub struct LatencyEstimator {
    mean: f64,
    variance: f64,
    samples: u32,
    rejected_in_row: u32,
    /// Weight of a new sample (default 0.125).
    pub alpha: f64,
    /// Rejection distance in standard deviations.
    pub outlier_sigmas: f64,
    /// Spread used for rejection when the estimate is tighter than this.
    pub spread_floor: f64,
    /// Accepted samples before rejection starts.
    pub warmup: u32,
    /// Consecutive rejections after which the next sample is accepted.
    pub max_rejections: u32,
}

impl Default for LatencyEstimator {
    fn default() -> Self {
        Self {
            mean: 0.0,
            variance: 0.0,
            samples: 0,
            rejected_in_row: 0,
            alpha: 0.125,
            outlier_sigmas: 3.0,
            spread_floor: 0.005,
            warmup: 8,
            max_rejections: 4,
        }
    }
}

impl LatencyEstimator {
    /// Feed a one-way latency sample in seconds. Returns false if rejected.
    pub fn record(&mut self, latency: f64) -> bool {
        if !latency.is_finite() || latency < 0.0 {
            return false;
        }

        if self.samples == 0 {
            self.mean = latency;
            self.variance = 0.0;
            self.samples = 1;
            return true;
        }

        let deviation = latency - self.mean;
        let limit = self.outlier_sigmas * self.spread().max(self.spread_floor);
        if self.samples >= self.warmup
            && deviation.abs() > limit
            && self.rejected_in_row < self.max_rejections
        {
            self.rejected_in_row += 1;
            return false;
        }

        self.rejected_in_row = 0;
        self.mean += self.alpha * deviation;
        self.variance = (1.0 - self.alpha) * (self.variance + self.alpha * deviation * deviation);
        self.samples = self.samples.saturating_add(1);
        true
    }

    /// Estimated one-way latency in seconds.
    pub fn latency(&self) -> f64 {
        self.mean
    }

    /// Standard deviation of the estimate in seconds.
    pub fn spread(&self) -> f64 {
        self.variance.sqrt()
    }

    /// Accepted samples so far.
    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Enough samples for the estimate to be trusted.
    pub fn is_reliable(&self) -> bool {
        self.samples >= self.warmup
    }

    /// Forget everything learned.
    pub fn reset(&mut self) {
        self.mean = 0.0;
        self.variance = 0.0;
        self.samples = 0;
        self.rejected_in_row = 0;
    }
}

/// Estimates how fast a remote clock runs relative to the local one.
#[derive(Debug, Clone)]
pub struct TimeRateEstimator {
    pairs: VecDeque<(f64, f64)>,
    capacity: usize,
    rate: f64,
}

impl Default for TimeRateEstimator {
    fn default() -> Self {
        Self {
            pairs: VecDeque::new(),
            capacity: 16,
            rate: 1.0,
        }
    }
}

impl TimeRateEstimator {
    /// Record a `(local, remote)` time pair. The rate is refreshed once the
    /// window is full.
    pub fn record(&mut self, local: f64, remote: f64) {
        if let Some(&(last_local, _)) = self.pairs.back()
            && local - last_local <= f64::EPSILON
        {
            return;
        }
        self.pairs.push_back((local, remote));
        if self.pairs.len() > self.capacity {
            self.pairs.pop_front();
        }
        if self.pairs.len() < self.capacity {
            return;
        }

        let (sum, count) = self
            .pairs
            .iter()
            .zip(self.pairs.iter().skip(1))
            .map(|(a, b)| (b.1 - a.1) / (b.0 - a.0))
            .fold((0.0, 0u32), |(sum, count), rate| (sum + rate, count + 1));
        if count > 0 {
            self.rate = sum / f64::from(count);
        }
    }

    /// Remote seconds per local second; 1.0 until the window fills.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn reset(&mut self) {
        self.pairs.clear();
        self.rate = 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_round_trip_converges() {
        let round_trip = 0.12;
        let mut estimator = LatencyEstimator::default();
        for _ in 0..50 {
            estimator.record(round_trip / 2.0);
        }
        let half = round_trip / 2.0;
        assert!((estimator.latency() - half).abs() <= half * 0.05);
        assert!(estimator.spread() < 1e-6);
        assert!(estimator.is_reliable());
    }

    #[test]
    fn test_noisy_round_trip_converges() {
        let mut estimator = LatencyEstimator::default();
        for i in 0..200 {
            let noise = if i % 2 == 0 { 0.004 } else { -0.004 };
            estimator.record(0.05 + noise);
        }
        assert!((estimator.latency() - 0.05).abs() < 0.0025);
        assert!(estimator.spread() < 0.006);
    }

    #[test]
    fn test_stall_is_rejected() {
        let mut estimator = LatencyEstimator::default();
        for _ in 0..20 {
            estimator.record(0.03);
        }
        assert!(!estimator.record(2.0));
        assert!((estimator.latency() - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_sustained_shift_is_accepted() {
        let mut estimator = LatencyEstimator::default();
        for _ in 0..20 {
            estimator.record(0.03);
        }
        let accepted: Vec<bool> = (0..6).map(|_| estimator.record(0.3)).collect();
        assert_eq!(accepted, vec![false, false, false, false, true, true]);
        assert!(estimator.latency() > 0.03);
    }

    #[test]
    fn test_no_rejection_during_warmup() {
        let mut estimator = LatencyEstimator::default();
        estimator.record(0.01);
        assert!(estimator.record(1.0));
        assert!(!estimator.is_reliable());
    }

    #[test]
    fn test_reset_clears() {
        let mut estimator = LatencyEstimator::default();
        estimator.record(0.2);
        estimator.reset();
        assert_eq!(estimator.samples(), 0);
        assert_eq!(estimator.latency(), 0.0);
        assert!(!estimator.record(-1.0));
        assert!(!estimator.record(f64::NAN));
    }

    #[test]
    fn test_time_rate_of_faster_clock() {
        let mut rate = TimeRateEstimator::default();
        for i in 0..20 {
            let local = i as f64 * 0.5;
            rate.record(local, local * 1.01 + 3.0);
        }
        assert!((rate.rate() - 1.01).abs() < 1e-9);
    }

    #[test]
    fn test_time_rate_defaults_to_one() {
        let mut rate = TimeRateEstimator::default();
        rate.record(0.0, 10.0);
        rate.record(0.0, 11.0);
        rate.record(1.0, 20.0);
        assert_eq!(rate.rate(), 1.0);
    }
}
