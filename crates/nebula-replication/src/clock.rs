//! Session time synchronization.
//!
//! Every session keeps a network time that advances with `update` and is
//! pulled towards the primary peer's network time. Each time the primary is
//! heard from, the offset between its estimated current time and ours is
//! measured: the first measurement sets our time outright, later ones move
//! it by a fraction of the offset, capped per step. The RMS of recent
//! offsets is the time variance; the clock counts as synchronized once the
//! variance has stayed below the configured threshold for a settling window.

use std::collections::VecDeque;

/// Offsets kept for the variance.
const OFFSET_WINDOW: usize = 8;

/// Network clock with offset tracking.
#[derive(Debug, Clone)]
pub struct TimeSync {
    time: f64,
    offsets: VecDeque<f64>,
    variance: f64,
    settled_for: f64,
    synchronized: bool,
    enabled: bool,
    seeded: bool,
    /// Fraction of a measured offset applied per observation.
    pub gain: f64,
    /// Largest adjustment applied by one observation, in seconds.
    pub max_adjust: f64,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self {
            time: 0.0,
            offsets: VecDeque::with_capacity(OFFSET_WINDOW),
            variance: f64::INFINITY,
            settled_for: 0.0,
            synchronized: false,
            enabled: true,
            seeded: false,
            gain: 0.75,
            max_adjust: 0.5,
        }
    }
}

impl TimeSync {
    /// Current network time in seconds.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// RMS of recent offsets; infinite until the first measurement.
    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Turn synchronization on or off. While off, time runs freely and
    /// counts as synchronized.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            self.enabled = enabled;
            self.reset_measurements();
        }
    }

    /// Forget measured offsets, e.g. after the primary changed.
    pub fn reset_measurements(&mut self) {
        self.offsets.clear();
        self.variance = f64::INFINITY;
        self.settled_for = 0.0;
        self.synchronized = false;
        self.seeded = false;
    }

    /// Advance by `dt`. `authoritative` means the local node is the time
    /// source (it is primary, or synchronization is off).
    pub fn advance(&mut self, dt: f64, authoritative: bool, threshold: f64, settle: f64) {
        self.time += dt;

        if authoritative || !self.enabled {
            self.offsets.clear();
            self.variance = 0.0;
        }

        if self.variance < threshold {
            self.settled_for += dt;
        } else {
            self.settled_for = 0.0;
        }
        self.synchronized = self.settled_for >= settle;
    }

    /// Record that the primary's current time is estimated at `remote_now`.
    /// Returns the adjustment applied to the local network time.
    pub fn observe(&mut self, remote_now: f64) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        let offset = remote_now - self.time;

        self.offsets.push_back(offset);
        if self.offsets.len() > OFFSET_WINDOW {
            self.offsets.pop_front();
        }
        let mean_square =
            self.offsets.iter().map(|o| o * o).sum::<f64>() / self.offsets.len() as f64;
        self.variance = mean_square.sqrt();

        let adjust = if self.seeded {
            (offset * self.gain).clamp(-self.max_adjust, self.max_adjust)
        } else {
            self.seeded = true;
            offset
        };
        self.time += adjust;
        adjust
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: f64 = 0.03;
    const SETTLE: f64 = 1.0;

    #[test]
    fn test_first_observation_jumps() {
        let mut clock = TimeSync::default();
        clock.advance(0.5, false, THRESHOLD, SETTLE);
        let adjust = clock.observe(10.0);
        assert!((adjust - 9.5).abs() < 1e-12);
        assert!((clock.time() - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_later_observations_are_damped_and_capped() {
        let mut clock = TimeSync::default();
        clock.observe(0.0);
        let adjust = clock.observe(0.4);
        assert!((adjust - 0.3).abs() < 1e-12);
        let adjust = clock.observe(100.0);
        assert_eq!(adjust, 0.5);
        let adjust = clock.observe(-100.0);
        assert_eq!(adjust, -0.5);
    }

    #[test]
    fn test_synchronizes_after_settling_window() {
        let mut clock = TimeSync::default();
        let dt = 0.1;
        let mut remote = 5.0;
        let mut synchronized_at = None;
        for step in 0..100 {
            clock.advance(dt, false, THRESHOLD, SETTLE);
            remote += dt;
            clock.observe(remote);
            if synchronized_at.is_none() && clock.is_synchronized() {
                synchronized_at = Some(step);
            }
        }
        let step = synchronized_at.expect("clock never synchronized");
        // Needs the large first offset to leave the window, then a full settle.
        assert!(step >= 10);
        assert!(clock.variance() < THRESHOLD);
        assert!((clock.time() - remote).abs() < 1e-6);
    }

    #[test]
    fn test_unsynchronized_without_measurements() {
        let mut clock = TimeSync::default();
        for _ in 0..100 {
            clock.advance(0.1, false, THRESHOLD, SETTLE);
        }
        assert!(!clock.is_synchronized());
        assert!(clock.variance().is_infinite());
    }

    #[test]
    fn test_authoritative_settles_on_local_time() {
        let mut clock = TimeSync::default();
        for _ in 0..9 {
            clock.advance(0.1, true, THRESHOLD, SETTLE);
        }
        assert!(!clock.is_synchronized());
        clock.advance(0.11, true, THRESHOLD, SETTLE);
        assert!(clock.is_synchronized());
        assert_eq!(clock.variance(), 0.0);
    }

    #[test]
    fn test_disabled_ignores_observations() {
        let mut clock = TimeSync::default();
        clock.set_enabled(false);
        assert_eq!(clock.observe(50.0), 0.0);
        clock.advance(2.0, false, THRESHOLD, SETTLE);
        assert!(clock.is_synchronized());
        assert!((clock.time() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_large_jitter_keeps_clock_unsynchronized() {
        let mut clock = TimeSync::default();
        let mut remote = 0.0;
        for step in 0..100 {
            clock.advance(0.1, false, THRESHOLD, SETTLE);
            remote += 0.1;
            let noise = if step % 2 == 0 { 0.2 } else { -0.2 };
            clock.observe(remote + noise);
        }
        assert!(!clock.is_synchronized());
        assert!(clock.variance() > THRESHOLD);
    }
}
