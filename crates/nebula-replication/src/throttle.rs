//! Distance/time throttle for outgoing state.
//!
//! The minimum interval between two state packets to a peer grows with the
//! distance the application associates with it: `time_until_tx_state_near`
//! up to `near_distance`, a linear ramp to `time_until_tx_state_far` at
//! `far_distance`, flat beyond that, and nothing past `furthest_distance`.

use nebula_config::ReplicatorConfig;

use crate::state::{State, StateTemplate};

/// Distance band of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Near,
    Far,
    /// Past the far band; throttled to the far rate.
    Beyond,
    /// Past the furthest distance; no non-critical state.
    Suppressed,
}

impl Band {
    pub fn classify(config: &ReplicatorConfig, distance: f32) -> Self {
        if distance.is_nan() || distance > config.furthest_distance {
            Band::Suppressed
        } else if distance > config.far_distance {
            Band::Beyond
        } else if distance > config.near_distance {
            Band::Far
        } else {
            Band::Near
        }
    }
}

/// Minimum seconds between state packets at `distance`, or `None` when
/// non-critical state is suppressed.
pub fn state_interval(config: &ReplicatorConfig, distance: f32) -> Option<f64> {
    let near = config.time_until_tx_state_near;
    let far = config.time_until_tx_state_far;
    match Band::classify(config, distance) {
        Band::Near => Some(near),
        Band::Far => {
            let span = config.far_distance - config.near_distance;
            let k = if span > 0.0 {
                f64::from((distance - config.near_distance) / span)
            } else {
                1.0
            };
            Some(near + (far - near) * k.clamp(0.0, 1.0))
        }
        Band::Beyond => Some(far),
        Band::Suppressed => None,
    }
}

/// What to do with the current local state for one peer this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Hold,
    Send,
    /// A critical field changed; sent regardless of interval and band.
    SendCritical,
}

/// Per-peer bookkeeping of the last transmitted state.
#[derive(Debug, Clone, Default)]
pub struct StateThrottle {
    since_send: f64,
    last_sent: Option<State>,
    /// State offered on the previous tick, sent or not. Critical changes are
    /// detected against it while nothing has been sent.
    last_seen: Option<State>,
}

impl StateThrottle {
    pub fn tick(&mut self, dt: f64) {
        self.since_send += dt;
    }

    pub fn since_send(&self) -> f64 {
        self.since_send
    }

    pub fn last_sent(&self) -> Option<&State> {
        self.last_sent.as_ref()
    }

    pub fn decide(&self, template: &StateTemplate, next: &State, interval: Option<f64>) -> Decision {
        let baseline = self.last_sent.as_ref().or(self.last_seen.as_ref());
        if template.critical_changed(baseline, next) {
            return Decision::SendCritical;
        }
        let Some(interval) = interval else {
            return Decision::Hold;
        };
        if self.since_send < interval {
            return Decision::Hold;
        }
        match &self.last_sent {
            Some(last) if template.matches(last, next) => Decision::Hold,
            _ => Decision::Send,
        }
    }

    pub fn mark_sent(&mut self, state: State) {
        self.since_send = 0.0;
        self.last_sent = Some(state);
    }

    pub fn observe(&mut self, state: &State) {
        self.last_seen = Some(state.clone());
    }

    /// Treat the peer as freshly connected. The observed baseline is kept so
    /// critical changes still reach a peer that gets no regular updates.
    pub fn reset(&mut self) {
        self.since_send = 0.0;
        self.last_sent = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Value, ValueTemplate};

    fn config() -> ReplicatorConfig {
        ReplicatorConfig {
            near_distance: 5.0,
            far_distance: 20.0,
            furthest_distance: 50.0,
            time_until_tx_state_near: 0.05,
            time_until_tx_state_far: 0.5,
            ..ReplicatorConfig::default()
        }
    }

    fn template() -> StateTemplate {
        StateTemplate::new()
            .declare("x", ValueTemplate::Float)
            .declare("alive", ValueTemplate::Bool)
            .critical()
    }

    fn state(x: f32, alive: bool) -> State {
        State::new(vec![Value::Float(x), Value::Bool(alive)])
    }

    #[test]
    fn test_bands() {
        let config = config();
        assert_eq!(Band::classify(&config, 3.0), Band::Near);
        assert_eq!(Band::classify(&config, 5.0), Band::Near);
        assert_eq!(Band::classify(&config, 10.0), Band::Far);
        assert_eq!(Band::classify(&config, 30.0), Band::Beyond);
        assert_eq!(Band::classify(&config, 50.0), Band::Beyond);
        assert_eq!(Band::classify(&config, 50.001), Band::Suppressed);
        assert_eq!(Band::classify(&config, f32::NAN), Band::Suppressed);
    }

    #[test]
    fn test_interval_is_monotonic_in_distance() {
        let config = config();
        let mut previous = 0.0;
        for step in 0..=500 {
            let distance = step as f32 * 0.1;
            let interval = state_interval(&config, distance).unwrap();
            assert!(interval >= previous, "interval shrank at {distance}");
            previous = interval;
        }
        assert_eq!(state_interval(&config, 3.0), Some(0.05));
        assert_eq!(state_interval(&config, 20.0), Some(0.5));
        assert_eq!(state_interval(&config, 50.0 + 1e-3), None);
    }

    #[test]
    fn test_collapsed_bands_use_far_rate() {
        let config = ReplicatorConfig {
            near_distance: 10.0,
            far_distance: 10.0,
            furthest_distance: 10.0,
            ..config()
        };
        assert_eq!(state_interval(&config, 10.0), Some(0.05));
        assert_eq!(state_interval(&config, 10.5), None);
    }

    #[test]
    fn test_first_send_waits_for_interval() {
        let config = config();
        let template = template();
        let mut throttle = StateThrottle::default();
        let next = state(1.0, true);
        let interval = state_interval(&config, 3.0);

        let mut sent_at = None;
        for tick in 1..=10 {
            throttle.tick(0.016);
            if throttle.decide(&template, &next, interval) != Decision::Hold {
                sent_at = Some(tick);
                break;
            }
        }
        assert_eq!(sent_at, Some(4));
    }

    #[test]
    fn test_identical_state_is_not_resent() {
        let template = template();
        let mut throttle = StateThrottle::default();
        throttle.mark_sent(state(1.0, true));
        throttle.tick(10.0);
        assert_eq!(
            throttle.decide(&template, &state(1.0, true), Some(0.05)),
            Decision::Hold
        );
        assert_eq!(
            throttle.decide(&template, &state(2.0, true), Some(0.05)),
            Decision::Send
        );
    }

    #[test]
    fn test_critical_change_bypasses_timer_and_suppression() {
        let template = template();
        let mut throttle = StateThrottle::default();
        throttle.mark_sent(state(1.0, true));
        assert_eq!(
            throttle.decide(&template, &state(1.0, false), None),
            Decision::SendCritical
        );
        assert_eq!(
            throttle.decide(&template, &state(9.0, true), None),
            Decision::Hold
        );
    }

    #[test]
    fn test_critical_change_detected_before_first_send() {
        let template = template();
        let mut throttle = StateThrottle::default();
        for _ in 0..10 {
            throttle.tick(0.1);
            assert_eq!(
                throttle.decide(&template, &state(1.0, true), None),
                Decision::Hold
            );
            throttle.observe(&state(1.0, true));
        }
        assert_eq!(
            throttle.decide(&template, &state(1.0, false), None),
            Decision::SendCritical
        );

        throttle.mark_sent(state(1.0, false));
        throttle.reset();
        throttle.observe(&state(1.0, false));
        assert_eq!(
            throttle.decide(&template, &state(1.0, true), None),
            Decision::SendCritical
        );
    }

    #[test]
    fn test_reset_forgets_last_sent() {
        let template = template();
        let mut throttle = StateThrottle::default();
        throttle.mark_sent(state(1.0, true));
        throttle.reset();
        assert!(throttle.last_sent().is_none());
        throttle.tick(0.1);
        assert_eq!(
            throttle.decide(&template, &state(1.0, true), Some(0.05)),
            Decision::Send
        );
    }
}
