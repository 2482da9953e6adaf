//! Local stand-in for one remote peer.
//!
//! A proxy holds what this session knows about a peer: latency statistics
//! in both directions, the peer's clock rate, its last three state samples
//! and the event queues to and from it. Proxies are created and destroyed by
//! the [`Replicator`](crate::Replicator) as the topology reports nodes.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use nebula_net::Handle;

use crate::error::ReplicatorError;
use crate::event::{EventInbox, EventOutbox, PreparedEvent, ReplicatedEvent, count_instances};
use crate::latency::{LatencyEstimator, TimeRateEstimator};
use crate::state::{DEFAULT_MAX_EXTRAPOLATION, FieldPhase, Sample, State, StateTemplate};
use crate::throttle::StateThrottle;
use crate::value::Transform;

/// Where a received state sample landed in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StateSlot {
    /// Became the newest sample.
    Newest,
    /// Arrived out of order and slotted into the older samples.
    Older,
    /// Duplicate or older than every kept sample.
    Dropped,
}

#[derive(Debug, Clone)]
struct TimedState {
    state: State,
    time: f64,
}

/// One remote peer as seen by the local session.
pub struct Proxy {
    handle: Handle,
    name: String,
    user: Option<Box<dyn Any>>,
    object: Option<Box<dyn Any>>,
    pub(crate) status: u8,
    origin: Transform,
    state_template: Option<Arc<StateTemplate>>,
    pub(crate) connected: bool,
    pub(crate) primary: bool,
    pub(crate) relayed: bool,
    pub(crate) latency: LatencyEstimator,
    pub(crate) reverse_latency: f64,
    pub(crate) reverse_latency_spread: f64,
    pub(crate) time_rate: TimeRateEstimator,
    // Newest first: S0, N1, N2.
    history: [Option<TimedState>; 3],
    received_at: Option<f64>,
    pub(crate) max_extrapolation: f64,
    pub(crate) throttle: StateThrottle,
    send_state_enabled: bool,
    pub(crate) outbox: EventOutbox,
    pub(crate) inbox: EventInbox,
}

impl Proxy {
    pub(crate) fn new(handle: Handle, name: String) -> Self {
        Self {
            handle,
            name,
            user: None,
            object: None,
            status: 0,
            origin: Transform::IDENTITY,
            state_template: None,
            connected: true,
            primary: false,
            relayed: false,
            latency: LatencyEstimator::default(),
            reverse_latency: 0.0,
            reverse_latency_spread: 0.0,
            time_rate: TimeRateEstimator::default(),
            history: [None, None, None],
            received_at: None,
            max_extrapolation: DEFAULT_MAX_EXTRAPOLATION,
            throttle: StateThrottle::default(),
            send_state_enabled: true,
            outbox: EventOutbox::default(),
            inbox: EventInbox::default(),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Application status last reported by the peer.
    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn user(&self) -> Option<&dyn Any> {
        self.user.as_deref()
    }

    pub fn user_mut(&mut self) -> Option<&mut dyn Any> {
        self.user.as_deref_mut()
    }

    pub fn set_user(&mut self, user: Option<Box<dyn Any>>) {
        self.user = user;
    }

    /// Application object associated with this peer, downcast to `T`.
    pub fn object<T: 'static>(&self) -> Option<&T> {
        self.object.as_deref().and_then(|object| object.downcast_ref())
    }

    pub fn object_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.object
            .as_deref_mut()
            .and_then(|object| object.downcast_mut())
    }

    pub fn set_object(&mut self, object: Option<Box<dyn Any>>) {
        self.object = object;
    }

    /// Frame the peer's spatial fields are made absolute in.
    pub fn origin(&self) -> &Transform {
        &self.origin
    }

    pub fn set_origin(&mut self, origin: Transform) {
        self.origin = origin;
    }

    /// Template used to decode the peer's states.
    pub fn state_template(&self) -> Option<&Arc<StateTemplate>> {
        self.state_template.as_ref()
    }

    /// Install a different inbound template. Received states are discarded
    /// when the template changes.
    pub fn set_state_template(&mut self, template: Option<Arc<StateTemplate>>) {
        let same = match (&self.state_template, &template) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if !same {
            self.state_template = template;
            self.history = [None, None, None];
            self.received_at = None;
        }
    }

    /// False once the peer has been reported gone.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Local flag only. The session overwrites it when the topology's
    /// primary changes.
    pub fn set_primary(&mut self, primary: bool) {
        self.primary = primary;
    }

    /// Traffic goes through a relay. Informational.
    pub fn is_relayed(&self) -> bool {
        self.relayed
    }

    /// Estimated one-way latency to the peer, in seconds.
    pub fn latency(&self) -> f64 {
        self.latency.latency()
    }

    pub fn latency_spread(&self) -> f64 {
        self.latency.spread()
    }

    /// Latency from the peer to us, as estimated by the peer.
    pub fn reverse_latency(&self) -> f64 {
        self.reverse_latency
    }

    pub fn reverse_latency_spread(&self) -> f64 {
        self.reverse_latency_spread
    }

    pub fn is_latency_reliable(&self) -> bool {
        self.latency.is_reliable()
    }

    /// Remote seconds per local second.
    pub fn time_rate(&self) -> f64 {
        self.time_rate.rate()
    }

    pub fn reset_latencies(&mut self) {
        self.latency.reset();
        self.reverse_latency = 0.0;
        self.reverse_latency_spread = 0.0;
        self.time_rate.reset();
    }

    /// Forget sent and received states; the next tick treats the peer as
    /// freshly connected.
    pub fn reset_states(&mut self) {
        self.history = [None, None, None];
        self.received_at = None;
        self.throttle.reset();
    }

    /// Most recently received state, as received.
    pub fn state(&self) -> Option<&State> {
        self.history[0].as_ref().map(|s0| &s0.state)
    }

    /// Sender network time of the newest state.
    pub fn state_time(&self) -> Option<f64> {
        self.history[0].as_ref().map(|s0| s0.time)
    }

    /// Local network time when the newest state arrived.
    pub fn state_received_at(&self) -> Option<f64> {
        self.received_at
    }

    /// Newest state advanced to network time `time`, still in the sender's
    /// frame.
    pub fn extrapolated_state(&self, time: f64) -> Option<State> {
        let template = self.state_template.as_ref()?;
        let s0 = sample(&self.history[0])?;
        let time = time.min(s0.time + self.max_extrapolation);
        Some(template.extrapolate(
            sample(&self.history[2]),
            sample(&self.history[1]),
            s0,
            time,
        ))
    }

    /// Newest state advanced to `time` with spatial fields mapped through
    /// this proxy's origin.
    pub fn filtered_state(&self, time: f64) -> Option<State> {
        let template = self.state_template.as_ref()?;
        let state = self.extrapolated_state(time)?;
        Some(template.from_relative(&state, &self.origin))
    }

    /// Blend `current` towards the filtered state by `coeff`.
    pub fn smoothed_state(&self, time: f64, current: &State, coeff: f32) -> Option<State> {
        let template = self.state_template.as_ref()?;
        let target = self.filtered_state(time)?;
        if template.validate(current).is_err() {
            return Some(target);
        }
        Some(template.lerp(current, &target, coeff.clamp(0.0, 1.0)))
    }

    /// Extrapolation phase of every inbound field at `time`.
    pub fn field_phases(&self, time: f64) -> Vec<FieldPhase> {
        match &self.state_template {
            Some(template) => template.phases(self.state_time(), time),
            None => Vec::new(),
        }
    }

    pub fn is_send_state_enabled(&self) -> bool {
        self.send_state_enabled
    }

    /// Stop or resume sending local state to this peer.
    pub fn set_send_state_enabled(&mut self, enabled: bool) {
        self.send_state_enabled = enabled;
    }

    /// Queue an event for this peer only.
    pub fn send_event<E: ReplicatedEvent>(&mut self, event: E) -> Result<(), ReplicatorError> {
        self.queue_event(PreparedEvent::new(event)?, false);
        Ok(())
    }

    /// Queue an event delivered after every earlier in-order event.
    pub fn send_event_in_order<E: ReplicatedEvent>(
        &mut self,
        event: E,
    ) -> Result<(), ReplicatorError> {
        self.queue_event(PreparedEvent::new(event)?, true);
        Ok(())
    }

    /// Events queued to this peer and not yet acknowledged.
    pub fn pending_event_count(&self) -> usize {
        count_instances(self.outbox.instances())
    }

    pub(crate) fn queue_event(&mut self, event: PreparedEvent, in_order: bool) {
        self.outbox.push(event, in_order);
    }

    /// Slot a decoded state into the history.
    pub(crate) fn receive_state(&mut self, state: State, time: f64, now: f64) -> StateSlot {
        let entry = TimedState { state, time };
        let position = self
            .history
            .iter()
            .position(|slot| slot.as_ref().is_none_or(|kept| time >= kept.time));
        let Some(position) = position else {
            return StateSlot::Dropped;
        };
        if self.history[position]
            .as_ref()
            .is_some_and(|kept| kept.time == time)
        {
            return StateSlot::Dropped;
        }

        for index in (position + 1..self.history.len()).rev() {
            self.history[index] = self.history[index - 1].take();
        }
        self.history[position] = Some(entry);
        if position == 0 {
            self.received_at = Some(now);
            StateSlot::Newest
        } else {
            StateSlot::Older
        }
    }
}

fn sample(slot: &Option<TimedState>) -> Option<Sample<'_>> {
    slot.as_ref().map(|entry| Sample {
        state: &entry.state,
        time: entry.time,
    })
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.relayed {
            write!(f, "{} (relayed)", self.handle)
        } else {
            write!(f, "{}", self.handle)
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("primary", &self.primary)
            .field("relayed", &self.relayed)
            .field("latency", &self.latency.latency())
            .field("state_time", &self.state_time())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Value, ValueTemplate};
    use glam::Vec3;

    fn proxy() -> Proxy {
        let mut proxy = Proxy::new(Handle(0x2a), "peer".into());
        let template = StateTemplate::new()
            .declare("position", ValueTemplate::Vector)
            .spatial();
        proxy.set_state_template(Some(Arc::new(template)));
        proxy
    }

    fn at(x: f32) -> State {
        State::new(vec![Value::Vector(Vec3::new(x, 0.0, 0.0))])
    }

    fn x_of(state: &State) -> f32 {
        state.values()[0].as_vector().unwrap().x
    }

    #[test]
    fn test_history_orders_samples() {
        let mut proxy = proxy();
        assert_eq!(proxy.receive_state(at(1.0), 1.0, 5.0), StateSlot::Newest);
        assert_eq!(proxy.receive_state(at(3.0), 3.0, 5.1), StateSlot::Newest);
        assert_eq!(proxy.receive_state(at(2.0), 2.0, 5.2), StateSlot::Older);
        assert_eq!(proxy.receive_state(at(0.0), 0.0, 5.3), StateSlot::Dropped);
        assert_eq!(proxy.receive_state(at(3.0), 3.0, 5.4), StateSlot::Dropped);
        assert_eq!(proxy.state_time(), Some(3.0));
        assert_eq!(proxy.state_received_at(), Some(5.1));
    }

    #[test]
    fn test_extrapolates_along_history() {
        let mut proxy = proxy();
        proxy.receive_state(at(0.0), 0.0, 0.0);
        proxy.receive_state(at(1.0), 1.0, 1.0);
        let state = proxy.extrapolated_state(1.5).unwrap();
        assert!((x_of(&state) - 1.5).abs() < 1e-5);
        let fresh = proxy.extrapolated_state(1.0).unwrap();
        assert_eq!(fresh, at(1.0));
    }

    #[test]
    fn test_filtered_state_applies_origin() {
        let mut proxy = proxy();
        proxy.set_origin(Transform::from_translation(Vec3::new(100.0, 0.0, 0.0)));
        proxy.receive_state(at(2.0), 1.0, 1.0);
        let state = proxy.filtered_state(1.0).unwrap();
        assert_eq!(x_of(&state), 102.0);
    }

    #[test]
    fn test_extrapolation_capped() {
        let mut proxy = proxy();
        proxy.max_extrapolation = 0.5;
        proxy.receive_state(at(0.0), 0.0, 0.0);
        proxy.receive_state(at(1.0), 1.0, 1.0);
        let late = proxy.extrapolated_state(100.0).unwrap();
        assert!((x_of(&late) - 1.5).abs() < 1e-5);
    }

    #[test]
    fn test_smoothed_state_blends() {
        let mut proxy = proxy();
        proxy.receive_state(at(10.0), 1.0, 1.0);
        let smoothed = proxy.smoothed_state(1.0, &at(0.0), 0.25).unwrap();
        assert!((x_of(&smoothed) - 2.5).abs() < 1e-5);
    }

    #[test]
    fn test_reset_states_clears_history() {
        let mut proxy = proxy();
        proxy.receive_state(at(1.0), 1.0, 1.0);
        proxy.throttle.mark_sent(at(1.0));
        proxy.reset_states();
        assert!(proxy.state().is_none());
        assert!(proxy.throttle.last_sent().is_none());
        assert!(proxy.field_phases(2.0).iter().all(|p| *p == FieldPhase::Unknown));
    }

    #[test]
    fn test_template_change_discards_states() {
        let mut proxy = proxy();
        proxy.receive_state(at(1.0), 1.0, 1.0);
        let same = proxy.state_template().cloned();
        proxy.set_state_template(same);
        assert!(proxy.state().is_some());
        proxy.set_state_template(Some(Arc::new(StateTemplate::new())));
        assert!(proxy.state().is_none());
    }

    #[test]
    fn test_display_marks_relay() {
        let mut proxy = proxy();
        assert_eq!(proxy.to_string(), "2a");
        proxy.relayed = true;
        assert_eq!(proxy.to_string(), "2a (relayed)");
    }

    #[test]
    fn test_object_downcast() {
        let mut proxy = proxy();
        proxy.set_object(Some(Box::new(7u32)));
        assert_eq!(proxy.object::<u32>(), Some(&7));
        assert_eq!(proxy.object::<i64>(), None);
        *proxy.object_mut::<u32>().unwrap() += 1;
        assert_eq!(proxy.object::<u32>(), Some(&8));
    }
}
