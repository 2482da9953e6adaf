//! The replication session.
//!
//! A [`Replicator`] is bound to a [`Topology`] and driven by [`update`]:
//! it turns topology transitions into proxies, drains and decodes incoming
//! datagrams, pings peers in round-robin, sends the local state to every
//! peer through the distance/time throttle, delivers and resends events,
//! and keeps the session clock synchronized with the primary peer.
//!
//! [`update`]: Replicator::update

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use nebula_config::ReplicatorConfig;
use nebula_net::{Handle, MAX_DATAGRAM_SIZE, NodeEvent, Topology};

use crate::clock::TimeSync;
use crate::error::ReplicatorError;
use crate::event::{
    CancelMode, PreparedEvent, ReplicatedEvent, SharedEvent, cancel_instances, count_instances,
};
use crate::listener::{ListenerArena, ListenerId};
use crate::message::{AckBody, EventBody, Message, PingBody};
use crate::proxy::{Proxy, StateSlot};
use crate::state::{State, StateTemplate};
use crate::throttle::{Decision, state_interval};
use crate::value::Transform;

/// What happened to a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorEventKind {
    Connected,
    Disconnected,
    State,
    Status,
}

/// Notification handed to state listeners.
#[derive(Debug, Clone, Copy)]
pub struct ReplicatorEvent<'a> {
    pub kind: ReplicatorEventKind,
    /// For `Disconnected`, the proxy has already left the session.
    pub proxy: &'a Proxy,
}

/// Counters kept by a session since `create`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicatorStats {
    pub datagrams_received: u64,
    pub malformed_datagrams: u64,
    /// Datagrams from handles without a proxy.
    pub foreign_datagrams: u64,
    pub states_sent: u64,
    pub states_received: u64,
    pub states_dropped: u64,
    pub events_sent: u64,
    pub events_received: u64,
    pub events_discarded: u64,
    pub pings_sent: u64,
    pub rejected_connections: u64,
    pub send_failures: u64,
}

/// Identifies a registered event listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventListenerId(ListenerId);

type StateListener = Box<dyn FnMut(&Replicator, f64, ReplicatorEvent<'_>)>;
type ErasedEventListener =
    Box<dyn FnMut(&Replicator, f64, &Proxy, &[u8]) -> Result<bool, postcard::Error>>;
type DistanceMetric = Box<dyn Fn(&Transform, &Proxy) -> f32>;

struct EventListenerEntry {
    kind: &'static str,
    callback: ErasedEventListener,
}

/// Summary of a set of latencies.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct LatencySummary {
    average: f64,
    best: f64,
    worst: f64,
}

impl LatencySummary {
    fn of(values: impl Iterator<Item = f64>) -> Self {
        let mut count = 0u32;
        let mut summary = LatencySummary {
            average: 0.0,
            best: f64::INFINITY,
            worst: 0.0,
        };
        for value in values {
            count += 1;
            summary.average += value;
            summary.best = summary.best.min(value);
            summary.worst = summary.worst.max(value);
        }
        if count == 0 {
            return LatencySummary::default();
        }
        summary.average /= f64::from(count);
        summary
    }
}

/// Replication session over a pluggable topology.
pub struct Replicator {
    name: String,
    topology: Option<Box<dyn Topology>>,
    config: ReplicatorConfig,
    failed: bool,
    proxies: BTreeMap<Handle, Proxy>,
    listeners: ListenerArena<StateListener>,
    event_listeners: ListenerArena<EventListenerEntry>,
    origin: Transform,
    state_template: Option<Arc<StateTemplate>>,
    send_state: Option<State>,
    status: u8,
    clock: TimeSync,
    local_time: f64,
    time_until_ping: f64,
    last_pinged: Option<Handle>,
    primary: Option<Handle>,
    distance: DistanceMetric,
    cancel_deferred: bool,
    stats: ReplicatorStats,
    scratch: Vec<u8>,
}

impl Replicator {
    /// An unbound session; `name` prefixes its log lines.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topology: None,
            config: ReplicatorConfig::default(),
            failed: false,
            proxies: BTreeMap::new(),
            listeners: ListenerArena::default(),
            event_listeners: ListenerArena::default(),
            origin: Transform::IDENTITY,
            state_template: None,
            send_state: None,
            status: 0,
            clock: TimeSync::default(),
            local_time: 0.0,
            time_until_ping: 0.0,
            last_pinged: None,
            primary: None,
            distance: Box::new(|origin: &Transform, proxy: &Proxy| {
                origin.translation.distance(proxy.origin().translation)
            }),
            cancel_deferred: false,
            stats: ReplicatorStats::default(),
            scratch: vec![0; MAX_DATAGRAM_SIZE],
        }
    }

    /// Name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Bind a topology. Proxies are created for nodes it already reports.
    pub fn create(
        &mut self,
        topology: Box<dyn Topology>,
        config: ReplicatorConfig,
    ) -> Result<(), ReplicatorError> {
        if self.topology.is_some() {
            return Err(ReplicatorError::AlreadyBound);
        }
        config.validate()?;

        self.config = config;
        self.failed = false;
        self.stats = ReplicatorStats::default();
        let enabled = self.clock.is_enabled();
        self.clock = TimeSync::default();
        self.clock.set_enabled(enabled);
        self.local_time = 0.0;
        self.time_until_ping = 0.0;
        self.last_pinged = None;
        self.primary = None;
        self.cancel_deferred = false;

        let existing: Vec<Handle> = (0..topology.node_count())
            .filter_map(|index| topology.node_handle(index))
            .collect();
        self.topology = Some(topology);
        self.refresh_nodes();
        tracing::info!("Replicator [{}]: created", self.name);

        for handle in existing {
            self.connect(handle);
        }
        Ok(())
    }

    /// Cancel pending events, drop every proxy and release the topology.
    pub fn destroy(&mut self) -> Option<Box<dyn Topology>> {
        self.cancel_all_events(CancelMode::Immediate);
        for proxy in self.proxies.values_mut() {
            proxy.connected = false;
        }
        self.proxies.clear();
        self.failed = false;
        let topology = self.topology.take();
        if topology.is_some() {
            tracing::info!("Replicator [{}]: destroyed", self.name);
        }
        topology
    }

    /// True between `create` and `destroy`.
    pub fn is_bound(&self) -> bool {
        self.topology.is_some()
    }

    /// Active tuning parameters.
    pub fn configuration(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// Replace the configuration. An invalid one is rejected and the
    /// current one kept.
    pub fn set_configuration(&mut self, config: ReplicatorConfig) -> Result<(), ReplicatorError> {
        config.validate()?;
        for proxy in self.proxies.values_mut() {
            proxy.max_extrapolation = config.max_extrapolation;
        }
        self.config = config;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Update
    // -----------------------------------------------------------------------

    /// Advance the session by `dt` seconds.
    pub fn update(&mut self, dt: f64) -> Result<(), ReplicatorError> {
        if self.failed {
            return Err(ReplicatorError::Inert);
        }
        let topology = self.topology.as_mut().ok_or(ReplicatorError::NotBound)?;

        let mut transitions: Vec<NodeEvent> = Vec::new();
        if let Err(err) = topology.update(dt, &mut transitions) {
            tracing::error!("Replicator [{}]: transport failure: {err}", self.name);
            self.failed = true;
            return Err(err.into());
        }

        self.local_time += dt;
        for transition in transitions {
            match transition {
                NodeEvent::Connected(handle) => self.connect(handle),
                NodeEvent::Disconnected(handle) => self.disconnect(handle),
            }
        }
        self.refresh_nodes();

        let authoritative = self.is_primary();
        self.clock.advance(
            dt,
            authoritative,
            self.config.time_variance_threshold,
            self.config.time_sync_settle,
        );

        self.receive();
        self.send_pings(dt);
        self.send_states(dt);
        self.send_events(dt);
        Ok(())
    }

    fn local_handle(&self) -> Option<Handle> {
        self.topology.as_deref().map(|topology| topology.local_handle())
    }

    /// Sync relay and primary flags with the topology snapshot.
    fn refresh_nodes(&mut self) {
        let Some(topology) = self.topology.as_deref() else {
            return;
        };
        for proxy in self.proxies.values_mut() {
            proxy.relayed = topology
                .find_node(proxy.handle())
                .is_some_and(|node| node.relayed);
        }

        let primary = topology.primary_handle();
        if self.primary != Some(primary) {
            self.primary = Some(primary);
            for proxy in self.proxies.values_mut() {
                proxy.primary = proxy.handle() == primary;
            }
            self.clock.reset_measurements();
            tracing::debug!("Replicator [{}]: primary is now {primary}", self.name);
        }
    }

    fn connect(&mut self, handle: Handle) {
        if Some(handle) == self.local_handle() || self.proxies.contains_key(&handle) {
            return;
        }
        if let Some(max) = self.config.max_proxies
            && self.proxies.len() >= max
        {
            self.stats.rejected_connections += 1;
            tracing::warn!(
                "Replicator [{}]: rejected {handle}, proxy limit of {max} reached",
                self.name
            );
            return;
        }

        let node = self
            .topology
            .as_deref()
            .and_then(|topology| topology.find_node(handle))
            .cloned();
        let name = node.as_ref().map(|node| node.name.clone()).unwrap_or_default();
        let mut proxy = Proxy::new(handle, name);
        proxy.relayed = node.is_some_and(|node| node.relayed);
        proxy.primary = self.primary == Some(handle);
        proxy.max_extrapolation = self.config.max_extrapolation;
        proxy.set_state_template(self.state_template.clone());
        tracing::info!("Replicator [{}]: {proxy} connected", self.name);
        self.proxies.insert(handle, proxy);

        self.send_ping(handle);
        self.notify(handle, ReplicatorEventKind::Connected);
    }

    fn disconnect(&mut self, handle: Handle) {
        let Some(mut proxy) = self.proxies.remove(&handle) else {
            return;
        };
        proxy.connected = false;
        tracing::info!("Replicator [{}]: {proxy} disconnected", self.name);
        if !self.listeners.is_empty() {
            let mut listeners = std::mem::take(&mut self.listeners);
            self.dispatch(
                &mut listeners,
                ReplicatorEvent {
                    kind: ReplicatorEventKind::Disconnected,
                    proxy: &proxy,
                },
            );
            self.listeners = listeners;
        }

        // Events still queued to another peer stay alive.
        let remaining: Vec<&SharedEvent> = self
            .proxies
            .values()
            .flat_map(|other| other.outbox.instances())
            .collect();
        let orphaned = proxy
            .outbox
            .instances()
            .filter(|event| !remaining.iter().any(|other| Arc::ptr_eq(event, other)));
        let cancelled = cancel_instances(orphaned, CancelMode::Immediate);
        if cancelled > 0 {
            tracing::debug!(
                "Replicator [{}]: cancelled {cancelled} event(s) pending for {proxy}",
                self.name
            );
        }
        proxy.outbox.clear();
    }

    fn notify(&mut self, handle: Handle, kind: ReplicatorEventKind) {
        if self.listeners.is_empty() {
            return;
        }
        let mut listeners = std::mem::take(&mut self.listeners);
        if let Some(proxy) = self.proxies.get(&handle) {
            self.dispatch(&mut listeners, ReplicatorEvent { kind, proxy });
        }
        self.listeners = listeners;
    }

    fn dispatch(&self, listeners: &mut ListenerArena<StateListener>, event: ReplicatorEvent<'_>) {
        let time = self.clock.time();
        for listener in listeners.iter_mut() {
            listener(self, time, event);
        }
    }

    // -----------------------------------------------------------------------
    // Receive
    // -----------------------------------------------------------------------

    fn receive(&mut self) {
        let mut deliveries: Vec<(Handle, f64, EventBody)> = Vec::new();
        loop {
            let Some(topology) = self.topology.as_mut() else {
                break;
            };
            let Some((size, from)) = topology.recv(&mut self.scratch) else {
                break;
            };
            self.stats.datagrams_received += 1;

            if !self.proxies.contains_key(&from) {
                self.stats.foreign_datagrams += 1;
                tracing::debug!(
                    "Replicator [{}]: dropped {size} byte(s) from unknown peer {from}",
                    self.name
                );
                continue;
            }
            let (remote_time, message) = match Message::decode(&self.scratch[..size]) {
                Ok(decoded) => decoded,
                Err(err) => {
                    self.stats.malformed_datagrams += 1;
                    tracing::debug!("Replicator [{}]: malformed datagram from {from}: {err}", self.name);
                    continue;
                }
            };
            self.handle_message(from, remote_time, message, &mut deliveries);
        }
        self.deliver_events(deliveries);
    }

    fn handle_message(
        &mut self,
        from: Handle,
        remote_time: f64,
        message: Message,
        deliveries: &mut Vec<(Handle, f64, EventBody)>,
    ) {
        let now = self.clock.time();
        let local_time = self.local_time;
        let sync_source = self.primary == Some(from) && !self.is_primary();
        let Some(proxy) = self.proxies.get_mut(&from) else {
            return;
        };
        proxy.time_rate.record(local_time, remote_time);

        match message {
            Message::Ping(body) => {
                proxy.reverse_latency = f64::from(body.latency);
                proxy.reverse_latency_spread = f64::from(body.spread);
                let status_changed = proxy.status != body.status;
                proxy.status = body.status;
                let reply = Message::Pong(PingBody {
                    origin: body.origin,
                    status: self.status,
                    latency: proxy.latency() as f32,
                    spread: proxy.latency_spread() as f32,
                });
                let estimate = proxy
                    .is_latency_reliable()
                    .then(|| remote_time + proxy.latency());

                self.transmit(from, &reply);
                if sync_source && let Some(estimate) = estimate {
                    self.observe_time(estimate);
                }
                if status_changed {
                    self.notify(from, ReplicatorEventKind::Status);
                }
            }
            Message::Pong(body) => {
                proxy.reverse_latency = f64::from(body.latency);
                proxy.reverse_latency_spread = f64::from(body.spread);
                let status_changed = proxy.status != body.status;
                proxy.status = body.status;
                let round_trip = local_time - body.origin;
                let accepted = round_trip >= 0.0 && proxy.latency.record(round_trip / 2.0);

                if sync_source && accepted {
                    self.observe_time(remote_time + round_trip / 2.0);
                }
                if status_changed {
                    self.notify(from, ReplicatorEventKind::Status);
                }
            }
            Message::State(bytes) => {
                let Some(template) = proxy.state_template().cloned() else {
                    self.stats.states_dropped += 1;
                    tracing::debug!(
                        "Replicator [{}]: state from {proxy} dropped, no template",
                        self.name
                    );
                    return;
                };
                let state = match template.unpack(&bytes) {
                    Ok(state) => state,
                    Err(err) => {
                        self.stats.malformed_datagrams += 1;
                        tracing::debug!(
                            "Replicator [{}]: undecodable state from {proxy}: {err}",
                            self.name
                        );
                        return;
                    }
                };
                let estimate = proxy
                    .is_latency_reliable()
                    .then(|| remote_time + proxy.latency());
                match proxy.receive_state(state, remote_time, now) {
                    StateSlot::Newest => {
                        self.stats.states_received += 1;
                        if sync_source && let Some(estimate) = estimate {
                            self.observe_time(estimate);
                        }
                        self.notify(from, ReplicatorEventKind::State);
                    }
                    StateSlot::Older => self.stats.states_received += 1,
                    StateSlot::Dropped => {
                        self.stats.states_dropped += 1;
                        tracing::debug!(
                            "Replicator [{}]: state from {proxy} at {remote_time:.3} is too old",
                            self.name
                        );
                    }
                }
            }
            Message::Event(body) => {
                let ack = Message::EventAck(AckBody {
                    sequence: body.sequence,
                    in_order: body.in_order,
                });
                let ready = proxy.inbox.receive(body);
                deliveries.extend(ready.into_iter().map(|body| (from, remote_time, body)));
                self.transmit(from, &ack);
            }
            Message::EventAck(ack) => {
                proxy.outbox.acknowledge(ack.sequence, ack.in_order);
            }
        }
    }

    fn observe_time(&mut self, remote_now: f64) {
        let adjust = self.clock.observe(remote_now);
        tracing::trace!(
            "Replicator [{}]: time adjusted by {adjust:+.4}s, variance {:.4}",
            self.name,
            self.clock.variance()
        );
    }

    fn deliver_events(&mut self, deliveries: Vec<(Handle, f64, EventBody)>) {
        if deliveries.is_empty() {
            return;
        }
        self.stats.events_received += deliveries.len() as u64;
        let mut listeners = std::mem::take(&mut self.event_listeners);
        let mut malformed = 0u64;

        for (from, time, body) in &deliveries {
            let Some(proxy) = self.proxies.get(from) else {
                continue;
            };
            let mut matched = false;
            let mut accepted = false;
            for entry in listeners.iter_mut().filter(|entry| entry.kind == body.kind) {
                matched = true;
                match (entry.callback)(self, *time, proxy, &body.payload) {
                    Ok(result) => accepted |= result,
                    Err(err) => {
                        malformed += 1;
                        tracing::debug!(
                            "Replicator [{}]: event `{}` from {proxy} does not decode: {err}",
                            self.name,
                            body.kind
                        );
                    }
                }
            }
            if matched && !accepted {
                tracing::warn!(
                    "Replicator [{}]: event `{}` from {proxy} was not processed by any listener",
                    self.name,
                    body.kind
                );
            } else if !matched {
                tracing::debug!(
                    "Replicator [{}]: no listener for event `{}` from {proxy}",
                    self.name,
                    body.kind
                );
            }
        }

        self.event_listeners = listeners;
        self.stats.malformed_datagrams += malformed;
    }

    // -----------------------------------------------------------------------
    // Transmit
    // -----------------------------------------------------------------------

    fn transmit(&mut self, to: Handle, message: &Message) -> bool {
        let bytes = match message.encode(self.clock.time()) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!("Replicator [{}]: unable to encode message: {err}", self.name);
                return false;
            }
        };
        self.transmit_bytes(to, &bytes)
    }

    fn transmit_bytes(&mut self, to: Handle, bytes: &[u8]) -> bool {
        let Some(topology) = self.topology.as_mut() else {
            return false;
        };
        match topology.send(to, bytes) {
            Ok(()) => true,
            Err(err) => {
                self.stats.send_failures += 1;
                tracing::debug!("Replicator [{}]: send to {to} failed: {err}", self.name);
                false
            }
        }
    }

    fn send_ping(&mut self, to: Handle) {
        let Some(proxy) = self.proxies.get(&to) else {
            return;
        };
        let ping = Message::Ping(PingBody {
            origin: self.local_time,
            status: self.status,
            latency: proxy.latency() as f32,
            spread: proxy.latency_spread() as f32,
        });
        if self.transmit(to, &ping) {
            self.stats.pings_sent += 1;
        }
    }

    /// One ping per turn, cycling through peers so each is pinged every
    /// `time_until_tx_ping`.
    fn send_pings(&mut self, dt: f64) {
        if self.proxies.is_empty() {
            return;
        }
        self.time_until_ping -= dt;
        if self.time_until_ping > 0.0 {
            return;
        }
        let next = self
            .last_pinged
            .and_then(|last| {
                self.proxies
                    .range((Bound::Excluded(last), Bound::Unbounded))
                    .next()
                    .map(|(handle, _)| *handle)
            })
            .or_else(|| self.proxies.keys().next().copied());
        if let Some(handle) = next {
            self.send_ping(handle);
            self.last_pinged = Some(handle);
        }
        self.time_until_ping = self.config.time_until_tx_ping / self.proxies.len() as f64;
    }

    fn send_states(&mut self, dt: f64) {
        for proxy in self.proxies.values_mut() {
            proxy.throttle.tick(dt);
        }
        let (Some(template), Some(state)) = (self.state_template.clone(), self.send_state.as_ref())
        else {
            return;
        };
        let relative = template.to_relative(state, &self.origin);

        let mut targets = Vec::new();
        for proxy in self.proxies.values() {
            if !proxy.is_send_state_enabled() {
                continue;
            }
            let interval = state_interval(&self.config, (self.distance)(&self.origin, proxy));
            match proxy.throttle.decide(&template, &relative, interval) {
                Decision::Hold => {}
                Decision::Send => targets.push((proxy.handle(), false)),
                Decision::SendCritical => targets.push((proxy.handle(), true)),
            }
        }
        let mut unsent = Vec::new();
        if !targets.is_empty() {
            let datagram = match template
                .pack(&relative)
                .map_err(ReplicatorError::from)
                .and_then(|packed| Ok(Message::State(packed).encode(self.clock.time())?))
            {
                Ok(datagram) => datagram,
                Err(err) => {
                    tracing::warn!("Replicator [{}]: local state not sent: {err}", self.name);
                    return;
                }
            };

            for (handle, critical) in targets {
                if !self.transmit_bytes(handle, &datagram) {
                    if critical {
                        unsent.push(handle);
                    }
                    continue;
                }
                self.stats.states_sent += 1;
                if let Some(proxy) = self.proxies.get_mut(&handle) {
                    if critical {
                        tracing::trace!("Replicator [{}]: critical state sent to {proxy}", self.name);
                    }
                    proxy.throttle.mark_sent(relative.clone());
                }
            }
        }

        // A critical change that failed to go out is retried next tick.
        for proxy in self.proxies.values_mut() {
            if !unsent.contains(&proxy.handle()) {
                proxy.throttle.observe(&relative);
            }
        }
    }

    fn send_events(&mut self, dt: f64) {
        let first_only = self.cancel_deferred;
        let interval = self.config.event_resend_interval;
        let limit = self.config.event_resend_limit;
        self.pump_events(dt, interval, limit, first_only);

        if first_only {
            let cancelled = cancel_instances(
                self.proxies.values().flat_map(|proxy| proxy.outbox.instances()),
                CancelMode::Deferred,
            );
            for proxy in self.proxies.values_mut() {
                proxy.outbox.clear();
            }
            self.cancel_deferred = false;
            tracing::debug!("Replicator [{}]: cancelled {cancelled} deferred event(s)", self.name);
        }
    }

    fn pump_events(&mut self, dt: f64, interval: f64, limit: u32, first_only: bool) {
        let handles: Vec<Handle> = self.proxies.keys().copied().collect();
        for handle in handles {
            let Some(proxy) = self.proxies.get_mut(&handle) else {
                continue;
            };
            let poll = proxy.outbox.poll(dt, interval, limit, first_only);
            for kind in poll.discarded {
                self.stats.events_discarded += 1;
                tracing::warn!(
                    "Replicator [{}]: event `{kind}` to {handle} discarded after {limit} sends",
                    self.name
                );
            }
            for body in poll.send {
                if self.transmit(handle, &Message::Event(body)) {
                    self.stats.events_sent += 1;
                }
            }
        }
    }

    /// Transmit every event not sent yet without waiting for `update`.
    pub fn flush(&mut self) -> Result<(), ReplicatorError> {
        if self.failed {
            return Err(ReplicatorError::Inert);
        }
        if self.topology.is_none() {
            return Err(ReplicatorError::NotBound);
        }
        let interval = self.config.event_resend_interval;
        let limit = self.config.event_resend_limit;
        self.pump_events(0.0, interval, limit, true);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Local state
    // -----------------------------------------------------------------------

    /// Frame that spatial fields are sent relative to.
    pub fn origin(&self) -> &Transform {
        &self.origin
    }

    /// Frame the local state's spatial fields are expressed relative to.
    pub fn set_origin(&mut self, origin: Transform) {
        self.origin = origin;
    }

    /// Schema shared by local and remote states, once set.
    pub fn state_template(&self) -> Option<&Arc<StateTemplate>> {
        self.state_template.as_ref()
    }

    /// Install the outbound schema. Proxies without a template of their own
    /// decode with it too.
    pub fn set_state_template(&mut self, template: StateTemplate) {
        let template = Arc::new(template);
        let previous = self.state_template.replace(Arc::clone(&template));
        for proxy in self.proxies.values_mut() {
            let follows = match (proxy.state_template(), &previous) {
                (None, _) => true,
                (Some(current), Some(previous)) => Arc::ptr_eq(current, previous),
                (Some(_), None) => false,
            };
            if follows {
                proxy.set_state_template(Some(Arc::clone(&template)));
            }
            proxy.throttle.reset();
        }
        if let Some(state) = &self.send_state
            && template.validate(state).is_err()
        {
            self.send_state = None;
        }
    }

    /// Stage the local state sent by the next updates.
    pub fn set_send_state(&mut self, state: State) -> Result<(), ReplicatorError> {
        if let Some(template) = &self.state_template {
            template.validate(&state)?;
        }
        self.send_state = Some(state);
        Ok(())
    }

    pub fn send_state(&self) -> Option<&State> {
        self.send_state.as_ref()
    }

    /// The staged state as a peer would decode it.
    pub fn loopback_state(&self) -> Option<State> {
        let template = self.state_template.as_ref()?;
        let state = self.send_state.as_ref()?;
        let relative = template.to_relative(state, &self.origin);
        let bytes = template.pack(&relative).ok()?;
        template.unpack(&bytes).ok()
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    /// Application status announced to peers with every ping.
    pub fn set_status(&mut self, status: u8) {
        self.status = status;
    }

    /// Replace the distance associated with a proxy by the throttle.
    pub fn set_distance_metric<F>(&mut self, metric: F)
    where
        F: Fn(&Transform, &Proxy) -> f32 + 'static,
    {
        self.distance = Box::new(metric);
    }

    // -----------------------------------------------------------------------
    // Proxies and primary
    // -----------------------------------------------------------------------

    /// The connected peer behind `handle`.
    pub fn proxy(&self, handle: Handle) -> Option<&Proxy> {
        self.proxies.get(&handle)
    }

    /// Mutable access to the connected peer behind `handle`.
    pub fn proxy_mut(&mut self, handle: Handle) -> Option<&mut Proxy> {
        self.proxies.get_mut(&handle)
    }

    /// Connected peers in handle order.
    pub fn proxies(&self) -> impl Iterator<Item = &Proxy> {
        self.proxies.values()
    }

    /// Number of connected peers.
    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    /// Whether the local node is the topology's primary.
    pub fn is_primary(&self) -> bool {
        self.topology
            .as_deref()
            .is_some_and(|topology| topology.primary_handle() == topology.local_handle())
    }

    /// Designate the primary through the topology.
    pub fn set_primary(&mut self, handle: Handle) -> bool {
        let Some(topology) = self.topology.as_mut() else {
            return false;
        };
        if !topology.set_primary_handle(handle) {
            return false;
        }
        self.refresh_nodes();
        true
    }

    /// The primary peer, unless the local node is primary.
    pub fn primary_proxy(&self) -> Option<&Proxy> {
        self.proxies.values().find(|proxy| proxy.is_primary())
    }

    /// Clear every proxy's latency statistics.
    pub fn reset_all_latencies(&mut self) {
        for proxy in self.proxies.values_mut() {
            proxy.reset_latencies();
        }
    }

    fn latencies(&self, reverse: bool) -> LatencySummary {
        LatencySummary::of(self.proxies.values().filter_map(|proxy| {
            if reverse {
                (proxy.reverse_latency() > 0.0).then(|| proxy.reverse_latency())
            } else {
                (proxy.latency.samples() > 0).then(|| proxy.latency())
            }
        }))
    }

    /// Mean round-trip latency over peers with a sample, or 0.
    pub fn average_latency(&self) -> f64 {
        self.latencies(false).average
    }

    /// Lowest round-trip latency over measured peers, or 0.
    pub fn best_latency(&self) -> f64 {
        self.latencies(false).best
    }

    /// Highest round-trip latency over measured peers, or 0.
    pub fn worst_latency(&self) -> f64 {
        self.latencies(false).worst
    }

    /// Mean of the latencies peers report towards us, or 0.
    pub fn average_reverse_latency(&self) -> f64 {
        self.latencies(true).average
    }

    /// Lowest latency reported by a peer, or 0.
    pub fn best_reverse_latency(&self) -> f64 {
        self.latencies(true).best
    }

    /// Highest latency reported by a peer, or 0.
    pub fn worst_reverse_latency(&self) -> f64 {
        self.latencies(true).worst
    }

    // -----------------------------------------------------------------------
    // Time
    // -----------------------------------------------------------------------

    /// Session network time.
    pub fn time(&self) -> f64 {
        self.clock.time()
    }

    /// Seconds of `update` since `create`, never adjusted.
    pub fn local_time(&self) -> f64 {
        self.local_time
    }

    /// Spread of recent offsets to the primary's clock; infinite until measured.
    pub fn time_variance(&self) -> f64 {
        self.clock.variance()
    }

    pub fn is_time_synchronized(&self) -> bool {
        self.clock.is_synchronized()
    }

    /// Follow the primary's clock (default) or run on local time only.
    pub fn set_time_synchronization(&mut self, enabled: bool) {
        self.clock.set_enabled(enabled);
    }

    pub fn is_time_synchronization_enabled(&self) -> bool {
        self.clock.is_enabled()
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Queue `event` to every connected peer.
    pub fn broadcast_event<E: ReplicatedEvent>(&mut self, event: E) -> Result<(), ReplicatorError> {
        let prepared = PreparedEvent::new(event)?;
        for proxy in self.proxies.values_mut() {
            proxy.queue_event(prepared.clone(), false);
        }
        Ok(())
    }

    /// Queue `event` to the primary peer. Returns false when the local node
    /// is primary or the primary has no proxy.
    pub fn send_event_to_primary<E: ReplicatedEvent>(
        &mut self,
        event: E,
    ) -> Result<bool, ReplicatorError> {
        if self.is_primary() {
            return Ok(false);
        }
        let Some(proxy) = self.proxies.values_mut().find(|proxy| proxy.is_primary()) else {
            return Ok(false);
        };
        proxy.send_event(event)?;
        Ok(true)
    }

    /// Distinct events still waiting for an acknowledgement.
    pub fn pending_event_count(&self) -> usize {
        count_instances(self.proxies.values().flat_map(|proxy| proxy.outbox.instances()))
    }

    pub fn cancel_all_events(&mut self, mode: CancelMode) {
        match mode {
            CancelMode::Immediate => {
                let cancelled = cancel_instances(
                    self.proxies.values().flat_map(|proxy| proxy.outbox.instances()),
                    CancelMode::Immediate,
                );
                for proxy in self.proxies.values_mut() {
                    proxy.outbox.clear();
                }
                self.cancel_deferred = false;
                if cancelled > 0 {
                    tracing::debug!("Replicator [{}]: cancelled {cancelled} event(s)", self.name);
                }
            }
            CancelMode::Deferred => self.cancel_deferred = true,
        }
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    /// Register a listener for connect, disconnect, state and status
    /// notifications.
    pub fn add_listener<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&Replicator, f64, ReplicatorEvent<'_>) + 'static,
    {
        self.listeners.insert(Box::new(listener))
    }

    /// Returns false if `id` was already removed.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id).is_some()
    }

    pub fn remove_all_listeners(&mut self) {
        self.listeners.clear();
    }

    /// Register a listener for events of type `E`. Its return value tells
    /// whether the event was processed.
    pub fn add_event_listener<E, F>(&mut self, mut listener: F) -> EventListenerId
    where
        E: ReplicatedEvent,
        F: FnMut(&Replicator, f64, &Proxy, &E) -> bool + 'static,
    {
        let callback: ErasedEventListener = Box::new(move |replicator, time, proxy, payload| {
            let event: E = postcard::from_bytes(payload)?;
            Ok(listener(replicator, time, proxy, &event))
        });
        EventListenerId(self.event_listeners.insert(EventListenerEntry {
            kind: E::KIND,
            callback,
        }))
    }

    pub fn remove_event_listener(&mut self, id: EventListenerId) -> bool {
        self.event_listeners.remove(id.0).is_some()
    }

    pub fn remove_all_event_listeners(&mut self) {
        self.event_listeners.clear();
    }

    /// Counters accumulated since the last `create`.
    pub fn stats(&self) -> ReplicatorStats {
        self.stats
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.cancel_all_events(CancelMode::Immediate);
    }
}

#[cfg(test)]
#[path = "replicator_tests.rs"]
mod tests;
