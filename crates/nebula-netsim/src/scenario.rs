//! Peers replicating entities that move on circles over a simulated network.

use std::cell::Cell;
use std::f32::consts::{FRAC_PI_2, TAU};
use std::rc::Rc;
use std::sync::Arc;

use glam::Vec3;
use nebula_config::{Config, TopologyConfig};
use nebula_net::{
    LinkSettings, MeasureProvider, NetworkCounters, Peer2PeerTopology, SimNetwork, StatsSnapshot,
};
use nebula_replication::{
    Proxy, ReplicatedEvent, Replicator, ReplicatorError, ReplicatorEventKind, State,
    StateTemplate, Value, ValueTemplate,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Radians per second of every entity.
const ANGULAR_SPEED: f32 = 0.5;
/// Radius of the first peer's circle.
const BASE_RADIUS: f32 = 10.0;
/// Radius added per peer index, so peers fall into different distance bands.
const RADIUS_STEP: f32 = 25.0;
/// Seconds between two statistics reports.
const REPORT_INTERVAL: f64 = 1.0;

/// Sent to the primary each time an entity completes a lap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LapCompleted {
    pub lap: u32,
}

impl ReplicatedEvent for LapCompleted {
    const KIND: &'static str = "lap_completed";
}

/// Schema shared by every peer.
pub fn entity_template() -> StateTemplate {
    StateTemplate::new()
        .declare("position", ValueTemplate::Vector)
        .spatial()
        .declare("heading", ValueTemplate::Float)
        .declare("active", ValueTemplate::Bool)
        .critical()
}

struct Entity {
    radius: f32,
    angle: f32,
    laps: u32,
}

impl Entity {
    /// Returns true when a lap was completed.
    fn advance(&mut self, dt: f64) -> bool {
        self.angle += ANGULAR_SPEED * dt as f32;
        if self.angle < TAU {
            return false;
        }
        self.angle -= TAU;
        self.laps += 1;
        true
    }

    fn position(&self) -> Vec3 {
        Vec3::new(self.radius * self.angle.cos(), 0.0, self.radius * self.angle.sin())
    }

    fn state(&self) -> State {
        State::new(vec![
            Value::Vector(self.position()),
            Value::Float(self.angle + FRAC_PI_2),
            Value::Bool(self.laps % 2 == 0),
        ])
    }
}

/// One simulated participant.
pub struct Peer {
    replicator: Replicator,
    counters: Arc<NetworkCounters>,
    entity: Entity,
    position: Rc<Cell<Vec3>>,
    laps_heard: Rc<Cell<u32>>,
    last_report: StatsSnapshot,
}

impl Peer {
    fn new(net: &SimNetwork, index: usize, config: &Config) -> Result<Self, ReplicatorError> {
        let name = format!("peer{index}");
        let provider = MeasureProvider::new(net.add_peer(name.clone()));
        let counters = provider.counters();
        let topology = Peer2PeerTopology::new(
            provider,
            TopologyConfig {
                seed: config.topology.seed.wrapping_add(index as u64),
                ..config.topology.clone()
            },
        );

        let mut replicator = Replicator::new(name);
        replicator.create(Box::new(topology), config.replicator.clone())?;
        replicator.set_state_template(entity_template());

        let position = Rc::new(Cell::new(Vec3::ZERO));
        let local = Rc::clone(&position);
        replicator.set_distance_metric(move |_, proxy: &Proxy| {
            proxy
                .state()
                .and_then(|state| state.value(0))
                .and_then(Value::as_vector)
                .map_or(0.0, |remote| remote.distance(local.get()))
        });

        replicator.add_listener(|replicator, time, event| match event.kind {
            ReplicatorEventKind::Connected => {
                info!(
                    "{} t={time:.2}: {} ({}) joined",
                    replicator.name(),
                    event.proxy.name(),
                    event.proxy
                );
            }
            ReplicatorEventKind::Disconnected => {
                info!(
                    "{} t={time:.2}: {} ({}) left",
                    replicator.name(),
                    event.proxy.name(),
                    event.proxy
                );
            }
            ReplicatorEventKind::Status => {
                debug!(
                    "{}: {} reports status {}",
                    replicator.name(),
                    event.proxy.name(),
                    event.proxy.status()
                );
            }
            ReplicatorEventKind::State => {}
        });

        let laps_heard = Rc::new(Cell::new(0));
        let heard = Rc::clone(&laps_heard);
        replicator.add_event_listener(
            move |replicator: &Replicator, _, proxy: &Proxy, event: &LapCompleted| {
                heard.set(heard.get() + 1);
                info!("{}: {} completed lap {}", replicator.name(), proxy.name(), event.lap);
                true
            },
        );

        Ok(Self {
            replicator,
            counters,
            entity: Entity {
                radius: BASE_RADIUS + RADIUS_STEP * index as f32,
                angle: 0.0,
                laps: 0,
            },
            position,
            laps_heard,
            last_report: StatsSnapshot::default(),
        })
    }

    fn step(&mut self, dt: f64) -> Result<(), ReplicatorError> {
        if self.entity.advance(dt) {
            let lap = self.entity.laps;
            self.replicator.set_status(lap.min(u32::from(u8::MAX)) as u8);
            if self.replicator.send_event_to_primary(LapCompleted { lap })? {
                debug!("{}: lap {lap} announced", self.replicator.name());
            }
        }
        self.position.set(self.entity.position());
        self.replicator.set_send_state(self.entity.state())?;
        self.replicator.update(dt)
    }

    fn report(&mut self, elapsed: f64, window: f64) {
        let snapshot = self.counters.snapshot();
        let kbits = |bytes: u64| bytes as f64 * 8.0 / 1000.0 / window;
        let tx = kbits(snapshot.bytes_sent - self.last_report.bytes_sent);
        let rx = kbits(snapshot.bytes_received - self.last_report.bytes_received);
        self.last_report = snapshot;

        let replicator = &self.replicator;
        let stats = replicator.stats();
        info!(
            "{} t={elapsed:.0}s: proxies={} latency={:.1}ms variance={:.4} synced={} tx={tx:.1}kbit/s rx={rx:.1}kbit/s states {}/{} events {}/{} pending={}",
            replicator.name(),
            replicator.proxy_count(),
            replicator.average_latency() * 1000.0,
            replicator.time_variance(),
            replicator.is_time_synchronized(),
            stats.states_sent,
            stats.states_received,
            stats.events_sent,
            stats.events_received,
            replicator.pending_event_count(),
        );
    }

    pub fn replicator(&self) -> &Replicator {
        &self.replicator
    }

    /// Lap announcements delivered to this peer.
    pub fn laps_heard(&self) -> u32 {
        self.laps_heard.get()
    }

    pub fn laps(&self) -> u32 {
        self.entity.laps
    }
}

/// A simulated network and its peers, stepped at a fixed tick.
pub struct Scenario {
    net: SimNetwork,
    peers: Vec<Peer>,
    tick: f64,
    elapsed: f64,
    until_report: f64,
}

impl Scenario {
    pub fn new(config: &Config) -> Result<Self, ReplicatorError> {
        let simulation = &config.simulation;
        let net = SimNetwork::new(
            LinkSettings {
                latency: simulation.latency,
                jitter: simulation.jitter,
                loss: simulation.loss,
            },
            simulation.seed,
        );
        let peers = (0..simulation.peers)
            .map(|index| Peer::new(&net, index, config))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            net,
            peers,
            tick: simulation.tick,
            elapsed: 0.0,
            until_report: REPORT_INTERVAL,
        })
    }

    /// Advance the network and every peer by one tick.
    pub fn step(&mut self) -> Result<(), ReplicatorError> {
        self.net.advance(self.tick);
        for peer in &mut self.peers {
            peer.step(self.tick)?;
        }
        self.elapsed += self.tick;
        self.until_report -= self.tick;
        if self.until_report <= 0.0 {
            for peer in &mut self.peers {
                peer.report(self.elapsed, REPORT_INTERVAL);
            }
            self.until_report += REPORT_INTERVAL;
        }
        Ok(())
    }

    /// Step until `duration` simulated seconds have passed.
    pub fn run(&mut self, duration: f64) -> Result<(), ReplicatorError> {
        let steps = (duration / self.tick).ceil().max(0.0) as u64;
        for _ in 0..steps {
            self.step()?;
        }
        Ok(())
    }

    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    /// Log the final counters of every peer.
    pub fn summarize(&self) {
        for peer in self.peers() {
            let replicator = peer.replicator();
            let stats = replicator.stats();
            info!(
                "{}: {} lap(s), {} heard, time {:.3}s, {} malformed, {} discarded event(s), {} send failure(s)",
                replicator.name(),
                peer.laps(),
                peer.laps_heard(),
                replicator.time(),
                stats.malformed_datagrams,
                stats.events_discarded,
                stats.send_failures,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lossless(peers: usize) -> Config {
        let mut config = Config::default();
        config.simulation.peers = peers;
        config.simulation.tick = 1.0 / 30.0;
        config.simulation.latency = 0.02;
        config.simulation.jitter = 0.0;
        config.simulation.loss = 0.0;
        config
    }

    #[test]
    fn test_entity_laps() {
        let mut entity = Entity {
            radius: 1.0,
            angle: 0.0,
            laps: 0,
        };
        let mut laps = 0;
        for _ in 0..130 {
            if entity.advance(0.1) {
                laps += 1;
            }
        }
        assert_eq!(laps, 1);
        assert_eq!(entity.laps, 1);
        assert!(entity.angle < TAU);
        assert!(!entity.state().values()[2].as_bool().unwrap());
        assert!(entity_template().validate(&entity.state()).is_ok());
    }

    #[test]
    fn test_peers_see_each_other() {
        let mut scenario = Scenario::new(&lossless(3)).unwrap();
        scenario.run(6.0).unwrap();
        assert!(scenario.elapsed() >= 6.0 - 1e-9);

        for peer in scenario.peers() {
            let replicator = peer.replicator();
            assert_eq!(replicator.proxy_count(), 2, "{}", replicator.name());
            assert!(replicator.proxies().all(|proxy| proxy.state().is_some()));
            assert!(replicator.stats().states_received > 0);
        }
        assert!(scenario.peers()[0].replicator().is_primary());
        assert!(!scenario.peers()[1].replicator().is_primary());
    }

    #[test]
    fn test_laps_reach_primary() {
        let mut scenario = Scenario::new(&lossless(3)).unwrap();
        scenario.run(16.0).unwrap();

        let peers = scenario.peers();
        assert!(peers.iter().all(|peer| peer.laps() == 1));
        assert_eq!(peers[0].laps_heard(), 2);
        assert_eq!(peers[1].laps_heard(), 0);
        assert!(peers.iter().all(|peer| peer.replicator().pending_event_count() == 0));
    }

    #[test]
    fn test_empty_scenario_runs() {
        let mut scenario = Scenario::new(&lossless(0)).unwrap();
        scenario.run(1.0).unwrap();
        assert!(scenario.peers().is_empty());
    }
}
