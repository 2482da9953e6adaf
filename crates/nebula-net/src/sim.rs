//! In-memory lossy network for tests and the simulation harness.
//!
//! A [`SimNetwork`] owns every in-flight datagram and hands out one
//! [`SimProvider`] per peer. Latency, jitter and loss are drawn from a seeded
//! [`ChaCha8Rng`], so a run is reproducible from its seed. Time only moves
//! when [`SimNetwork::advance`] is called.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nebula_config::SimulationConfig;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::provider::MAX_DATAGRAM_SIZE;
use crate::{Handle, NetError, PeerProvider};

// ---------------------------------------------------------------------------
// LinkSettings
// ---------------------------------------------------------------------------

/// Delivery characteristics applied to every link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkSettings {
    /// Base one-way latency in seconds.
    pub latency: f64,
    /// Uniform extra latency in `[0, jitter)` seconds.
    pub jitter: f64,
    /// Probability that a datagram is dropped.
    pub loss: f64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            latency: 0.0,
            jitter: 0.0,
            loss: 0.0,
        }
    }
}

impl From<&SimulationConfig> for LinkSettings {
    fn from(config: &SimulationConfig) -> Self {
        Self {
            latency: config.latency.max(0.0),
            jitter: config.jitter.max(0.0),
            loss: config.loss.clamp(0.0, 1.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct InFlight {
    deliver_at: f64,
    order: u64,
    from: Handle,
    data: Vec<u8>,
}

struct SimPeer {
    handle: Handle,
    name: String,
    online: bool,
    failed: bool,
    inbox: Vec<InFlight>,
}

struct SimState {
    settings: LinkSettings,
    rng: ChaCha8Rng,
    now: f64,
    peers: Vec<SimPeer>,
    cut_links: HashSet<(Handle, Handle)>,
    primary: Option<Handle>,
    next_handle: u64,
    next_order: u64,
}

impl SimState {
    fn peer(&self, handle: Handle) -> Option<&SimPeer> {
        self.peers.iter().find(|peer| peer.handle == handle)
    }

    fn peer_mut(&mut self, handle: Handle) -> Option<&mut SimPeer> {
        self.peers.iter_mut().find(|peer| peer.handle == handle)
    }

    fn link_up(&self, a: Handle, b: Handle) -> bool {
        a == b || !self.cut_links.contains(&link_key(a, b))
    }

    /// Peers visible from `me`: every online peer when `me` is online,
    /// otherwise only `me`.
    fn visible_from(&self, me: Handle) -> Vec<&SimPeer> {
        let me_online = self.peer(me).is_some_and(|peer| peer.online);
        self.peers
            .iter()
            .filter(|peer| {
                if peer.handle == me {
                    true
                } else {
                    me_online && peer.online
                }
            })
            .collect()
    }
}

fn link_key(a: Handle, b: Handle) -> (Handle, Handle) {
    if a <= b { (a, b) } else { (b, a) }
}

// ---------------------------------------------------------------------------
// SimNetwork
// ---------------------------------------------------------------------------

/// Shared simulated network. Cloning yields another handle to the same network.
#[derive(Clone)]
pub struct SimNetwork {
    state: Arc<Mutex<SimState>>,
}

impl SimNetwork {
    /// Create an empty network.
    pub fn new(settings: LinkSettings, seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                settings,
                rng: ChaCha8Rng::seed_from_u64(seed),
                now: 0.0,
                peers: Vec::new(),
                cut_links: HashSet::new(),
                primary: None,
                next_handle: 1,
                next_order: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join a new peer. The first peer to join becomes primary.
    pub fn add_peer(&self, name: impl Into<String>) -> SimProvider {
        let mut state = self.lock();
        let handle = Handle(state.next_handle);
        state.next_handle += 1;
        state.peers.push(SimPeer {
            handle,
            name: name.into(),
            online: true,
            failed: false,
            inbox: Vec::new(),
        });
        if state.primary.is_none() {
            state.primary = Some(handle);
        }
        SimProvider {
            state: Arc::clone(&self.state),
            handle,
        }
    }

    /// Advance network time, releasing datagrams whose delivery time passed.
    pub fn advance(&self, dt: f64) {
        self.lock().now += dt.max(0.0);
    }

    /// Current network time.
    pub fn now(&self) -> f64 {
        self.lock().now
    }

    /// Replace the link characteristics for future sends.
    pub fn set_settings(&self, settings: LinkSettings) {
        self.lock().settings = settings;
    }

    /// Cut or restore the link between two peers. A cut link silently drops
    /// datagrams in both directions; both peers stay in each other's listing.
    pub fn set_link_state(&self, a: Handle, b: Handle, up: bool) {
        let mut state = self.lock();
        let key = link_key(a, b);
        if up {
            state.cut_links.remove(&key);
        } else {
            state.cut_links.insert(key);
        }
    }

    /// Take a peer out of (or back into) everyone's listing.
    pub fn set_peer_online(&self, handle: Handle, online: bool) {
        let mut state = self.lock();
        if let Some(peer) = state.peer_mut(handle) {
            peer.online = online;
            if !online {
                peer.inbox.clear();
            }
        }
    }

    /// Make the peer's provider report a fatal transport error from now on.
    pub fn fail_peer(&self, handle: Handle) {
        if let Some(peer) = self.lock().peer_mut(handle) {
            peer.failed = true;
        }
    }

    /// Datagrams not yet received by anyone.
    pub fn in_flight(&self) -> usize {
        self.lock().peers.iter().map(|peer| peer.inbox.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// SimProvider
// ---------------------------------------------------------------------------

/// One peer's view of a [`SimNetwork`].
pub struct SimProvider {
    state: Arc<Mutex<SimState>>,
    handle: Handle,
}

impl SimProvider {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PeerProvider for SimProvider {
    fn update(&mut self) -> Result<(), NetError> {
        let state = self.lock();
        match state.peer(self.handle) {
            Some(peer) if peer.failed => Err(NetError::TransportClosed(format!(
                "simulated failure of peer {}",
                self.handle
            ))),
            Some(_) => Ok(()),
            None => Err(NetError::UnknownPeer(self.handle)),
        }
    }

    fn local_handle(&self) -> Handle {
        self.handle
    }

    fn set_primary_peer_handle(&mut self, handle: Handle) -> bool {
        let mut state = self.lock();
        if state.peer(handle).is_none() {
            return false;
        }
        state.primary = Some(handle);
        true
    }

    fn primary_peer_handle(&self) -> Handle {
        self.lock().primary.unwrap_or(self.handle)
    }

    fn peer_count(&self) -> usize {
        self.lock().visible_from(self.handle).len()
    }

    fn peer_handle(&self, index: usize) -> Option<Handle> {
        let state = self.lock();
        state.visible_from(self.handle).get(index).map(|peer| peer.handle)
    }

    fn peer_name(&self, index: usize) -> Option<String> {
        let state = self.lock();
        state
            .visible_from(self.handle)
            .get(index)
            .map(|peer| peer.name.clone())
    }

    fn send(&mut self, to: Handle, data: &[u8]) -> Result<(), NetError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(NetError::PayloadTooLarge {
                size: data.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }

        let mut state = self.lock();
        let from = self.handle;
        let sender_online = state.peer(from).is_some_and(|peer| peer.online);
        let target_online = state.peer(to).is_some_and(|peer| peer.online);
        if !sender_online || !target_online {
            return Err(NetError::UnknownPeer(to));
        }
        if !state.link_up(from, to) {
            return Ok(());
        }

        let settings = state.settings;
        if settings.loss > 0.0 && state.rng.random_bool(settings.loss.min(1.0)) {
            return Ok(());
        }
        let jitter = if settings.jitter > 0.0 {
            state.rng.random::<f64>() * settings.jitter
        } else {
            0.0
        };

        let deliver_at = state.now + settings.latency + jitter;
        let order = state.next_order;
        state.next_order += 1;
        if let Some(target) = state.peer_mut(to) {
            target.inbox.push(InFlight {
                deliver_at,
                order,
                from,
                data: data.to_vec(),
            });
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, Handle)> {
        let mut state = self.lock();
        let now = state.now;
        let peer = state.peer_mut(self.handle)?;

        let index = peer
            .inbox
            .iter()
            .enumerate()
            .filter(|(_, datagram)| datagram.deliver_at <= now)
            .min_by(|(_, a), (_, b)| {
                a.deliver_at
                    .total_cmp(&b.deliver_at)
                    .then(a.order.cmp(&b.order))
            })
            .map(|(index, _)| index)?;

        let datagram = peer.inbox.swap_remove(index);
        let size = datagram.data.len().min(buf.len());
        buf[..size].copy_from_slice(&datagram.data[..size]);
        Some((size, datagram.from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_all(provider: &mut SimProvider) -> Vec<(Vec<u8>, Handle)> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let mut out = Vec::new();
        while let Some((size, from)) = provider.recv(&mut buf) {
            out.push((buf[..size].to_vec(), from));
        }
        out
    }

    #[test]
    fn test_listing_includes_local_peer() {
        let net = SimNetwork::new(LinkSettings::default(), 1);
        let a = net.add_peer("a");
        let b = net.add_peer("b");
        assert_eq!(a.peer_count(), 2);
        assert_eq!(a.peer_handle(0), Some(a.local_handle()));
        assert_eq!(a.peer_handle(1), Some(b.local_handle()));
        assert_eq!(b.peer_name(0).as_deref(), Some("a"));
    }

    #[test]
    fn test_first_peer_is_primary() {
        let net = SimNetwork::new(LinkSettings::default(), 1);
        let mut a = net.add_peer("a");
        let b = net.add_peer("b");
        assert_eq!(b.primary_peer_handle(), a.local_handle());
        assert!(a.set_primary_peer_handle(b.local_handle()));
        assert_eq!(b.primary_peer_handle(), b.local_handle());
        assert!(!a.set_primary_peer_handle(Handle(999)));
    }

    #[test]
    fn test_latency_holds_datagram_until_due() {
        let settings = LinkSettings {
            latency: 0.1,
            ..Default::default()
        };
        let net = SimNetwork::new(settings, 1);
        let mut a = net.add_peer("a");
        let mut b = net.add_peer("b");

        a.send(b.local_handle(), b"hello").unwrap();
        assert!(recv_all(&mut b).is_empty());
        net.advance(0.05);
        assert!(recv_all(&mut b).is_empty());
        net.advance(0.06);
        assert_eq!(recv_all(&mut b), vec![(b"hello".to_vec(), a.local_handle())]);
    }

    #[test]
    fn test_total_loss_drops_everything() {
        let settings = LinkSettings {
            loss: 1.0,
            ..Default::default()
        };
        let net = SimNetwork::new(settings, 7);
        let mut a = net.add_peer("a");
        let mut b = net.add_peer("b");
        for _ in 0..20 {
            a.send(b.local_handle(), &[1, 2, 3]).unwrap();
        }
        net.advance(1.0);
        assert!(recv_all(&mut b).is_empty());
    }

    #[test]
    fn test_partial_loss_is_reproducible() {
        let settings = LinkSettings {
            loss: 0.5,
            ..Default::default()
        };
        let run = |seed| {
            let net = SimNetwork::new(settings, seed);
            let mut a = net.add_peer("a");
            let mut b = net.add_peer("b");
            for i in 0..64u8 {
                a.send(b.local_handle(), &[i]).unwrap();
            }
            recv_all(&mut b)
                .into_iter()
                .map(|(data, _)| data[0])
                .collect::<Vec<_>>()
        };
        let first = run(42);
        assert_eq!(first, run(42));
        assert!(!first.is_empty() && first.len() < 64);
    }

    #[test]
    fn test_cut_link_drops_silently() {
        let net = SimNetwork::new(LinkSettings::default(), 1);
        let mut a = net.add_peer("a");
        let mut b = net.add_peer("b");
        net.set_link_state(a.local_handle(), b.local_handle(), false);
        assert!(a.send(b.local_handle(), b"x").is_ok());
        assert!(recv_all(&mut b).is_empty());
        assert_eq!(a.peer_count(), 2);

        net.set_link_state(b.local_handle(), a.local_handle(), true);
        a.send(b.local_handle(), b"y").unwrap();
        assert_eq!(recv_all(&mut b).len(), 1);
    }

    #[test]
    fn test_offline_peer_leaves_listing() {
        let net = SimNetwork::new(LinkSettings::default(), 1);
        let mut a = net.add_peer("a");
        let b = net.add_peer("b");
        net.set_peer_online(b.local_handle(), false);
        assert_eq!(a.peer_count(), 1);
        assert!(matches!(
            a.send(b.local_handle(), b"x"),
            Err(NetError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_failed_peer_update_errors() {
        let net = SimNetwork::new(LinkSettings::default(), 1);
        let mut a = net.add_peer("a");
        assert!(a.update().is_ok());
        net.fail_peer(a.local_handle());
        assert!(matches!(a.update(), Err(NetError::TransportClosed(_))));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let net = SimNetwork::new(LinkSettings::default(), 1);
        let mut a = net.add_peer("a");
        let b = net.add_peer("b");
        let big = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        assert!(matches!(
            a.send(b.local_handle(), &big),
            Err(NetError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_jitter_delivers_in_arrival_order() {
        let settings = LinkSettings {
            latency: 0.01,
            jitter: 0.05,
            loss: 0.0,
        };
        let net = SimNetwork::new(settings, 3);
        let mut a = net.add_peer("a");
        let mut b = net.add_peer("b");
        for i in 0..16u8 {
            a.send(b.local_handle(), &[i]).unwrap();
        }
        net.advance(1.0);
        let received = recv_all(&mut b);
        assert_eq!(received.len(), 16);
        assert_eq!(net.in_flight(), 0);
    }
}
