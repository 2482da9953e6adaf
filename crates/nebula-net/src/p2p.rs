//! Peer-to-peer topology over a [`PeerProvider`].
//!
//! Every peer periodically sends an "I am" handshake to every other peer in
//! the provider's session. A reply proves a working direct link. Each peer
//! advertises the set of peers it reaches directly (its connection mask) to
//! its direct neighbours, which lets a node reach a peer it has no direct
//! link to by relaying through a common neighbour.

use std::collections::VecDeque;

use nebula_config::TopologyConfig;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::provider::MAX_DATAGRAM_SIZE;
use crate::topology::{Node, Topology, TopologyListener};
use crate::{Handle, NetError, PeerProvider};

/// Frames exchanged between topology instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum P2pMessage {
    /// Payload for the receiving node.
    Direct(Vec<u8>),
    /// Payload routed through an intermediate peer.
    Relay {
        from: Handle,
        target: Handle,
        data: Vec<u8>,
    },
    /// Handshake; a `reply: false` frame is answered with `reply: true`.
    IAm { reply: bool, sequence: u32 },
    /// Direct connections of peer `of`, versioned by `sequence`.
    ConnectionMask {
        of: Handle,
        sequence: u32,
        connections: Vec<Handle>,
    },
}

#[derive(Debug)]
struct Peer {
    handle: Handle,
    name: String,
    next_hop: Option<Handle>,
    connections: Vec<Handle>,
    sequence: u32,
    when_iam: f64,
    sent_iam: u32,
    when_propagate: f64,
    established: bool,
}

impl Peer {
    fn new(handle: Handle, name: String) -> Self {
        Self {
            handle,
            name,
            next_hop: None,
            connections: Vec::new(),
            sequence: 0,
            when_iam: 0.0,
            sent_iam: 0,
            when_propagate: 0.0,
            established: false,
        }
    }

    fn forget(&mut self) {
        self.sequence = 0;
        self.connections.clear();
        self.when_iam = 0.0;
        self.sent_iam = 0;
    }
}

/// Topology that discovers direct links by handshake and relays through
/// one intermediate peer when no direct link exists.
pub struct Peer2PeerTopology<P> {
    provider: P,
    config: TopologyConfig,
    rng: ChaCha8Rng,
    time: f64,
    peers: Vec<Peer>,
    nodes: Vec<Node>,
    recv_queue: VecDeque<(Handle, Vec<u8>)>,
    scratch: Vec<u8>,
}

impl<P: PeerProvider> Peer2PeerTopology<P> {
    /// Create a topology; interval jitter is drawn from `config.seed`.
    pub fn new(provider: P, config: TopologyConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            provider,
            config,
            rng,
            time: 0.0,
            peers: Vec::new(),
            nodes: Vec::new(),
            recv_queue: VecDeque::new(),
            scratch: vec![0; MAX_DATAGRAM_SIZE],
        }
    }

    /// The wrapped provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Handles this node currently reaches directly.
    pub fn direct_connections(&self) -> &[Handle] {
        let local = self.provider.local_handle();
        self.index_of(local)
            .map(|index| self.peers[index].connections.as_slice())
            .unwrap_or(&[])
    }

    fn index_of(&self, handle: Handle) -> Option<usize> {
        self.peers.iter().position(|peer| peer.handle == handle)
    }

    fn send_frame(&mut self, to: Handle, message: &P2pMessage) -> Result<(), NetError> {
        let frame = postcard::to_allocvec(message)?;
        self.provider.send(to, &frame)
    }

    fn jitter(&mut self) -> f64 {
        self.rng.random::<f64>() * self.config.time_random_flux
    }

    /// Remove `handle` from my direct connections. Returns true if it was there.
    fn drop_connection(&mut self, me: usize, handle: Handle) -> bool {
        let mine = &mut self.peers[me];
        let Some(position) = mine.connections.iter().position(|&h| h == handle) else {
            return false;
        };
        mine.connections.remove(position);
        mine.sequence += 1;
        mine.when_propagate = self.time;
        true
    }

    /// Next hop from `from` towards `to`: direct, or through one peer that
    /// `from` reaches directly and that reaches `to`.
    fn find_optimal_route(&self, from: Handle, to: Handle) -> Option<Handle> {
        if from == to {
            return None;
        }
        let from_peer = &self.peers[self.index_of(from)?];
        self.index_of(to)?;

        if from_peer.connections.contains(&to) {
            return Some(to);
        }

        from_peer
            .connections
            .iter()
            .copied()
            .filter(|&through| through != from && through != to)
            .find(|&through| {
                self.index_of(through)
                    .is_some_and(|index| self.peers[index].connections.contains(&to))
            })
    }

    fn log_prefix(&self) -> String {
        format!("P2P [{}]", self.provider.local_handle())
    }

    fn receive_frames(&mut self, me: usize, local: Handle) -> bool {
        let mut routing_changed = false;

        for _ in 0..self.config.max_receive_messages {
            let Some((size, from)) = self.provider.recv(&mut self.scratch) else {
                break;
            };
            let message: P2pMessage = match postcard::from_bytes(&self.scratch[..size]) {
                Ok(message) => message,
                Err(err) => {
                    tracing::debug!("{}: dropped undecodable frame from {from}: {err}", self.log_prefix());
                    continue;
                }
            };

            match message {
                P2pMessage::IAm {
                    reply: false,
                    sequence,
                } => {
                    let reply = P2pMessage::IAm {
                        reply: true,
                        sequence,
                    };
                    if let Err(err) = self.send_frame(from, &reply) {
                        tracing::trace!("{}: handshake reply to {from} failed: {err}", self.log_prefix());
                    }
                }
                P2pMessage::IAm { reply: true, .. } => {
                    let Some(index) = self.index_of(from) else {
                        continue;
                    };
                    self.peers[index].sent_iam = 0;
                    if index != me && !self.peers[me].connections.contains(&from) {
                        let mine = &mut self.peers[me];
                        mine.connections.push(from);
                        mine.connections.sort();
                        mine.sequence += 1;
                        mine.when_propagate = self.time;
                        routing_changed = true;
                    }
                }
                P2pMessage::ConnectionMask {
                    of,
                    sequence,
                    mut connections,
                } => {
                    if of == local {
                        continue;
                    }
                    let Some(index) = self.index_of(of) else {
                        continue;
                    };
                    let time = self.time;
                    let peer = &mut self.peers[index];
                    if sequence < peer.sequence {
                        continue;
                    }
                    connections.sort();
                    connections.dedup();
                    let equal = connections == peer.connections;
                    if !equal {
                        peer.connections = connections;
                        routing_changed = true;
                    }
                    if !equal || sequence > peer.sequence {
                        peer.when_propagate = time;
                    }
                    peer.sequence = sequence;
                }
                P2pMessage::Direct(data) => self.recv_queue.push_back((from, data)),
                P2pMessage::Relay { from, target, data } if target == local => {
                    self.recv_queue.push_back((from, data));
                }
                P2pMessage::Relay { from, target, data } => {
                    let next_hop = self
                        .index_of(target)
                        .and_then(|index| self.peers[index].next_hop);
                    let Some(next_hop) = next_hop else {
                        tracing::debug!("{}: no route to {target}; relayed frame discarded", self.log_prefix());
                        continue;
                    };
                    let relay = P2pMessage::Relay { from, target, data };
                    if let Err(err) = self.send_frame(next_hop, &relay) {
                        tracing::info!(
                            "{}: unable to relay to {target} through {next_hop}: {err}",
                            self.log_prefix()
                        );
                    }
                }
            }
        }

        routing_changed
    }
}

impl<P: PeerProvider> Topology for Peer2PeerTopology<P> {
    fn local_handle(&self) -> Handle {
        self.provider.local_handle()
    }

    fn set_primary_handle(&mut self, handle: Handle) -> bool {
        self.provider.set_primary_peer_handle(handle)
    }

    fn primary_handle(&self) -> Handle {
        self.provider.primary_peer_handle()
    }

    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    fn send(&mut self, to: Handle, data: &[u8]) -> Result<(), NetError> {
        let index = self.index_of(to).ok_or(NetError::UnknownPeer(to))?;
        let next_hop = self.peers[index].next_hop.ok_or(NetError::UnknownPeer(to))?;

        let message = if next_hop == to {
            P2pMessage::Direct(data.to_vec())
        } else {
            P2pMessage::Relay {
                from: self.provider.local_handle(),
                target: to,
                data: data.to_vec(),
            }
        };
        self.send_frame(next_hop, &message)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, Handle)> {
        let (from, data) = self.recv_queue.pop_front()?;
        let size = data.len().min(buf.len());
        buf[..size].copy_from_slice(&data[..size]);
        Some((size, from))
    }

    fn update(&mut self, dt: f64, listener: &mut dyn TopologyListener) -> Result<(), NetError> {
        self.provider.update()?;

        let mut routing_changed = false;
        let local = self.provider.local_handle();

        // Snapshot the provider's session and learn new peers.
        let mut present = Vec::with_capacity(self.provider.peer_count());
        for index in 0..self.provider.peer_count() {
            let Some(handle) = self.provider.peer_handle(index) else {
                continue;
            };
            present.push(handle);
            if self.index_of(handle).is_none() {
                let name = self.provider.peer_name(index).unwrap_or_default();
                self.peers.push(Peer::new(handle, name));
                routing_changed = true;
            }
        }
        let me = match self.index_of(local) {
            Some(index) => index,
            None => {
                self.peers.push(Peer::new(local, String::new()));
                self.peers.len() - 1
            }
        };

        // Forget peers that left the session.
        for index in 0..self.peers.len() {
            let handle = self.peers[index].handle;
            if index == me || present.contains(&handle) {
                continue;
            }
            if self.drop_connection(me, handle) || !self.peers[index].connections.is_empty() {
                routing_changed = true;
            }
            self.peers[index].forget();
        }

        // Handshake with every peer still in the session.
        for index in 0..self.peers.len() {
            let handle = self.peers[index].handle;
            if index == me || self.time < self.peers[index].when_iam || !present.contains(&handle)
            {
                continue;
            }

            if self.peers[index].sent_iam >= self.config.max_pending_iam
                && self.drop_connection(me, handle)
            {
                tracing::info!("{}: peer {handle} no longer answers handshakes", self.log_prefix());
                self.peers[index].forget();
                routing_changed = true;
            }

            let handshake = P2pMessage::IAm {
                reply: false,
                sequence: 0,
            };
            match self.send_frame(handle, &handshake) {
                Ok(()) => {
                    let peer = &mut self.peers[index];
                    peer.sent_iam = peer.sent_iam.saturating_add(1);
                }
                Err(_) => {
                    if self.drop_connection(me, handle) {
                        self.peers[index].forget();
                        routing_changed = true;
                    }
                }
            }

            self.peers[index].when_iam = self.time + self.config.iam_interval + self.jitter();
        }

        // Alone: nobody else's connections can be trusted.
        if self.peers[me].connections.is_empty() {
            for (index, peer) in self.peers.iter_mut().enumerate() {
                if index != me && !peer.connections.is_empty() {
                    peer.forget();
                    routing_changed = true;
                }
            }
            self.peers[me].sent_iam = 0;
        }

        // Peers nobody reports as reachable.
        let unreachable: Vec<usize> = (0..self.peers.len())
            .filter(|&index| index != me && !self.peers[index].connections.is_empty())
            .filter(|&index| {
                let handle = self.peers[index].handle;
                !self
                    .peers
                    .iter()
                    .enumerate()
                    .any(|(other, peer)| other != index && peer.connections.contains(&handle))
            })
            .collect();
        for index in unreachable {
            self.peers[index].forget();
            routing_changed = true;
        }

        // Propagate connection masks to my direct neighbours.
        let neighbours = self.peers[me].connections.clone();
        let mut errors = 0;
        for index in 0..self.peers.len() {
            let peer = &self.peers[index];
            if self.time < peer.when_propagate || peer.connections.is_empty() {
                continue;
            }
            let of = peer.handle;
            let mask = P2pMessage::ConnectionMask {
                of,
                sequence: peer.sequence,
                connections: peer.connections.clone(),
            };
            let frame = postcard::to_allocvec(&mask)?;
            for &neighbour in neighbours.iter().filter(|&&h| h != of) {
                if self.provider.send(neighbour, &frame).is_err() {
                    errors += 1;
                }
            }
            self.peers[index].when_propagate =
                self.time + self.config.propagate_interval + self.jitter();
        }
        if errors > 0 {
            tracing::warn!("{}: unable to propagate {errors} connection mask(s)", self.log_prefix());
        }

        if self.receive_frames(me, local) {
            routing_changed = true;
        }

        if routing_changed {
            tracing::debug!("{}: updating routes", self.log_prefix());
        }

        // Rebuild the node snapshot and fire transitions.
        let mut nodes = Vec::with_capacity(self.peers.len());
        for index in 0..self.peers.len() {
            let handle = self.peers[index].handle;
            if index == me {
                self.peers[index].next_hop = Some(local);
            } else if !present.contains(&handle) {
                self.peers[index].next_hop = None;
            } else if routing_changed {
                self.peers[index].next_hop = self.find_optimal_route(local, handle);
            }

            let peer = &mut self.peers[index];
            match peer.next_hop {
                Some(next_hop) => {
                    nodes.push(Node {
                        handle,
                        name: peer.name.clone(),
                        relayed: next_hop != handle,
                    });
                    if !peer.established {
                        peer.established = true;
                        tracing::info!("P2P [{local}]: peer {handle} connected");
                        listener.node_connected(handle);
                    }
                }
                None => {
                    if peer.established {
                        peer.established = false;
                        tracing::info!("P2P [{local}]: peer {handle} disconnected");
                        listener.node_disconnected(handle);
                    }
                }
            }
        }
        self.nodes = nodes;

        self.time += dt;
        Ok(())
    }
}
