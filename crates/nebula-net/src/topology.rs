//! Topology contract: node enumeration, primary designation and connection
//! callbacks layered over a datagram transport.

use crate::{Handle, NetError};

/// One reachable node in the current enumeration snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Peer handle.
    pub handle: Handle,
    /// Display name reported by the provider.
    pub name: String,
    /// Traffic to this node goes through another peer.
    pub relayed: bool,
}

/// Receives connection transitions from [`Topology::update`].
///
/// Each method fires at most once per transition per handle.
pub trait TopologyListener {
    /// A node became reachable.
    fn node_connected(&mut self, handle: Handle);
    /// A node is no longer reachable.
    fn node_disconnected(&mut self, handle: Handle);
}

/// A connection transition recorded by the [`TopologyListener`] impl on `Vec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// See [`TopologyListener::node_connected`].
    Connected(Handle),
    /// See [`TopologyListener::node_disconnected`].
    Disconnected(Handle),
}

impl TopologyListener for Vec<NodeEvent> {
    fn node_connected(&mut self, handle: Handle) {
        self.push(NodeEvent::Connected(handle));
    }

    fn node_disconnected(&mut self, handle: Handle) {
        self.push(NodeEvent::Disconnected(handle));
    }
}

/// Maps peer handles onto a transport and tracks which nodes are reachable.
///
/// The node enumeration is a snapshot that stays valid until the next
/// [`update`](Topology::update). The local node is part of it.
pub trait Topology {
    /// Handle of the local node.
    fn local_handle(&self) -> Handle;

    /// Designate the primary node. Local-only and immediate.
    fn set_primary_handle(&mut self, handle: Handle) -> bool;

    /// Currently designated primary node.
    fn primary_handle(&self) -> Handle;

    /// Number of nodes in the snapshot.
    fn node_count(&self) -> usize;

    /// Node at `index` in the snapshot.
    fn node(&self, index: usize) -> Option<&Node>;

    /// Best-effort, non-blocking send of one datagram.
    fn send(&mut self, to: Handle, data: &[u8]) -> Result<(), NetError>;

    /// Receive at most one pending datagram.
    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, Handle)>;

    /// Housekeeping. Fires connection callbacks synchronously; an error means
    /// the transport is unusable.
    fn update(&mut self, dt: f64, listener: &mut dyn TopologyListener) -> Result<(), NetError>;

    /// Handle of the node at `index`.
    fn node_handle(&self, index: usize) -> Option<Handle> {
        self.node(index).map(|node| node.handle)
    }

    /// Name of the node at `index`.
    fn node_name(&self, index: usize) -> Option<&str> {
        self.node(index).map(|node| node.name.as_str())
    }

    /// Whether the node at `index` is reached through a relay.
    fn is_node_relayed(&self, index: usize) -> bool {
        self.node(index).is_some_and(|node| node.relayed)
    }

    /// Find a node by handle.
    fn find_node(&self, handle: Handle) -> Option<&Node> {
        (0..self.node_count())
            .filter_map(|index| self.node(index))
            .find(|node| node.handle == handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_listener_records_in_order() {
        let mut events = Vec::new();
        {
            let listener: &mut dyn TopologyListener = &mut events;
            listener.node_connected(Handle(1));
            listener.node_disconnected(Handle(1));
        }
        assert_eq!(
            events,
            vec![
                NodeEvent::Connected(Handle(1)),
                NodeEvent::Disconnected(Handle(1))
            ]
        );
    }
}
