//! Peer handles and the raw datagram provider contract.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::NetError;

/// Largest datagram any provider is required to carry.
pub const MAX_DATAGRAM_SIZE: usize = 1200;

/// Opaque peer identifier, assigned by the provider and stable for the
/// lifetime of a connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Handle(pub u64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Raw, unreliable, unordered datagram transport between peers of a session.
///
/// The peer listing includes the local peer. `send` and `recv` never block.
pub trait PeerProvider {
    /// Housekeeping; an error means the transport is no longer usable.
    fn update(&mut self) -> Result<(), NetError>;

    /// Handle of the local peer.
    fn local_handle(&self) -> Handle;

    /// Designate the primary peer. Returns false if the handle is unknown.
    fn set_primary_peer_handle(&mut self, handle: Handle) -> bool;

    /// Currently designated primary peer.
    fn primary_peer_handle(&self) -> Handle;

    /// Number of peers in the session, the local peer included.
    fn peer_count(&self) -> usize;

    /// Handle of the peer at `index`.
    fn peer_handle(&self, index: usize) -> Option<Handle>;

    /// Display name of the peer at `index`.
    fn peer_name(&self, index: usize) -> Option<String>;

    /// Send one datagram, all or nothing.
    fn send(&mut self, to: Handle, data: &[u8]) -> Result<(), NetError>;

    /// Receive one pending datagram into `buf`, returning its length and sender.
    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, Handle)>;
}

impl<P: PeerProvider + ?Sized> PeerProvider for Box<P> {
    fn update(&mut self) -> Result<(), NetError> {
        (**self).update()
    }

    fn local_handle(&self) -> Handle {
        (**self).local_handle()
    }

    fn set_primary_peer_handle(&mut self, handle: Handle) -> bool {
        (**self).set_primary_peer_handle(handle)
    }

    fn primary_peer_handle(&self) -> Handle {
        (**self).primary_peer_handle()
    }

    fn peer_count(&self) -> usize {
        (**self).peer_count()
    }

    fn peer_handle(&self, index: usize) -> Option<Handle> {
        (**self).peer_handle(index)
    }

    fn peer_name(&self, index: usize) -> Option<String> {
        (**self).peer_name(index)
    }

    fn send(&mut self, to: Handle, data: &[u8]) -> Result<(), NetError> {
        (**self).send(to, data)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Option<(usize, Handle)> {
        (**self).recv(buf)
    }
}
