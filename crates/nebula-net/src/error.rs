//! Transport error types.

use crate::Handle;

/// Errors raised by peer providers and topologies.
///
/// Only errors returned from `update` are fatal for a session; send errors
/// are best-effort failures the caller may ignore.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The handle is not a known or routable peer.
    #[error("unknown peer {0}")]
    UnknownPeer(Handle),

    /// The link cannot take more data right now.
    #[error("link saturated")]
    Saturated,

    /// The datagram exceeds the transport's maximum size.
    #[error("payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// The transport has become unusable.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// Socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encode/decode error.
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
}
