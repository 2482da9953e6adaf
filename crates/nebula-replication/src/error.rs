//! Error types for the replication core.

use nebula_config::ConfigError;
use nebula_net::NetError;

use crate::value::ValueTemplate;

/// A state does not fit its template, or its bytes do not decode.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Number of values differs from the number of declared fields.
    #[error("state has {actual} field(s), template declares {expected}")]
    FieldCountMismatch {
        /// Declared field count.
        expected: usize,
        /// Field count of the offending state.
        actual: usize,
    },

    /// A value is not of its field's declared kind.
    #[error("field `{field}` expects {expected:?}, got {actual:?}")]
    KindMismatch {
        /// Field name.
        field: String,
        /// Declared kind.
        expected: ValueTemplate,
        /// Kind found.
        actual: ValueTemplate,
    },

    /// Packed bytes failed to encode or decode.
    #[error("state codec error: {0}")]
    Codec(#[from] postcard::Error),
}

/// A datagram could not be encoded or decoded.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// Shorter than the fixed header.
    #[error("datagram of {0} byte(s) is shorter than the header")]
    Truncated(usize),

    /// First byte is not a known message kind.
    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),

    /// Encoded message does not fit in one datagram.
    #[error("message of {size} byte(s) exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    /// Payload failed to encode or decode.
    #[error("payload codec error: {0}")]
    Codec(#[from] postcard::Error),
}

/// Errors surfaced by the replicator session.
#[derive(Debug, thiserror::Error)]
pub enum ReplicatorError {
    /// `create` was called on a session that already has a topology.
    #[error("replicator is already bound to a topology")]
    AlreadyBound,

    /// The session has no topology.
    #[error("replicator is not bound to a topology")]
    NotBound,

    /// Configuration rejected; the previous one stays in effect.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The topology reported a fatal transport failure.
    #[error("transport failure: {0}")]
    Transport(#[from] NetError),

    /// A previous transport failure left the session inert.
    #[error("session is inert after a transport failure; destroy and create it again")]
    Inert,

    /// An outgoing payload could not be encoded.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// The local state does not fit the outbound template.
    #[error(transparent)]
    State(#[from] StateError),
}
