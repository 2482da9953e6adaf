//! Entity-state replication over a pluggable peer topology.
//!
//! A [`Replicator`] keeps one [`Proxy`] per remote peer, sends the local
//! [`State`] through a distance/time throttle, extrapolates the peers'
//! states between packets, delivers [`ReplicatedEvent`]s with
//! acknowledgement, and synchronizes a session clock with the primary peer.

pub mod clock;
pub mod error;
pub mod event;
pub mod latency;
pub mod listener;
pub mod message;
pub mod proxy;
pub mod replicator;
pub mod state;
pub mod throttle;
pub mod value;

pub use clock::TimeSync;
pub use error::{MessageError, ReplicatorError, StateError};
pub use event::{CancelMode, ReplicatedEvent};
pub use latency::{LatencyEstimator, TimeRateEstimator};
pub use listener::ListenerId;
pub use proxy::Proxy;
pub use replicator::{
    EventListenerId, Replicator, ReplicatorEvent, ReplicatorEventKind, ReplicatorStats,
};
pub use state::{FieldPhase, FieldTemplate, Sample, State, StateTemplate};
pub use throttle::{Band, state_interval};
pub use value::{BodyState, Transform, Value, ValueTemplate};
