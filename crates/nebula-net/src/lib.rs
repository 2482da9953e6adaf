//! Transport layer for replication: peer handles, the raw datagram provider
//! contract, topologies built over providers, and concrete providers
//! (in-memory simulation, UDP, bandwidth measurement decorator).

pub mod error;
pub mod measure;
pub mod p2p;
pub mod provider;
pub mod sim;
pub mod topology;
pub mod udp;

pub use error::NetError;
pub use measure::{MeasureProvider, NetworkCounters, StatsSnapshot};
pub use p2p::Peer2PeerTopology;
pub use provider::{Handle, MAX_DATAGRAM_SIZE, PeerProvider};
pub use sim::{LinkSettings, SimNetwork, SimProvider};
pub use topology::{Node, NodeEvent, Topology, TopologyListener};
pub use udp::{UdpPeer, UdpProvider, UdpSocketConfig, bind_udp};
