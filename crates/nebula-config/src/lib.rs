//! Configuration for the replication stack.
//!
//! Holds the replicator's scheduling and time-sync tunables, the peer-to-peer
//! topology timings and the simulation harness settings. Everything persists
//! to disk as RON, supports CLI overrides via clap, and is validated before a
//! session accepts it.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, ReplicatorConfig, SimulationConfig, TopologyConfig};
pub use error::ConfigError;
