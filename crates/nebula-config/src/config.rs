//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Replicator session settings.
    pub replicator: ReplicatorConfig,
    /// Peer-to-peer topology timings.
    pub topology: TopologyConfig,
    /// Simulation harness settings.
    pub simulation: SimulationConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Replicator session configuration.
///
/// Copied by value into a session when it is created; a running session only
/// picks up a new one through `set_configuration`, which validates it first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplicatorConfig {
    /// Time variance (seconds) below which the clock counts as synchronized.
    pub time_variance_threshold: f64,
    /// Upper bound of the near band.
    pub near_distance: f32,
    /// Upper bound of the far band.
    pub far_distance: f32,
    /// Beyond this distance no non-critical state is sent.
    pub furthest_distance: f32,
    /// Minimum seconds between state packets in the near band.
    pub time_until_tx_state_near: f64,
    /// Minimum seconds between state packets in the far band and beyond.
    pub time_until_tx_state_far: f64,
    /// Seconds between two pings sent to the same peer.
    pub time_until_tx_ping: f64,
    /// Seconds the variance must stay below threshold before the clock is synchronized.
    pub time_sync_settle: f64,
    /// Maximum number of proxies, `None` for unbounded.
    pub max_proxies: Option<usize>,
    /// Seconds before an unacknowledged event is resent.
    pub event_resend_interval: f64,
    /// Sends after which an unordered, unacknowledged event is discarded.
    pub event_resend_limit: u32,
    /// Default per-field extrapolation ceiling in seconds.
    pub max_extrapolation: f64,
}

/// Peer-to-peer topology timings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopologyConfig {
    /// Seconds between "I am" handshakes to each peer.
    pub iam_interval: f64,
    /// Unanswered handshakes before a direct connection is dropped.
    pub max_pending_iam: u32,
    /// Seconds between connection mask propagations.
    pub propagate_interval: f64,
    /// Random spread (seconds) added to both intervals.
    pub time_random_flux: f64,
    /// Maximum datagrams drained from the provider per update.
    pub max_receive_messages: usize,
    /// Seed for the interval jitter.
    pub seed: u64,
}

/// Simulation harness settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of simulated peers.
    pub peers: usize,
    /// Simulated seconds to run.
    pub duration: f64,
    /// Seconds per tick.
    pub tick: f64,
    /// One-way link latency in seconds.
    pub latency: f64,
    /// Uniform latency jitter in seconds.
    pub jitter: f64,
    /// Datagram loss probability (0.0 - 1.0).
    pub loss: f64,
    /// Seed for the simulated network.
    pub seed: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Write a JSON log file next to the config.
    pub log_to_file: bool,
}

// --- Default implementations ---

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            time_variance_threshold: 0.03,
            near_distance: 15.0,
            far_distance: 150.0,
            furthest_distance: 300.0,
            time_until_tx_state_near: 1.0 / 15.0,
            time_until_tx_state_far: 1.0 / 8.0,
            time_until_tx_ping: 1.5,
            time_sync_settle: 1.0,
            max_proxies: None,
            event_resend_interval: 0.5,
            event_resend_limit: 16,
            max_extrapolation: 4.0,
        }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            iam_interval: 1.0,
            max_pending_iam: 16,
            propagate_interval: 4.0,
            time_random_flux: 0.5,
            max_receive_messages: 128,
            seed: 0,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            peers: 4,
            duration: 30.0,
            tick: 1.0 / 60.0,
            latency: 0.04,
            jitter: 0.01,
            loss: 0.02,
            seed: 1,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

// --- Validation ---

impl ReplicatorConfig {
    /// Check ordering and range rules.
    ///
    /// Requires `near <= far <= furthest`, `tx_near <= tx_far`, finite
    /// non-negative intervals and a positive ping cadence.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let distances = [self.near_distance, self.far_distance, self.furthest_distance];
        if distances.iter().any(|d| !d.is_finite() || *d < 0.0) {
            return Err(ConfigError::Invariant(format!(
                "distances must be finite and non-negative, got {distances:?}"
            )));
        }
        if self.near_distance > self.far_distance || self.far_distance > self.furthest_distance {
            return Err(ConfigError::Invariant(format!(
                "expected near <= far <= furthest, got {} / {} / {}",
                self.near_distance, self.far_distance, self.furthest_distance
            )));
        }

        let intervals = [
            ("time_until_tx_state_near", self.time_until_tx_state_near),
            ("time_until_tx_state_far", self.time_until_tx_state_far),
            ("time_sync_settle", self.time_sync_settle),
            ("event_resend_interval", self.event_resend_interval),
            ("max_extrapolation", self.max_extrapolation),
            ("time_variance_threshold", self.time_variance_threshold),
        ];
        for (name, value) in intervals {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invariant(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        if self.time_until_tx_state_near > self.time_until_tx_state_far {
            return Err(ConfigError::Invariant(format!(
                "expected tx_near <= tx_far, got {} / {}",
                self.time_until_tx_state_near, self.time_until_tx_state_far
            )));
        }
        if !self.time_until_tx_ping.is_finite() || self.time_until_tx_ping <= 0.0 {
            return Err(ConfigError::Invariant(format!(
                "time_until_tx_ping must be positive, got {}",
                self.time_until_tx_ping
            )));
        }
        Ok(())
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Platform config directory for the replication tools, if one exists.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("nebula-replication"))
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            config.replicator.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    ///
    /// A changed file whose replicator section fails validation is an error;
    /// the caller keeps its current config.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            new_config.replicator.validate()?;
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
