//! Command-line argument parsing for the replication tools.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Simulation harness command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "nebula-netsim", about = "Replication over a simulated network")]
pub struct CliArgs {
    /// Number of simulated peers.
    #[arg(long)]
    pub peers: Option<usize>,

    /// Simulated seconds to run.
    #[arg(long)]
    pub duration: Option<f64>,

    /// Seconds per tick.
    #[arg(long)]
    pub tick: Option<f64>,

    /// One-way latency in seconds.
    #[arg(long)]
    pub latency: Option<f64>,

    /// Latency jitter in seconds.
    #[arg(long)]
    pub jitter: Option<f64>,

    /// Datagram loss probability.
    #[arg(long)]
    pub loss: Option<f64>,

    /// Seed for the simulated network and topology jitter.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(peers) = args.peers {
            self.simulation.peers = peers;
        }
        if let Some(duration) = args.duration {
            self.simulation.duration = duration;
        }
        if let Some(tick) = args.tick {
            self.simulation.tick = tick;
        }
        if let Some(latency) = args.latency {
            self.simulation.latency = latency;
        }
        if let Some(jitter) = args.jitter {
            self.simulation.jitter = jitter;
        }
        if let Some(loss) = args.loss {
            self.simulation.loss = loss.clamp(0.0, 1.0);
        }
        if let Some(seed) = args.seed {
            self.simulation.seed = seed;
            self.topology.seed = seed;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_args() -> CliArgs {
        CliArgs {
            peers: None,
            duration: None,
            tick: None,
            latency: None,
            jitter: None,
            loss: None,
            seed: None,
            log_level: None,
            config: None,
        }
    }

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            peers: Some(8),
            seed: Some(42),
            loss: Some(1.5),
            ..empty_args()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.simulation.peers, 8);
        assert_eq!(config.simulation.seed, 42);
        assert_eq!(config.topology.seed, 42);
        assert_eq!(config.simulation.loss, 1.0);
        // Non-overridden fields retain defaults
        assert_eq!(config.simulation.duration, 30.0);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&empty_args());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from(["nebula-netsim", "--peers", "3", "--log-level", "debug"]);
        assert_eq!(args.peers, Some(3));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }
}
