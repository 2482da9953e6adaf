//! Runs replication sessions over a simulated lossy network and logs how
//! they converge.
//!
//! Run with: `cargo run -p nebula-netsim -- --peers 6 --loss 0.05`

mod scenario;

use clap::Parser;
use nebula_config::{CliArgs, Config};
use tracing::{error, info};

use crate::scenario::Scenario;

fn main() {
    let args = CliArgs::parse();
    let config_dir = args.config.clone().or_else(Config::default_dir);

    let mut config = match config_dir.as_deref().map(Config::load_or_create) {
        Some(Ok(config)) => config,
        Some(Err(e)) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
        None => Config::default(),
    };
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.as_ref().map(|dir| dir.join("logs"));
    nebula_log::init_logging(log_dir.as_deref(), config.debug.log_to_file, Some(&config));

    let simulation = &config.simulation;
    if simulation.tick.is_nan() || simulation.tick <= 0.0 {
        error!("Tick must be positive, got {}", simulation.tick);
        std::process::exit(1);
    }
    info!(
        "Simulating {} peer(s) for {:.0}s: latency={:.0}ms jitter={:.0}ms loss={:.1}% seed={}",
        simulation.peers,
        simulation.duration,
        simulation.latency * 1000.0,
        simulation.jitter * 1000.0,
        simulation.loss * 100.0,
        simulation.seed,
    );

    let mut scenario = match Scenario::new(&config) {
        Ok(scenario) => scenario,
        Err(e) => {
            error!("Failed to create session: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = scenario.run(config.simulation.duration) {
        error!("Replication failed at t={:.2}s: {e}", scenario.elapsed());
        std::process::exit(1);
    }
    scenario.summarize();
}
