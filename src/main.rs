//! ECS clustering simulator entry point.
//!
//! A headless multi-node simulator for the ECS (Efficient Clustering
//! Scheme) protocol over a mobile ad-hoc network. Every simulated node
//! runs the full clustering state machine: randomized head election,
//! member/gateway/guest role maintenance, head-vs-head conflict
//! resolution, and periodic hello/scan upkeep.
//!
//! ## Architecture
//!
//! The simulation runs on an Embassy executor on a dedicated thread, with
//! one async task per node plus a central network task that models radio
//! connectivity, moves nodes, and collects statistics. A custom
//! embassy-time driver maps host time to an accelerated virtual clock, so
//! long scenarios finish quickly while preserving the timing relations of
//! the protocol.
//!
//! The main thread blocks until the network task reports completion; the
//! run's event logs and summary statistics are written as CSV files into
//! the working directory.
//!
//! Usage: `ecs-cluster-sim [config.toml]`. With no argument the built-in
//! defaults run.

use anyhow::Context;
use embassy_executor::{Executor, Spawner};
use env_logger::Builder;
use log::{LevelFilter, info};
use std::path::Path;
use std::sync::mpsc;
use std::thread;

mod clustering;
mod config;
mod simulation;
mod time_driver;

use config::SimulationConfig;

fn embassy_init(spawner: Spawner, config: SimulationConfig, done_tx: mpsc::Sender<()>) {
    spawner.must_spawn(simulation::network_task(spawner, config, done_tx));
}

fn main() -> anyhow::Result<()> {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("ecs_cluster_sim"), LevelFilter::Debug)
        .parse_default_env()
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => SimulationConfig::load(Path::new(&path))
            .with_context(|| format!("loading configuration from {}", path))?,
        None => {
            info!("no configuration file given, using defaults");
            SimulationConfig::defaults()
        }
    };

    time_driver::set_time_scale_percent(config.time_scale_percent);

    let (done_tx, done_rx) = mpsc::channel();

    // Spawn the Embassy executor on a dedicated background thread. The
    // large stack accommodates the state of thousands of node tasks.
    let _executor_handle = thread::Builder::new()
        .stack_size(64 * 1024 * 1024)
        .name("embassy-executor".to_string())
        .spawn(move || {
            // INTENTIONAL LEAK: Box::leak provides the 'static lifetime
            // the executor requires; reclaimed at process exit.
            let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
            executor.run(|spawner| embassy_init(spawner, config, done_tx));
        })
        .context("failed to spawn executor thread")?;

    done_rx
        .recv()
        .context("simulation ended without completing")?;
    info!("done");

    // The executor thread never returns; end the process explicitly.
    std::process::exit(0);
}
