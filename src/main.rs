//! # Pool Miner
//!
//! A CPU miner for pools speaking line-delimited JSON-RPC (Stratum-like).
//!
//! ## Overview
//! 1. Connect to the pool, subscribe and authorize.
//! 2. Hash the pool's jobs on a pool of worker threads.
//! 3. Submit shares that meet the pool target and track the verdicts.
//!
//! Ctrl+C stops the miner: the first press drains queued shares and closes
//! the connection, a second press forces an immediate close.
//!
//! ## Key Components
//! - **`main.rs`**: entry point, CLI, engine start and signal handling.
//! - **`config.rs`**: loading and validation of the miner configuration.
//! - **`logging.rs`**: application-wide logging via `tracing`.
//! - **`pool_stratum_connector`**: pool protocol, job board, targets and stats.
//! - **`pool_mining_engine`**: worker threads, shutdown and the engine facade.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

mod config;
mod logging;

use pool_mining_engine::{EngineExit, EngineOutcome, LogStatsSink, MiningEngine, ShutdownCoordinator};
use pool_stratum_connector::PoolEndpoint;

/// Command-line arguments. Every flag overrides the matching config value.
#[derive(Parser, Debug, Default)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to a configuration file. Defaults to the platform config location.
    #[clap(short, long, value_name = "FILE_PATH")]
    config: Option<String>,

    /// Pool address as `host:port`, optionally prefixed with `stratum+tcp://`.
    #[clap(short, long, value_name = "HOST:PORT")]
    pool: Option<String>,

    /// Worker name.
    #[clap(short, long)]
    user: Option<String>,

    /// Worker password.
    #[clap(long)]
    pass: Option<String>,

    /// Worker threads, 0 for auto.
    #[clap(short, long)]
    threads: Option<usize>,

    /// Fraction of time spent hashing, in (0, 1].
    #[clap(short, long)]
    intensity: Option<f64>,

    /// Write a default configuration file and exit.
    #[clap(long)]
    generate_config: bool,
}

/// Apply command-line overrides on top of the loaded configuration.
fn apply_overrides(config: &mut config::Config, args: &Args) -> Result<()> {
    if let Some(pool) = &args.pool {
        let endpoint = PoolEndpoint::parse(pool, config.pool.username.clone(), config.pool.password.clone())
            .map_err(|e| anyhow!("Invalid --pool: {}", e))?;
        config.pool.host = endpoint.host;
        config.pool.port = endpoint.port;
    }
    if let Some(user) = &args.user {
        config.pool.username = user.clone();
    }
    if let Some(pass) = &args.pass {
        config.pool.password = pass.clone();
    }
    if let Some(threads) = args.threads {
        config.miner.threads = threads;
    }
    if let Some(intensity) = args.intensity {
        config.miner.intensity = intensity;
    }
    Ok(())
}

/// Turn an engine exit into the process result: only a requested stop is
/// a success.
fn exit_result(exit: &EngineExit) -> Result<()> {
    match &exit.outcome {
        EngineOutcome::Stopped => Ok(()),
        EngineOutcome::ReconnectExhausted { attempts } => {
            Err(anyhow!("Lost the pool connection and {} reconnect attempts failed", attempts))
        }
        EngineOutcome::Unauthorized => Err(anyhow!("The pool refused the worker credentials")),
        EngineOutcome::Crashed(reason) => Err(anyhow!("Mining engine crashed: {}", reason)),
    }
}

/// First Ctrl+C requests an orderly stop, the second forces it.
async fn forward_ctrl_c(coordinator: Arc<ShutdownCoordinator>) {
    for press in 1..=2 {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        if press == 1 {
            info!("Ctrl+C received, stopping. Press Ctrl+C again to force.");
        }
        coordinator.signal();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Initialization ---
    let args = Args::parse();

    if args.generate_config {
        let path = config::Config::generate(args.config.as_deref())
            .map_err(|e| anyhow!("Failed to write default configuration: {}", e))?;
        println!("Default configuration written to {}", path.display());
        return Ok(());
    }

    let mut app_config = config::Config::load(args.config.as_deref()).map_err(|e| {
        anyhow!(
            "Critical error loading configuration: {}. Fix the file or remove it to generate a default.",
            e
        )
    })?;
    logging::init_logging(Some(&app_config.logging.level));
    info!("Starting Pool Miner v{}...", env!("CARGO_PKG_VERSION"));

    apply_overrides(&mut app_config, &args)?;
    debug!("Effective configuration: {:?}", app_config);

    // --- 2. Validation ---
    let endpoint = config::validate_pool_endpoint(&app_config.pool).map_err(|e| {
        error!("Configuration error: {}", e);
        anyhow!("Invalid pool configuration: {}", e)
    })?;
    let intensity = config::validate_intensity(app_config.miner.intensity).map_err(|e| anyhow!(e))?;
    config::validate_algorithm(&app_config.miner.algorithm).map_err(|e| anyhow!(e))?;
    let threads = config::validate_and_correct_threads(app_config.miner.threads, app_config.miner.reserved_cores);

    // --- 3. Engine start ---
    let options = app_config.engine_options(threads, intensity);
    let engine = MiningEngine::new(options, Arc::new(LogStatsSink))?;
    info!(pool = %endpoint, threads, intensity, algorithm = %app_config.miner.algorithm, "Connecting to pool");

    let handle = tokio::select! {
        started = engine.start(endpoint) => started.map_err(|e| anyhow!("Could not start mining: {}", e))?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Ctrl+C received before the pool handshake completed");
            return Ok(());
        }
    };

    tokio::spawn(forward_ctrl_c(Arc::clone(handle.coordinator())));
    info!("Mining started. Press Ctrl+C to stop.");

    // --- 4. Run until stopped ---
    let exit = handle.wait().await;
    info!(
        forced = exit.report.forced,
        drained = exit.report.drained,
        discarded = exit.report.discarded,
        elapsed_ms = exit.report.elapsed.as_millis() as u64,
        "Final stats: {}",
        exit.stats
    );

    exit_result(&exit)?;
    info!("Pool Miner has shut down.");
    Ok(())
}

#[cfg(test)]
mod tests;
