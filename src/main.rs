//! adx-relay - per-minute adx bid-request distribution pipeline.
//!
//! Every minute the pipeline ingests the previous minute's bid requests
//! from three regional upload buckets, drops invalid and already-seen
//! devices against a 24-hour rolling bloom window, allocates the rest to
//! offer/site demand slots read from Redis, and posts each allocation to a
//! downstream worker. A small admin surface exposes the dedup engine over
//! HTTP.

use std::io;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};

mod bloom;
mod cli;
mod dedup;
mod demand;
mod dispatch;
mod errors;
mod filters;
mod geo;
mod ingest;
mod models;
mod pipeline;
mod server;

use cli::Cli;
use dedup::{RollingDedup, FALSE_POSITIVE, HOURLY_CAPACITY};
use demand::DemandLoader;
use dispatch::Dispatcher;
use ingest::IngestClient;
use pipeline::Pipeline;
use server::AppState;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    tokio::runtime::Runtime::new()
        .context("failed to create tokio runtime")?
        .block_on(serve(cli))
}

/// Initialize tracing subscriber.
fn init_tracing(verbose: bool, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

/// Wire everything up and serve until a shutdown signal arrives.
async fn serve(cli: Cli) -> Result<()> {
    let dedup = Arc::new(RollingDedup::restore_or_fresh(
        HOURLY_CAPACITY,
        FALSE_POSITIVE,
        &cli.state_file,
    ));

    // The geolocation database is read once at startup. The in-process
    // consumer of lookups (RTA traffic repartition) lives outside this
    // service, so a missing file only disables the capability.
    let _geo = match geo::GeoSearcher::load(&cli.xdb_path) {
        Ok(searcher) => {
            info!("loaded ip2region database from {}", cli.xdb_path.display());
            Some(searcher)
        }
        Err(e) => {
            warn!("ip2region database unavailable: {e}");
            None
        }
    };

    spawn_autosave(dedup.clone());
    spawn_signal_handler(dedup.clone())?;

    let pipeline = Arc::new(Pipeline {
        dedup: dedup.clone(),
        demand: DemandLoader::new(&cli.redis_url).context("failed to create demand loader")?,
        ingest: IngestClient::new(cli.endpoints()).context("failed to create ingest client")?,
        dispatcher: Dispatcher::new(cli.worker_port).context("failed to create dispatcher")?,
    });
    tokio::spawn(pipeline.run_scheduler());

    server::run_server(AppState { dedup }, cli.port).await
}

/// Snapshot the dedup engine at every top-of-hour. Failures are logged and
/// the next tick tries again.
fn spawn_autosave(dedup: Arc<RollingDedup>) {
    tokio::spawn(async move {
        let to_next_hour = 3600 - Utc::now().timestamp().rem_euclid(3600);
        tokio::time::sleep(Duration::from_secs(to_next_hour as u64)).await;

        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = dedup.snapshot() {
                warn!("periodic snapshot failed: {e}");
            }
        }
    });
}

/// Persist the dedup engine and exit cleanly on SIGINT/SIGTERM.
fn spawn_signal_handler(dedup: Arc<RollingDedup>) -> Result<()> {
    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;

    tokio::spawn(async move {
        #[cfg(unix)]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;

        info!("shutdown signal received, persisting dedup state");
        if let Err(e) = dedup.snapshot() {
            warn!("shutdown snapshot failed: {e}");
        }
        std::process::exit(0);
    });
    Ok(())
}
