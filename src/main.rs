//! ==============================================================================
//! main.rs - flowercare host entry point
//! ==============================================================================
//!
//! purpose:
//!     polls a fixed set of miflora plant sensors over bluetooth le, keeps the
//!     latest successful reading of each in memory and serves a json snapshot
//!     of all of them over http.
//!
//! responsibilities:
//!     - load configuration (config/host.toml or the path given as argv[1])
//!     - set up tracing
//!     - acquire the bluetooth adapter
//!     - run the schedule loop (refresh at startup, then every interval)
//!     - serve GET /sensors
//!     - shut everything down on SIGINT / SIGTERM
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                    rust host (this file)                    │
//!     │  ┌─────────────────┐              ┌─────────────────────┐   │
//!     │  │ schedule loop   │              │ web server          │   │
//!     │  │ (scheduler.rs)  │              │ (server.rs)         │   │
//!     │  └────────┬────────┘              └──────────┬──────────┘   │
//!     │           │ refresh_all                      │ snapshot     │
//!     │     ┌─────┴──────┐   read    ┌───────────────┴──┐           │
//!     │     │  updater   │◄──────────┤    collector     │           │
//!     │     │  + cache   │           └──────────────────┘           │
//!     │     └─────┬──────┘                                          │
//!     └───────────┼─────────────────────────────────────────────────┘
//!                 │ RawSource
//!          ┌──────┴───────┐
//!          │ gatttool /   │
//!          │ simulated    │
//!          └──────────────┘
//!
//! ==============================================================================

mod cache;
mod collector;
mod config;
mod domain;
mod gatttool;
mod miflora;
mod scheduler;
mod server;
mod source;
mod updater;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::collector::Collector;
use crate::config::{Backend, HostConfig};
use crate::source::{RawSource, SimulatedSource};
use crate::updater::Updater;

#[tokio::main]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  Flowercare Host");
    println!("  MiFlora sensors -> JSON");
    println!("===========================================================");

    // step 1: load configuration
    let explicit = std::env::args_os().nth(1).map(PathBuf::from);
    let config = HostConfig::load_or_default(explicit.as_deref())
        .context("Error in configuration")?;
    config.print_summary();

    // step 2: logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // step 3: sensor source + updater
    let source: Arc<dyn RawSource> = match config.bluetooth.backend {
        Backend::Gatttool => Arc::new(gatttool::GatttoolSource::new(&config.bluetooth.adapter)),
        Backend::Simulated => Arc::new(SimulatedSource::new()),
    };
    tracing::info!("Bluetooth Device: {}", config.bluetooth.adapter);

    let mut updater = Updater::new(source, config.retry_policy());
    for sensor in config.sensor_configs() {
        updater.register(sensor);
    }
    let updater = Arc::new(updater);
    let collector = Collector::new(updater.clone(), config.stale_after());

    // step 4: acquire the adapter; released when `cancel` fires
    let cancel = CancellationToken::new();
    let adapter = updater
        .start(cancel.clone())
        .await
        .context("Error creating device")?;

    // step 5: bind first so a taken port fails startup
    let listener = server::bind(&config.server.listen_addr).await?;

    // step 6: schedule loop + web server in background
    let schedule = scheduler::spawn_schedule_loop(
        updater.clone(),
        config.poll_interval(),
        cancel.clone(),
    );

    let web_cancel = cancel.clone();
    let web = tokio::spawn(async move {
        let res = server::run_server(listener, collector, web_cancel.clone()).await;
        if res.is_err() {
            web_cancel.cancel();
        }
        res
    });

    tracing::info!("Host is started.");

    // step 7: wait for a shutdown signal (or a dead web server)
    tokio::select! {
        res = shutdown_signal() => {
            res?;
            tracing::debug!("Got shutdown signal.");
        }
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    if let Err(e) = schedule.await {
        tracing::error!("Schedule loop failed: {}", e);
    }
    if let Err(e) = adapter.await {
        tracing::error!("Adapter release failed: {}", e);
    }
    match web.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e.context("Web server error")),
        Err(e) => tracing::error!("Web server task failed: {}", e),
    }

    tracing::info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tracing::debug!("Signal handler ready.");
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tracing::debug!("Signal handler ready.");
    tokio::signal::ctrl_c().await?;
    Ok(())
}
