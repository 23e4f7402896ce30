//! Standalone daemon hosting the PulseLink engine: config discovery,
//! tracing, the two listeners, and orderly shutdown on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pulselink_engine::api::{self, AppState};
use pulselink_engine::bus::{WsBus, client as bus_client};
use pulselink_engine::config::EngineConfig;
use pulselink_engine::device::link::Link;
use pulselink_engine::device::sim::{SimLink, SimScript};
use pulselink_engine::engine::Engine;
use pulselink_engine::recorder::store::SessionStore;

#[derive(Parser, Debug)]
#[command(name = "pulselink-daemon", version, about = "PulseLink acquisition engine daemon")]
struct Cli {
    /// Path to a pulselink.toml config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against the simulated band instead of Bluetooth hardware.
    #[arg(long)]
    simulate: bool,

    /// Override the session data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the WebSocket bus port.
    #[arg(long)]
    ws_port: Option<u16>,

    /// Override the HTTP control-plane port.
    #[arg(long)]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run(Cli::parse()).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Daemon failed");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = EngineConfig::discover(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(port) = cli.ws_port {
        config.ws_port = port;
    }
    if let Some(port) = cli.http_port {
        config.http_port = port;
    }
    std::fs::create_dir_all(&config.data_dir)?;
    info!(
        data_dir = %config.data_dir.display(),
        ws_port = config.ws_port,
        http_port = config.http_port,
        simulate = cli.simulate,
        "Starting PulseLink daemon"
    );

    let link = build_link(cli.simulate).await?;
    let store = Arc::new(SessionStore::open(config.db_path())?);
    let bus = WsBus::new(
        config.client_send_queue_len,
        config.slow_consumer_lag_threshold,
    );

    let cancel = CancellationToken::new();
    let ws_listener = TcpListener::bind(("0.0.0.0", config.ws_port)).await?;
    let http_listener = TcpListener::bind(("0.0.0.0", config.http_port)).await?;

    let (engine, recorder, engine_task) = Engine::spawn(
        config,
        link,
        Arc::clone(&store),
        bus.clone(),
        cancel.child_token(),
    )?;

    let ws_task = tokio::spawn(bus_client::serve(
        bus.clone(),
        ws_listener,
        cancel.child_token(),
    ));
    let http_state = AppState {
        engine,
        store,
        recorder,
        bus,
    };
    let http_task = tokio::spawn(api::serve(
        http_state,
        http_listener,
        cancel.child_token(),
    ));

    wait_for_signal().await;
    info!("Shutdown signal received");

    // Acceptors first, then the engine (pipelines, recorder drain,
    // adapter) via its own cancellation handling.
    cancel.cancel();
    let _ = http_task.await;
    let _ = ws_task.await;
    let _ = engine_task.await;
    info!("Daemon stopped");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "Cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(feature = "ble")]
async fn build_link(simulate: bool) -> Result<Link, Box<dyn std::error::Error>> {
    if simulate {
        Ok(Link::Sim(SimLink::new(Arc::new(SimScript::default()))))
    } else {
        Ok(Link::Ble(pulselink_engine::device::ble::BleLink::new().await?))
    }
}

#[cfg(not(feature = "ble"))]
async fn build_link(simulate: bool) -> Result<Link, Box<dyn std::error::Error>> {
    if !simulate {
        info!("Built without the `ble` feature; falling back to the simulated band");
    }
    Ok(Link::Sim(SimLink::new(Arc::new(SimScript::default()))))
}
