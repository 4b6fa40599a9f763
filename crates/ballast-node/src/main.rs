//! Ballast node binary
//!
//! Two long-running processes share this entry point: `ballast engine`
//! runs the control-plane core (coordinator, vservers, IPC, peer sync)
//! and `ballast ha` runs the VRRP controller that watches it. They are
//! separate processes so an engine crash abdicates leadership through
//! the HA controller's socket watch instead of taking VRRP down with it.

use anyhow::{Context, Result};
use ballast_config::{FetcherCommand, NodeConfig};
use ballast_engine::{Engine, EngineOptions, IpcServer, SyncControl};
use ballast_ha::{HaConfig, HaController};
use ballast_ncc::NccClient;
use ballast_sync::{SyncClient, SyncClientConfig, SyncServer, SyncServerConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ballast")]
#[command(about = "Ballast load-balancer control plane", long_about = None)]
struct Cli {
    /// Node bootstrap configuration
    #[arg(short, long, default_value = "/etc/ballast/node.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine: state owner, vservers, IPC, and peer sync
    Engine,
    /// Run the HA (VRRP) controller
    Ha,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ballast=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let node = NodeConfig::load(&cli.config)
        .with_context(|| format!("loading node config from {}", cli.config.display()))?;
    info!(node = %node.name, "Ballast v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_token.cancel();
        }
    });

    match cli.command {
        Commands::Engine => run_engine(node, shutdown).await,
        Commands::Ha => run_ha(node, shutdown).await,
    }
}

async fn run_engine(node: NodeConfig, shutdown: CancellationToken) -> Result<()> {
    // Fetcher endpoints: the config fetcher ships as its own component
    // and attaches here. Until it connects, commands are logged and the
    // notification stream stays quiet.
    let (fetcher, fetcher_cmd_rx, _note_tx, note_rx) = ballast_config::FetcherHandle::channel(16);
    tokio::spawn(log_fetcher_commands(fetcher_cmd_rx));

    let (sync_control, sync_hooks) = SyncControl::new(512);

    let ncc = NccClient::new(&node.ncc_socket);
    let ncc_socket = node.ncc_socket.clone();
    let factory = move || {
        Box::new(NccClient::new(&ncc_socket)) as Box<dyn ballast_engine::NetControl>
    };

    let (engine, channels) = Engine::new(
        node.clone(),
        EngineOptions::default(),
        Box::new(ncc),
        Box::new(factory),
        fetcher.clone(),
        note_rx,
        sync_control,
    );

    let ipc = IpcServer::bind(&node.engine_socket, channels.clone())
        .with_context(|| format!("binding engine socket {}", node.engine_socket.display()))?;

    let sync_server = SyncServer::new(SyncServerConfig::from_node(&node));
    let sync_client = SyncClient::new(
        SyncClientConfig::from_node(&node),
        channels.clone(),
        fetcher,
        sync_hooks.client_enabled,
    );

    let ipc_task = tokio::spawn(ipc.run(shutdown.clone()));
    let server_task = tokio::spawn(sync_server.run(
        sync_hooks.server_enabled,
        sync_hooks.notes,
        shutdown.clone(),
    ));
    let client_task = tokio::spawn(sync_client.run(shutdown.clone()));

    engine.run(shutdown.clone()).await;

    shutdown.cancel();
    let _ = ipc_task.await;
    if let Ok(Err(err)) = server_task.await {
        warn!(%err, "Sync server exited with error");
    }
    if let Ok(Err(err)) = client_task.await {
        warn!(%err, "Sync client exited with error");
    }
    info!("Engine exited");
    Ok(())
}

async fn run_ha(node: NodeConfig, shutdown: CancellationToken) -> Result<()> {
    let controller =
        HaController::new(HaConfig::from(&node)).context("starting HA controller")?;
    controller.run(shutdown).await.context("HA controller")?;
    Ok(())
}

async fn log_fetcher_commands(mut rx: mpsc::Receiver<FetcherCommand>) {
    while let Some(command) = rx.recv().await {
        tracing::debug!(?command, "Config fetcher command (no fetcher attached)");
    }
}
