//! flowgridd — the Flowgrid daemon.
//!
//! Assembles the cluster coordination subsystems:
//! - Work store (redb)
//! - Registry (in-process for standalone mode)
//! - Master cluster coordinator (slot assignment + failover)
//! - Worker cluster coordinator (registration + heartbeats)
//!
//! # Usage
//!
//! ```text
//! flowgridd standalone --config flowgrid.toml --data-dir /var/lib/flowgrid
//! flowgridd check-config --config flowgrid.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowgrid_cluster::{ClusterCoordinator, NodeHealth};
use flowgrid_core::{FlowgridConfig, NodeType};
use flowgrid_registry::{MemoryRegistry, RegistryPaths};
use flowgrid_state::{StateStore, WorkerGroup};

const DEFAULT_LOG_FILTER: &str = "info,flowgridd=debug,flowgrid_cluster=debug";

#[derive(Parser)]
#[command(name = "flowgridd", about = "Flowgrid cluster daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a master and a worker in one process against an in-process registry.
    Standalone {
        /// Path to flowgrid.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for the work store.
        #[arg(long, default_value = "/var/lib/flowgrid")]
        data_dir: PathBuf,

        /// Override `node.host`.
        #[arg(long)]
        host: Option<String>,

        /// Override the master port (`node.port`).
        #[arg(long)]
        port: Option<u16>,

        /// Port the in-process worker registers with.
        #[arg(long, default_value = "1234")]
        worker_port: u16,
    },

    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Standalone {
            config,
            data_dir,
            host,
            port,
            worker_port,
        } => {
            let mut config = match config {
                Some(path) => FlowgridConfig::from_file(&path)?,
                None => FlowgridConfig::default(),
            };
            if let Some(host) = host {
                config.node.host = host;
            }
            if let Some(port) = port {
                config.node.port = port;
            }
            run_standalone(config, &data_dir, worker_port).await
        }
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = FlowgridConfig::from_file(path)?;
    let paths = RegistryPaths::new(config.registry.namespace.clone());
    let identity = config.identity();

    println!("{}", config.to_toml_string()?);
    println!("# identity: {identity} ({})", config.node.node_type);
    match config.node.node_type {
        NodeType::Master => println!("# registers at: {}", paths.master_path(&identity)),
        NodeType::Worker => {
            for group in &config.node.worker_groups {
                println!("# registers at: {}", paths.worker_path(group, &identity));
            }
        }
    }
    Ok(())
}

async fn run_standalone(config: FlowgridConfig, data_dir: &Path, worker_port: u16) -> anyhow::Result<()> {
    info!("Flowgrid daemon starting in standalone mode");

    // Ensure data directory exists.
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("flowgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let registry = MemoryRegistry::new();
    info!(namespace = %config.registry.namespace, "in-process registry initialized");

    let mut master_config = config.clone();
    master_config.node.node_type = NodeType::Master;

    let mut worker_config = config;
    worker_config.node.node_type = NodeType::Worker;
    worker_config.node.port = worker_port;

    seed_worker_groups(&state, &worker_config)?;

    let master_session = Arc::new(registry.connect());
    let master = ClusterCoordinator::new(master_config, master_session.clone(), Arc::new(state.clone()));
    master.start().await?;

    let worker_session = Arc::new(registry.connect());
    let worker = ClusterCoordinator::new(worker_config, worker_session.clone(), Arc::new(state.clone()));
    if let Err(e) = worker.start().await {
        master.shutdown().await;
        return Err(e.into());
    }

    let (slot, ring_size) = master.get_self_slot().await;
    info!(?slot, ring_size, "master slot assigned");

    // ── Wait for shutdown ──────────────────────────────────────

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
        }
        _ = watch_health("master", master.health()) => {}
        _ = watch_health("worker", worker.health()) => {}
    }

    worker.shutdown().await;
    master.shutdown().await;
    worker_session.close().await;
    master_session.close().await;

    info!("Flowgrid daemon stopped");
    Ok(())
}

/// Make sure each group the worker joins is configured and lists it.
fn seed_worker_groups(state: &StateStore, worker_config: &FlowgridConfig) -> anyhow::Result<()> {
    let address = worker_config.identity().address();
    let existing = state.list_worker_groups()?;

    for name in &worker_config.node.worker_groups {
        let mut group = existing
            .iter()
            .find(|g| &g.name == name)
            .cloned()
            .unwrap_or_else(|| WorkerGroup {
                name: name.clone(),
                addresses: Vec::new(),
            });
        if !group.addresses.contains(&address) {
            group.addresses.push(address.clone());
            state.put_worker_group(&group)?;
            info!(group = %name, %address, "worker group configured");
        }
    }
    Ok(())
}

/// Log health transitions; returns once the node is fenced.
async fn watch_health(role: &str, mut health: watch::Receiver<NodeHealth>) {
    while health.changed().await.is_ok() {
        let status = *health.borrow_and_update();
        match status {
            NodeHealth::Healthy => info!(%role, "heartbeat healthy"),
            NodeHealth::Degraded => warn!(%role, "heartbeat degraded"),
            NodeHealth::Fenced => {
                warn!(%role, "node fenced by a peer, shutting down");
                return;
            }
        }
    }
    // Sender gone: nothing left to watch.
    std::future::pending::<()>().await
}
