// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Basalt: a replicated storage node for SQLite-compatible databases.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use basalt_cluster::{fetch_status, init_cluster_metrics, HttpTransport, Node, NodeStatus};
use basalt_core::{BranchKey, Config, LogFormat, WalUsageProvider};
use basalt_storage::metrics::init_storage_metrics;
use basalt_storage::{ConnectionManager, FileSystem, LocalFileSystem, MemoryPageLogger};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli;

use cli::{Cli, Commands, OutputFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => run_server(args).await,
        Commands::Status(args) => run_status(args).await,
        Commands::Version => {
            println!("basalt {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_server(args: cli::ServeArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    init_logging(&config)?;

    if config.metrics.enabled {
        init_cluster_metrics();
        init_storage_metrics();

        let metrics_addr: std::net::SocketAddr =
            format!("{}:{}", config.metrics.bind, config.metrics.port)
                .parse()
                .context("Invalid metrics bind address")?;

        PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()
            .context("Failed to install Prometheus exporter")?;

        info!("Metrics endpoint listening on http://{}/metrics", metrics_addr);
    }

    print_banner(&config);

    let root = config.cluster.root_dir.clone();
    std::fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create cluster root {}", root.display()))?;

    let transport = Arc::new(
        HttpTransport::new(config.cluster.request_timeout())
            .context("Failed to create cluster transport")?,
    );
    let node = Arc::new(Node::from_config(&config, transport).context("Failed to create node")?);

    let fs: Arc<dyn FileSystem> =
        Arc::new(LocalFileSystem::new(&root).context("Failed to open cluster file system")?);
    let manager = Arc::new(ConnectionManager::new(
        fs,
        node.clone(),
        node.clone(),
        Arc::new(MemoryPageLogger::new()),
        config.storage.clone(),
    ));
    let usage: Arc<dyn WalUsageProvider> = manager.clone();
    node.set_wal_usage_provider(&usage);

    // Opening a branch rolls back checkpoints a crash left open, so do it
    // before anything is served.
    for key in discover_branches(&root).context("Failed to scan branches")? {
        if let Err(e) = manager.branch(&key) {
            warn!(branch = %key, error = %e, "Failed to open branch");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = node.start();
    let checkpoints =
        manager.spawn_checkpoint_ticker(config.storage.checkpoint_interval(), shutdown_rx.clone());
    let gc = manager.spawn_gc_ticker(config.storage.gc_interval(), shutdown_rx);

    let app = basalt_cluster::router(Arc::clone(&node)).route("/health", get(|| async { "OK" }));
    let listener = TcpListener::bind(&config.node.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.node.bind))?;
    info!(bind = %config.node.bind, address = %config.node.address, "Cluster listener ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Cluster listener failed")?;

    info!("Shutting down");
    shutdown_tx.send_replace(true);
    for (name, handle) in [("checkpoint", checkpoints), ("gc", gc)] {
        if let Err(e) = handle.await {
            warn!(ticker = name, error = %e, "Ticker ended abnormally");
        }
    }

    // Flush what is left while still primary, then give up the lease.
    let flushed = tokio::task::spawn_blocking({
        let manager = Arc::clone(&manager);
        move || manager.checkpoint_all()
    })
    .await
    .context("Final checkpoint task failed")?;
    if flushed.checkpointed > 0 || flushed.failed > 0 {
        info!(
            checkpointed = flushed.checkpointed,
            failed = flushed.failed,
            "Final checkpoint pass complete"
        );
    }

    if let Err(e) = node.shutdown() {
        warn!(error = %e, "Failed to release lease on shutdown");
    }
    monitor.await.context("Node monitor ended abnormally")?;

    info!("Shutdown complete");
    Ok(())
}

async fn run_status(args: cli::StatusArgs) -> Result<()> {
    let status = fetch_status(&args.address, Duration::from_millis(args.timeout_ms))
        .await
        .with_context(|| format!("Failed to query {}", args.address))?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Text => print_status(&status),
    }
    Ok(())
}

fn print_status(status: &NodeStatus) {
    println!("Node:        {} ({})", status.id, status.address);
    println!("Role:        {}", status.membership);
    println!("Primary:     {}", status.primary_address.as_deref().unwrap_or("unknown"));
    if let Some(expires_at) = status.lease_expires_at {
        println!("Lease until: {expires_at}");
    }
    if !status.peers.is_empty() {
        println!();
        println!("{:<16} {:<24} {:<12} FAILURES", "PEER", "ADDRESS", "STATE");
        for peer in &status.peers {
            println!(
                "{:<16} {:<24} {:<12} {}",
                peer.id,
                peer.address,
                format!("{:?}", peer.state).to_lowercase(),
                peer.consecutive_failures
            );
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let fmt_layer = tracing_subscriber::fmt::layer();

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry().with(filter).with(fmt_layer.json()).try_init()?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()?;
        }
    }

    Ok(())
}

/// Finds `<database>/<branch>` directories under `root` that hold logs.
fn discover_branches(root: &Path) -> Result<Vec<BranchKey>> {
    let mut branches = Vec::new();
    for database in read_subdirectories(root)? {
        let Some(database_id) = file_name(&database) else { continue };
        if database_id.starts_with('_') {
            continue;
        }
        for branch in read_subdirectories(&database)? {
            let Some(branch_id) = file_name(&branch) else { continue };
            if branch.join("logs").is_dir() {
                branches.push(BranchKey::new(database_id.clone(), branch_id));
            }
        }
    }
    branches.sort();
    Ok(branches)
}

fn read_subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_string)
}

fn print_banner(config: &Config) {
    let peers = if config.cluster.peers.is_empty() {
        "none (single-node)".to_string()
    } else {
        config
            .cluster
            .peers
            .iter()
            .map(|p| format!("{}@{}", p.id, p.address))
            .collect::<Vec<_>>()
            .join(", ")
    };

    println!(
        r#"
      ____                  ____
     / __ )____ __________ _/ / /_
    / __  / __ `/ ___/ __ `/ / __/
   / /_/ / /_/ (__  ) /_/ / / /_
  /_____/\__,_/____/\__,_/_/\__/

      Replicated SQLite Storage  v{}

  Node:        {} ({})
  Listening:   {}
  Cluster Dir: {}
  Peers:       {}
  Lease:       {}s (renew below {}s)
"#,
        env!("CARGO_PKG_VERSION"),
        config.node.id,
        config.node.address,
        config.node.bind,
        config.cluster.root_dir.display(),
        peers,
        config.cluster.lease_duration_secs,
        config.cluster.renew_low_water_secs,
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
