// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Command line interface definition.

use std::path::PathBuf;

use basalt_core::{Config, PeerConfig};
use clap::{Args, Parser, Subcommand};

/// Basalt: a replicated storage node for SQLite-compatible databases.
#[derive(Parser)]
#[command(name = "basalt")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a node.
    Serve(ServeArgs),
    /// Show the status of a running node.
    Status(StatusArgs),
    /// Print version information.
    Version,
}

/// Output format for CLI commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Arguments for the status command.
#[derive(Args)]
pub struct StatusArgs {
    /// Cluster address of the node to query (`host:port`).
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    pub address: String,

    /// Output format (text, json).
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,

    /// Request timeout in milliseconds.
    #[arg(long, default_value = "3000")]
    pub timeout_ms: u64,
}

/// Arguments for the serve command.
#[derive(Args)]
pub struct ServeArgs {
    /// Path to configuration file.
    #[arg(short, long, env = "BASALT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Node ID (overrides config).
    #[arg(long)]
    pub node_id: Option<String>,

    /// Address peers use to reach this node (overrides config).
    #[arg(long)]
    pub address: Option<String>,

    /// Bind address of the cluster listener (overrides config).
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Root of the shared cluster file system (overrides config).
    #[arg(short, long)]
    pub root_dir: Option<PathBuf>,

    /// Cluster peers as comma-separated `id@host:port` pairs (overrides config).
    ///
    /// Example: --peers node-2@10.0.0.2:8080,node-3@10.0.0.3:8080
    #[arg(long, value_delimiter = ',', value_parser = parse_peer)]
    pub peers: Vec<PeerConfig>,

    /// Log level (overrides config; `RUST_LOG` overrides both).
    #[arg(long)]
    pub log_level: Option<String>,
}

impl ServeArgs {
    /// Applies the flags that were given on top of `config`.
    pub fn apply(&self, config: &mut Config) {
        if let Some(id) = &self.node_id {
            config.node.id.clone_from(id);
        }
        if let Some(address) = &self.address {
            config.node.address.clone_from(address);
        }
        if let Some(bind) = &self.bind {
            config.node.bind.clone_from(bind);
        }
        if let Some(root_dir) = &self.root_dir {
            config.cluster.root_dir.clone_from(root_dir);
        }
        if !self.peers.is_empty() {
            config.cluster.peers.clone_from(&self.peers);
        }
        if let Some(level) = &self.log_level {
            config.logging.level.clone_from(level);
        }
    }
}

fn parse_peer(value: &str) -> Result<PeerConfig, String> {
    match value.split_once('@') {
        Some((id, address)) if !id.is_empty() && !address.is_empty() => {
            Ok(PeerConfig { id: id.to_string(), address: address.to_string() })
        }
        _ => Err(format!("expected id@host:port, got {value:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["basalt", "version"]);
        assert!(matches!(cli.command, Commands::Version));

        let cli = Cli::parse_from(["basalt", "serve"]);
        assert!(matches!(cli.command, Commands::Serve(_)));

        let cli = Cli::parse_from(["basalt", "serve", "--config", "/etc/basalt.toml"]);
        if let Commands::Serve(args) = cli.command {
            assert_eq!(args.config, Some(PathBuf::from("/etc/basalt.toml")));
        } else {
            panic!("Expected Serve command");
        }
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::parse_from([
            "basalt",
            "serve",
            "--node-id",
            "node-2",
            "--root-dir",
            "/mnt/basalt",
            "--peers",
            "node-1@10.0.0.1:8080,node-3@10.0.0.3:8080",
        ]);
        let Commands::Serve(args) = cli.command else {
            panic!("Expected Serve command");
        };

        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.node.id, "node-2");
        assert_eq!(config.cluster.root_dir, PathBuf::from("/mnt/basalt"));
        assert_eq!(config.cluster.peers.len(), 2);
        assert_eq!(config.cluster.peers[1].address, "10.0.0.3:8080");
        assert_eq!(config.node.bind, Config::default().node.bind);
    }

    #[test]
    fn test_bad_peer_is_rejected() {
        assert!(Cli::try_parse_from(["basalt", "serve", "--peers", "10.0.0.1:8080"]).is_err());
    }

    #[test]
    fn test_status_parsing() {
        let cli = Cli::parse_from(["basalt", "status", "-a", "10.0.0.1:8080", "--format", "json"]);
        if let Commands::Status(args) = cli.command {
            assert_eq!(args.address, "10.0.0.1:8080");
            assert_eq!(args.format, OutputFormat::Json);
        } else {
            panic!("Expected Status command");
        }
    }
}
