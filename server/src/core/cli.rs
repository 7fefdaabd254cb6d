use clap::{Parser, Subcommand};

use std::path::PathBuf;

use super::constants::{ENV_CLUSTER_SELF, ENV_CONFIG, ENV_HOST, ENV_PORT, ENV_STORE_BACKEND};
use crate::data::StoreBackendType;

#[derive(Parser)]
#[command(name = "parley")]
#[command(version, about = "Clustered real-time messaging server", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server host address
    #[arg(long, short = 'H', global = true, env = ENV_HOST)]
    pub host: Option<String>,

    /// Server port
    #[arg(long, short = 'p', global = true, env = ENV_PORT)]
    pub port: Option<u16>,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Store backend (memory)
    #[arg(long, global = true, env = ENV_STORE_BACKEND, value_parser = parse_store_backend)]
    pub store_backend: Option<StoreBackendType>,

    /// Cluster node name of this process
    #[arg(long, global = true, env = ENV_CLUSTER_SELF)]
    pub cluster_self: Option<String>,
}

/// Parse store backend from CLI/env string
fn parse_store_backend(s: &str) -> Result<StoreBackendType, String> {
    match s.to_lowercase().as_str() {
        "memory" => Ok(StoreBackendType::Memory),
        _ => Err(format!("Invalid store backend '{}'. Valid options: memory", s)),
    }
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Start the server (default command)
    Start,
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub config: Option<PathBuf>,
    pub store_backend: Option<StoreBackendType>,
    pub cluster_self: Option<String>,
}

/// Parse CLI arguments and return config with command
pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();
    let config = CliConfig {
        host: cli.host,
        port: cli.port,
        config: cli.config,
        store_backend: cli.store_backend,
        cluster_self: cli.cluster_self,
    };
    (config, cli.command)
}
