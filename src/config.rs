//! Command line and environment configuration.

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::catalog::types::{Category, MAX_PART_POWER};

#[derive(Debug, Parser)]
#[command(name = "ring-builder-service", version, about)]
pub struct Cli {
    /// Maximum log level (error, warn, info, debug, trace).
    #[arg(long, global = true, env = "RING_BUILDER_LOG_LEVEL", default_value = "info")]
    pub log_level: tracing::Level,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the catalogs in a data directory over HTTP.
    Serve(ServeArgs),
    /// Provision an empty catalog.
    Init(InitArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[arg(long, env = "RING_BUILDER_BIND", default_value = "127.0.0.1:6100")]
    pub bind: SocketAddr,

    #[arg(long, env = "RING_BUILDER_DATA_DIR", default_value = "/etc/swift")]
    pub data_dir: PathBuf,

    /// Where snapshots are written before every overwrite. Defaults to `<data-dir>/backups`.
    #[arg(long, env = "RING_BUILDER_BACKUP_DIR")]
    pub backup_dir: Option<PathBuf>,

    /// Shared key expected in `X-Ring-Builder-Key`.
    #[arg(long, env = "RING_BUILDER_KEY", hide_env_values = true)]
    pub key: String,

    #[arg(long, env = "RING_BUILDER_LOCK_TIMEOUT_MS", default_value_t = 1000)]
    pub lock_timeout_ms: u64,
}

impl ServeArgs {
    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("backups"))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Args)]
pub struct InitArgs {
    #[arg(long, env = "RING_BUILDER_DATA_DIR", default_value = "/etc/swift")]
    pub data_dir: PathBuf,

    #[arg(long)]
    pub category: Category,

    /// The ring has 2^part_power partitions.
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=MAX_PART_POWER as i64))]
    pub part_power: u8,

    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u64).range(1..))]
    pub replicas: u64,

    /// Hours a partition must stay put before it can be moved again.
    #[arg(long, default_value_t = 1)]
    pub min_part_hours: u32,
}
