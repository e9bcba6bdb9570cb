pub mod commands;
pub mod config;
pub mod url;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::key::KeyParams;

#[derive(Parser)]
#[command(name = "racecast")]
#[command(about = "Process and serve race telemetry")]
#[command(version)]
pub struct Cli {
    /// Path to racecast.toml
    #[arg(long, global = true, env = "RACECAST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP and WebSocket server
    Serve(ServeArgs),
    /// Compute or read one telemetry artifact
    Fetch(FetchArgs),
    /// Follow a run's progress on a running server
    Watch(WatchArgs),
    /// Inspect and prune the artifact cache
    Cache(CacheArgs),
}

/// Where sessions come from and where artifacts go.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct SourceArgs {
    /// Upstream provider base URL
    #[arg(long, env = "RACECAST_PROVIDER_URL")]
    pub provider_url: Option<String>,

    /// Read raw sessions from <dir>/<season>/<round>.json instead of a provider
    #[arg(long)]
    pub source_dir: Option<PathBuf>,

    /// Storage root for cached artifacts
    #[arg(long, env = "RACECAST_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,
}

/// Session selection shared by fetch and watch.
#[derive(clap::Args, Debug, Clone)]
pub struct SessionArgs {
    /// Championship season, e.g. 2023
    pub season: i64,

    /// Round number within the season
    pub round: i64,

    /// Comma-separated driver codes (all drivers if omitted)
    #[arg(long, value_delimiter = ',')]
    pub drivers: Vec<String>,

    /// Keep every Nth sample
    #[arg(long, allow_negative_numbers = true)]
    pub frame_skip: Option<i64>,
}

impl SessionArgs {
    pub fn params(&self) -> KeyParams {
        KeyParams {
            season: self.season,
            round: self.round,
            drivers: (!self.drivers.is_empty()).then(|| self.drivers.clone()),
            frame_skip: self.frame_skip,
        }
    }
}

#[derive(clap::Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "RACECAST_LISTEN")]
    pub listen: Option<String>,

    #[command(flatten)]
    pub source: SourceArgs,
}

#[derive(clap::Args)]
pub struct FetchArgs {
    #[command(flatten)]
    pub session: SessionArgs,

    /// Write the gzip artifact instead of plain JSON
    #[arg(long)]
    pub compress: bool,

    /// Recompute even if the artifact is cached
    #[arg(long)]
    pub refresh: bool,

    /// Output file (stdout if not specified)
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub source: SourceArgs,
}

#[derive(clap::Args)]
pub struct WatchArgs {
    #[command(flatten)]
    pub session: SessionArgs,

    /// Server base URL
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    pub url: String,

    /// Print frames exactly as received
    #[arg(long)]
    pub raw: bool,
}

#[derive(clap::Args)]
pub struct CacheArgs {
    /// Storage root for cached artifacts
    #[arg(long, env = "RACECAST_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CacheCommands,
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// List cached artifacts
    List,
    /// Delete cached artifacts of one session
    Delete(CacheDeleteArgs),
    /// Delete artifacts older than a cutoff
    Prune(CachePruneArgs),
}

#[derive(clap::Args)]
pub struct CacheDeleteArgs {
    pub season: i32,

    pub round: u32,

    /// Only the variant with this frame skip
    #[arg(long)]
    pub frame_skip: Option<u32>,
}

#[derive(clap::Args)]
pub struct CachePruneArgs {
    /// Delete entries written more than this many hours ago
    #[arg(long)]
    pub older_than_hours: u64,

    /// Show what would be deleted without deleting
    #[arg(long)]
    pub dry_run: bool,
}
