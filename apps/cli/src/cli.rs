use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Default server URL.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:4000";

#[derive(Clone, Debug, Parser)]
#[command(name = "chunkferry", version = env!("CARGO_PKG_VERSION"), about, long_about = None, propagate_version = true)]
pub struct App {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Commands {
    /// Upload one or more files, resuming any unfinished session.
    #[command(alias = "up")]
    Upload(UploadArgs),
    /// Show what the server knows about a file.
    #[command(alias = "st")]
    Status(StatusArgs),
}

#[derive(Clone, Debug, Args)]
pub struct UploadArgs {
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    #[arg(long, default_value = DEFAULT_URL)]
    pub url: String,

    /// Chunks in flight per file.
    #[arg(long, default_value_t = 3)]
    pub concurrency: usize,

    /// Attempts per chunk before it is marked failed.
    #[arg(long, default_value_t = 3)]
    pub retries: u32,

    /// Extra rounds of retrying failed chunks before giving up.
    #[arg(long, default_value_t = 2)]
    pub retry_rounds: u32,
}

#[derive(Clone, Debug, Args)]
pub struct StatusArgs {
    pub file: PathBuf,

    #[arg(long, default_value = DEFAULT_URL)]
    pub url: String,
}
