//! `chunkferry` command-line uploader.

mod cli;
mod commands;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{App, Commands};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let app = App::parse();
    let rt = tokio::runtime::Runtime::new()?;
    match app.cmd {
        Commands::Upload(args) => rt.block_on(commands::upload(args)),
        Commands::Status(args) => rt.block_on(commands::status(args)),
    }
}
