//! repolore CLI — dimension-by-dimension knowledge bootstrap.
//!
//! Feeds pre-computed scanner evidence through the production agent (or the
//! heuristic-only path) and persists the resulting candidates locally.

mod adapters;
mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
