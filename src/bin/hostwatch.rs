//! Shim binary that calls into the engine library's `inner_main`.
use clap::Parser as _;
use eyre::Result;
use hostwatch_engine::{cli::Cli, inner_main};

#[tokio::main]
async fn main() -> Result<()> {
    // Delegate to library entrypoint
    inner_main(Cli::parse()).await
}
