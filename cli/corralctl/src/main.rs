//! corralctl - operator CLI for corral
//!
//! Reads and changes cluster state through the scheduler and talks to host
//! agents for job inspection, logs and stops.

use anyhow::Result;
use clap::Parser;

mod commands;
mod error;
mod output;
mod resolve;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
