//! Bagvault CLI.
//!
//! Command-line entry point for the storage-provisioning service.

mod commands;

use clap::Parser;

#[derive(Parser)]
#[command(name = "bagvault")]
#[command(about = "Storage-provisioning orchestrator for content-addressed bags")]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    commands::handle_command(cli.command).await
}
