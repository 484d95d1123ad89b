//! turnbench CLI
//!
//! Drives one latency experiment end-to-end: workflow config synthesis,
//! engine/daemon bring-up, workload execution, metrics, teardown.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use turnbench::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Progress logs go to stderr; results may go to stdout-adjacent files.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    cli.run().await
}
