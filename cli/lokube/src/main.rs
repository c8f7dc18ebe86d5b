//! lokube - run a single-node Kubernetes cluster locally.

use anyhow::Result;
use clap::Parser;

use lokube::commands::Cli;
use lokube::{error, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbosity, cli.log_json);

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
