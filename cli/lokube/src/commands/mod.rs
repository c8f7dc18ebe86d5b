//! CLI commands.

mod mount;
mod start;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// lokube - Run a single-node Kubernetes cluster locally.
#[derive(Debug, Parser)]
#[command(name = "lokube")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log verbosity (0 warn, 1 info, 2 debug, 3+ trace).
    ///
    /// At 8 and above the mount helper's output is shown too.
    #[arg(long = "v", global = true, default_value_t = 0, env = "LOKUBE_VERBOSITY")]
    pub verbosity: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a local Kubernetes cluster.
    Start(start::StartCommand),

    /// Mount a host directory (started by `lokube start --mount`).
    Mount(mount::MountCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Start(cmd) => cmd.run(self.verbosity).await,
            Commands::Mount(cmd) => cmd.run().await,
            Commands::Version => {
                println!("lokube version: v{}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_child_invocation_parses() {
        let cli =
            Cli::try_parse_from(["lokube", "mount", "--v=1", "/home/dev:/lokube-host"]).unwrap();
        assert_eq!(cli.verbosity, 1);
        assert!(matches!(cli.command, Commands::Mount(_)));
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
