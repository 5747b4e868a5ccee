//! volume-exposer CLI library

pub mod commands;
pub mod config;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

/// volume-exposer - mount a Kubernetes persistent volume claim locally over SSHFS
#[derive(Parser, Debug)]
#[command(name = "volume-exposer")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mount a claim on a local directory
    Mount(commands::mount::MountArgs),
    /// Unmount a claim and remove its access point
    Clean(commands::clean::CleanArgs),
}

impl Cli {
    /// Whether debug logging was requested
    pub fn debug(&self) -> bool {
        matches!(&self.command, Commands::Mount(args) if args.debug)
    }

    /// Run the CLI command
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        match self.command {
            Commands::Mount(args) => commands::mount::run(args, cancel).await,
            Commands::Clean(args) => commands::clean::run(args, cancel).await,
        }
    }
}
