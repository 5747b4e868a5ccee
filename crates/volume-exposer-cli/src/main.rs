//! volume-exposer CLI
//!
//! Mounts a Kubernetes persistent volume claim on a local directory over SSHFS.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use volume_exposer_cli::{Cli, Result};

const DEBUG_FILTER: &str = "info,volume_exposer_core=debug,volume_exposer_cli=debug";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --debug
    let default_filter = if cli.debug() { DEBUG_FILTER } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
            on_interrupt.cancel();
        }
    });

    cli.run(cancel).await
}
