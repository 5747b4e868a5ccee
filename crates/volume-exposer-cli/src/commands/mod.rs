//! CLI commands

use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;
use volume_exposer_core::{KubeCluster, KubeForwarder, Orchestrator, SessionConfig, Sshfs};

use crate::config::kube_client;
use crate::Result;

pub mod clean;
pub mod mount;

/// Cluster connection flags shared by every command
#[derive(Args, Debug, Clone, Default)]
pub struct ClusterArgs {
    /// Path to kubeconfig (defaults to KUBECONFIG, then ~/.kube/config)
    #[arg(long)]
    pub kubeconfig: Option<String>,

    /// Kubeconfig context to use instead of the current one
    #[arg(long)]
    pub context: Option<String>,
}

/// Build an orchestrator backed by the real cluster, port-forward and sshfs
pub async fn orchestrator(
    cluster: &ClusterArgs,
    config: SessionConfig,
    cancel: CancellationToken,
) -> Result<Orchestrator> {
    let client = kube_client(cluster.kubeconfig.as_deref(), cluster.context.as_deref()).await?;
    Ok(Orchestrator::new(
        Arc::new(KubeCluster::new(client.clone())),
        Arc::new(KubeForwarder::new(client)),
        Arc::new(Sshfs::new()),
        config,
        cancel,
    ))
}
