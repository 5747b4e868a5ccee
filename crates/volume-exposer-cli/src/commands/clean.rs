//! Clean command - tear down what a mount provisioned

use std::path::PathBuf;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;
use volume_exposer_core::{release_mount, Session, SessionConfig, Sshfs};

use super::ClusterArgs;
use crate::Result;

/// Clean command arguments
#[derive(Args, Debug)]
pub struct CleanArgs {
    /// Namespace of the claim
    pub namespace: String,

    /// Name of the persistent volume claim
    pub claim: String,

    /// Local directory the claim was mounted on
    pub mount_point: PathBuf,

    #[command(flatten)]
    pub cluster: ClusterArgs,
}

/// Run the clean command
///
/// Unmounts the local path, stops the sidecar process on the proxy path and
/// deletes the access point found by the claim label. The unmount runs before
/// the kubeconfig is loaded, so a broken cluster config still releases the
/// local mount.
pub async fn run(args: CleanArgs, cancel: CancellationToken) -> Result<()> {
    let mut session = Session::new(&args.namespace, &args.claim, &args.mount_point, false);
    release_mount(&Sshfs::new(), &mut session, &cancel).await?;

    let mut orchestrator =
        super::orchestrator(&args.cluster, SessionConfig::default(), cancel).await?;
    orchestrator.clean(&mut session).await?;
    info!(
        namespace = %args.namespace,
        claim = %args.claim,
        "Access point removed"
    );
    Ok(())
}
