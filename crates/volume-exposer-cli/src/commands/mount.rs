//! Mount command - expose a claim on a local directory over SSHFS

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;
use volume_exposer_core::config::{DEFAULT_IMAGE, DEFAULT_PRIVILEGED_IMAGE};
use volume_exposer_core::{MountExit, Session, SessionConfig};

use super::ClusterArgs;
use crate::config::parse_duration;
use crate::Result;

/// Mount command arguments
#[derive(Args, Debug)]
pub struct MountArgs {
    /// Namespace of the claim
    pub namespace: String,

    /// Name of the persistent volume claim
    pub claim: String,

    /// Existing local directory to mount onto
    pub mount_point: PathBuf,

    /// Run the access point as root, with the privileged image
    #[arg(long)]
    pub needs_root: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Access point image for unprivileged sessions
    #[arg(long, env = "VOLUME_EXPOSER_IMAGE", default_value = DEFAULT_IMAGE)]
    pub image: String,

    /// Access point image for sessions started with --needs-root
    #[arg(long, env = "VOLUME_EXPOSER_PRIVILEGED_IMAGE", default_value = DEFAULT_PRIVILEGED_IMAGE)]
    pub privileged_image: String,

    /// How long to wait for the access point to become ready
    #[arg(long, env = "VOLUME_EXPOSER_READY_TIMEOUT", default_value = "5m", value_parser = parse_duration)]
    pub ready_timeout: Duration,

    /// How long to wait for the port-forward tunnel
    #[arg(long, env = "VOLUME_EXPOSER_TUNNEL_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub tunnel_timeout: Duration,

    #[command(flatten)]
    pub cluster: ClusterArgs,
}

impl MountArgs {
    /// Session settings with this command's overrides applied
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ready_timeout: self.ready_timeout,
            tunnel_timeout: self.tunnel_timeout,
            image: self.image.clone(),
            privileged_image: self.privileged_image.clone(),
            ..SessionConfig::default()
        }
    }
}

/// Run the mount command
///
/// Blocks until the mount ends. Provisioned resources are left in place on
/// failure or interrupt; `clean` removes them.
pub async fn run(args: MountArgs, cancel: CancellationToken) -> Result<()> {
    let mut orchestrator =
        super::orchestrator(&args.cluster, args.session_config(), cancel).await?;
    let mut session = Session::new(
        &args.namespace,
        &args.claim,
        &args.mount_point,
        args.needs_root,
    );

    match orchestrator.mount(&mut session).await? {
        MountExit::Unmounted => info!(
            claim = %args.claim,
            mount_point = %args.mount_point.display(),
            "Volume unmounted"
        ),
        MountExit::Interrupted => info!(
            "Mount stopped. Run `volume-exposer clean {} {} {}` to remove the access point",
            args.namespace,
            args.claim,
            args.mount_point.display()
        ),
    }
    Ok(())
}
