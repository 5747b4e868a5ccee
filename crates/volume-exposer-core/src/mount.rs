//! Local SSHFS mount handoff
//!
//! The mount client runs in the foreground for as long as the volume is
//! mounted, so the session (and its tunnel) stays alive until the user
//! unmounts or interrupts.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Mount client binary
pub const SSHFS: &str = "sshfs";

/// Everything the mount client needs to reach the forwarded access point
pub struct MountRequest {
    pub user: String,
    pub local_port: u16,
    pub mount_point: PathBuf,
    pub remote_path: String,
    pub private_key: Zeroizing<String>,
}

impl std::fmt::Debug for MountRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountRequest")
            .field("user", &self.user)
            .field("local_port", &self.local_port)
            .field("mount_point", &self.mount_point)
            .field("remote_path", &self.remote_path)
            .finish_non_exhaustive()
    }
}

/// How a foreground mount ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountExit {
    /// The mount client exited cleanly, typically after an external unmount
    Unmounted,
    /// The session was interrupted and the mount client killed. The mount
    /// point stays disconnected until it is unmounted by cleanup.
    Interrupted,
}

/// Local filesystem mount collaborator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LocalMounter: Send + Sync {
    /// Fail with `LocalToolMissing` if the mount client is not installed
    fn check_available(&self) -> Result<()>;

    /// Fail with `LocalToolMissing` if the platform unmount tool is not installed
    fn check_unmount_available(&self) -> Result<()>;

    /// Mount and block until the mount ends or `cancel` fires
    async fn mount(&self, request: &MountRequest, cancel: CancellationToken) -> Result<MountExit>;

    /// Unmount a local path
    async fn unmount(&self, path: &Path) -> Result<()>;
}

/// The mount point must already exist
pub fn validate_mount_point(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(Error::InvalidMountPoint {
            path: path.to_path_buf(),
        })
    }
}

/// Where to get sshfs on this platform
pub fn install_hint() -> &'static str {
    if cfg!(target_os = "macos") {
        "For macOS, please install sshfs by visiting: https://osxfuse.github.io/"
    } else if cfg!(target_os = "linux") {
        "For Linux, please install sshfs by visiting: https://github.com/libfuse/sshfs"
    } else {
        "Please install sshfs and try again."
    }
}

/// Where to get the unmount tool on this platform
pub fn unmount_install_hint() -> &'static str {
    if cfg!(target_os = "macos") {
        "umount ships with macOS; check that /sbin is on your PATH."
    } else if cfg!(target_os = "linux") {
        "For Linux, fusermount is part of FUSE, install it by visiting: https://github.com/libfuse/libfuse"
    } else {
        "Please install a FUSE unmount tool and try again."
    }
}

/// Program and leading arguments for unmounting a FUSE mount
pub fn unmount_command() -> (&'static str, &'static [&'static str]) {
    if cfg!(target_os = "macos") {
        ("umount", &[])
    } else {
        ("fusermount", &["-u"])
    }
}

/// sshfs arguments for a foreground mount through the local tunnel port
pub fn sshfs_args(request: &MountRequest, identity_file: &Path) -> Vec<OsString> {
    let mut identity = OsString::from("IdentityFile=");
    identity.push(identity_file);
    vec![
        "-f".into(),
        "-o".into(),
        identity,
        "-o".into(),
        "StrictHostKeyChecking=no".into(),
        "-o".into(),
        "UserKnownHostsFile=/dev/null".into(),
        format!("{}@localhost:{}", request.user, request.remote_path).into(),
        request.mount_point.clone().into_os_string(),
        "-p".into(),
        request.local_port.to_string().into(),
    ]
}

/// Write the private key to an owner-only temporary file, removed on drop
pub fn write_identity_file(private_key: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("ssh_key_")
        .suffix(".pem")
        .tempfile()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(private_key.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// `sshfs`-backed mounter
#[derive(Debug, Clone, Default)]
pub struct Sshfs;

impl Sshfs {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LocalMounter for Sshfs {
    fn check_available(&self) -> Result<()> {
        match which::which(SSHFS) {
            Ok(path) => {
                debug!(path = %path.display(), "found sshfs");
                Ok(())
            }
            Err(_) => Err(Error::LocalToolMissing {
                tool: SSHFS.to_string(),
                hint: install_hint().to_string(),
            }),
        }
    }

    fn check_unmount_available(&self) -> Result<()> {
        let (program, _) = unmount_command();
        which::which(program)
            .map(|path| debug!(path = %path.display(), "found unmount tool"))
            .map_err(|_| Error::LocalToolMissing {
                tool: program.to_string(),
                hint: unmount_install_hint().to_string(),
            })
    }

    async fn mount(&self, request: &MountRequest, cancel: CancellationToken) -> Result<MountExit> {
        let identity = write_identity_file(&request.private_key)?;
        let args = sshfs_args(request, identity.path());

        let mut child = Command::new(SSHFS)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Mount(format!("failed to start {}: {}", SSHFS, e)))?;

        info!(
            mount_point = %request.mount_point.display(),
            port = request.local_port,
            user = %request.user,
            "Volume mounted, press Ctrl-C to stop"
        );

        let exit = tokio::select! {
            status = child.wait() => {
                let status = status?;
                if !status.success() {
                    return Err(Error::Mount(format!("{} exited with {}", SSHFS, status)));
                }
                MountExit::Unmounted
            }
            _ = cancel.cancelled() => {
                warn!(
                    mount_point = %request.mount_point.display(),
                    "Interrupted, stopping sshfs. Run clean to release the mount and the access point"
                );
                child.kill().await?;
                MountExit::Interrupted
            }
        };

        // Identity file is removed here, after sshfs is gone
        drop(identity);
        Ok(exit)
    }

    async fn unmount(&self, path: &Path) -> Result<()> {
        let (program, leading) = unmount_command();
        let unmount_error = |message: String| Error::Unmount {
            path: path.to_path_buf(),
            message,
        };

        let output = Command::new(program)
            .args(leading)
            .arg(path)
            .output()
            .await
            .map_err(|e| unmount_error(format!("failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(unmount_error(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }

        info!(path = %path.display(), "Unmounted");
        Ok(())
    }
}
