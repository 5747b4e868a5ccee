//! Session tunables and the fixed contract with the access point image

use std::time::Duration;

/// Image for access points and sidecars running as the restricted user
pub const DEFAULT_IMAGE: &str = "bfenski/volume-exposer:v0.2.3";
/// Image used when root access to the volume is requested
pub const DEFAULT_PRIVILEGED_IMAGE: &str = "bfenski/volume-exposer-privileged:v0.2.3";

/// Port the access point's SSH daemon listens on, and the tunnel's remote end
pub const DEFAULT_SSH_PORT: u16 = 2137;
/// Port the proxy access point exposes for the sidecar's reverse connection
pub const PROXY_SSH_PORT: u16 = 6666;
/// uid/gid of the restricted user inside the image
pub const DEFAULT_USER_GROUP: i64 = 2137;

/// Path the volume is mounted at inside the image, and served over SFTP
pub const REMOTE_VOLUME_PATH: &str = "/volume";

/// SSH login for restricted and privileged sessions
pub const RESTRICTED_SSH_USER: &str = "ve";
pub const PRIVILEGED_SSH_USER: &str = "root";

/// Tunable settings for one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between access point readiness checks
    pub poll_interval: Duration,
    /// Deadline for the access point to report ready
    pub ready_timeout: Duration,
    /// Deadline for the tunnel to signal ready
    pub tunnel_timeout: Duration,
    pub image: String,
    pub privileged_image: String,
    pub ssh_port: u16,
    pub proxy_ssh_port: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(5 * 60),
            tunnel_timeout: Duration::from_secs(10),
            image: DEFAULT_IMAGE.to_string(),
            privileged_image: DEFAULT_PRIVILEGED_IMAGE.to_string(),
            ssh_port: DEFAULT_SSH_PORT,
            proxy_ssh_port: PROXY_SSH_PORT,
        }
    }
}

impl SessionConfig {
    /// Image to run for the given privilege mode
    pub fn image_for(&self, needs_root: bool) -> &str {
        if needs_root {
            &self.privileged_image
        } else {
            &self.image
        }
    }
}

/// SSH login used by the mount client for the given privilege mode
pub fn ssh_user(needs_root: bool) -> &'static str {
    if needs_root {
        PRIVILEGED_SSH_USER
    } else {
        RESTRICTED_SSH_USER
    }
}
