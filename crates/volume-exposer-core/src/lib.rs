//! Expose a Kubernetes persistent volume as a local SSHFS mount
//!
//! A session provisions an SSH-reachable access point pod for a claim, forwards
//! a local port to it and hands the port to `sshfs`. Claims that are already
//! mounted by a workload with an exclusive access mode are reached through a
//! proxy access point and an ephemeral sidecar injected into that workload.

pub mod cluster;
pub mod config;
pub mod error;
pub mod injector;
pub mod keys;
pub mod mount;
pub mod pod;
pub mod provisioner;
pub mod session;
pub mod tunnel;
pub mod wait;

pub use cluster::{ClusterApi, KubeCluster};
pub use config::SessionConfig;
pub use error::Error;
pub use mount::{LocalMounter, MountExit, Sshfs};
pub use session::{release_mount, Orchestrator, Session, SessionState};
pub use tunnel::{Forwarder, KubeForwarder, TunnelHandle};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
