//! Error types for volume exposure sessions
//!
//! Each variant carries the resource it concerns (claim, pod, container) so
//! the CLI can report the failing operation together with its cause.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Why a claim cannot be used
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimProblem {
    /// No claim with that name exists in the namespace
    NotFound,
    /// The claim exists but is not in the `Bound` phase
    NotBound {
        /// Phase reported by the API server, if any
        phase: Option<String>,
    },
}

impl std::fmt::Display for ClaimProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimProblem::NotFound => write!(f, "not found"),
            ClaimProblem::NotBound { phase: Some(p) } => write!(f, "not bound (phase {})", p),
            ClaimProblem::NotBound { phase: None } => write!(f, "not bound"),
        }
    }
}

/// Why a sidecar could not be injected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionProblem {
    /// The target pod does not exist
    PodNotFound,
    /// The target pod has no volume backed by the claim
    NoMatchingVolume {
        /// Claim that was looked for
        claim: String,
    },
    /// The API server rejected the ephemeral container patch
    Rejected(String),
}

impl std::fmt::Display for InjectionProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InjectionProblem::PodNotFound => write!(f, "pod not found"),
            InjectionProblem::NoMatchingVolume { claim } => {
                write!(f, "no volume backed by claim {}", claim)
            }
            InjectionProblem::Rejected(msg) => write!(f, "patch rejected: {}", msg),
        }
    }
}

/// Main error type for volume exposure operations
#[derive(Debug, Error)]
pub enum Error {
    /// The claim is missing or unbound
    #[error("claim {namespace}/{claim} is {problem}")]
    ClaimState {
        namespace: String,
        claim: String,
        problem: ClaimProblem,
    },

    /// The API server rejected a create, delete or read of a provisioned resource
    #[error("{operation} failed for {resource}: {message}")]
    Provision {
        /// Operation that failed (e.g. "create pod", "delete pod")
        operation: String,
        /// Name of the resource the operation targeted
        resource: String,
        message: String,
        /// Whether the API server reported the resource as absent
        not_found: bool,
    },

    /// The ephemeral sidecar could not be added to the target pod
    #[error("failed to inject sidecar into pod {pod}: {problem}")]
    Injection { pod: String, problem: InjectionProblem },

    /// The access point did not report ready before the deadline
    #[error("timed out after {timeout:?} waiting for pod {pod} to become ready")]
    ReadinessTimeout { pod: String, timeout: Duration },

    /// The tunnel did not signal ready before the deadline
    #[error("timed out after {timeout:?} waiting for tunnel to pod {pod}")]
    TunnelTimeout { pod: String, timeout: Duration },

    /// The tunnel failed before or while forwarding
    #[error("tunnel to pod {pod} failed: {message}")]
    Tunnel { pod: String, message: String },

    /// The remote command in the sidecar failed or exited non-zero
    #[error("remote command in {pod}/{container} failed: {message}")]
    RemoteExec {
        pod: String,
        container: String,
        message: String,
    },

    /// A required local binary is not on PATH
    #[error("{tool} is not available in your environment. {hint}")]
    LocalToolMissing { tool: String, hint: String },

    /// The local mount path does not exist
    #[error("local mount point {} does not exist", path.display())]
    InvalidMountPoint { path: PathBuf },

    /// The local mount client failed
    #[error("mount failed: {0}")]
    Mount(String),

    /// The local unmount tool failed
    #[error("unmount of {} failed: {message}", path.display())]
    Unmount { path: PathBuf, message: String },

    /// Cleanup found no access point labelled with the claim
    #[error("no access point found for claim {namespace}/{claim}")]
    AccessPointNotFound { namespace: String, claim: String },

    /// Key pair generation or encoding failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// The session was cancelled by the process-level context
    #[error("session cancelled during {stage}")]
    Cancelled { stage: String },

    /// Kubernetes API error not attributable to a specific step
    #[error("kubernetes error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    /// Local I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a provision error from a kube error, keeping 404 classification
    pub fn provision(
        operation: impl Into<String>,
        resource: impl Into<String>,
        source: &kube::Error,
    ) -> Self {
        Self::Provision {
            operation: operation.into(),
            resource: resource.into(),
            message: source.to_string(),
            not_found: is_kube_not_found(source),
        }
    }

    /// Build a provision error for a resource the API server reported absent
    pub fn provision_not_found(operation: impl Into<String>, resource: impl Into<String>) -> Self {
        let resource = resource.into();
        Self::Provision {
            operation: operation.into(),
            message: format!("{} not found", resource),
            resource,
            not_found: true,
        }
    }

    /// Whether this error means the targeted resource does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Provision { not_found, .. } => *not_found,
            Error::AccessPointNotFound { .. } => true,
            Error::ClaimState {
                problem: ClaimProblem::NotFound,
                ..
            } => true,
            Error::Injection {
                problem: InjectionProblem::PodNotFound,
                ..
            } => true,
            Error::Kube { source } => is_kube_not_found(source),
            _ => false,
        }
    }
}

/// Whether a kube error is a 404 from the API server
pub fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}
