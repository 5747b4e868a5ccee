//! Ephemeral sidecar injection and termination
//!
//! On the exclusive-mount path a transient container is appended to the pod
//! that already mounts the claim. It shares the claim's volume and dials out
//! to the proxy access point. Kubernetes cannot remove an ephemeral
//! container; cleanup can only kill its foreground process, after which the
//! container stays in the pod spec in a terminated state.

use rand::Rng;
use tracing::{debug, info};

use crate::cluster::ClusterApi;
use crate::error::InjectionProblem;
use crate::pod::{build_sidecar_container, claim_volume_name, SidecarSpec};
use crate::provisioner::random_suffix;
use crate::{Error, Result};

/// Name prefix of injected sidecars
pub const SIDECAR_PREFIX: &str = "volume-exposer-ephemeral";

/// Command that ends the sidecar's foreground process
pub const SIDECAR_KILL_COMMAND: &[&str] = &["pkill", "-f", "tail"];

/// Lifecycle of an injected sidecar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidecarState {
    /// Patched into the pod; started asynchronously by the kubelet
    Injected,
    /// Foreground process killed. Terminal: the container cannot be removed.
    Inert,
}

/// An ephemeral container appended to a running pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralSidecar {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub state: SidecarState,
}

/// Inputs for injecting a sidecar
#[derive(Debug, Clone)]
pub struct SidecarRequest<'a> {
    pub namespace: &'a str,
    /// Pod that currently mounts the claim
    pub pod: &'a str,
    pub claim: &'a str,
    pub image: &'a str,
    pub private_key: &'a str,
    pub public_key: &'a str,
    /// Address of the proxy access point the sidecar dials
    pub proxy_ip: &'a str,
    pub needs_root: bool,
}

/// Append a sidecar to the pod mounting the claim.
///
/// Does not wait for the container to start. A rejected patch is not retried:
/// whether the first attempt landed is unknown without re-reading the pod.
pub async fn inject_sidecar<R: Rng + ?Sized>(
    cluster: &dyn ClusterApi,
    request: &SidecarRequest<'_>,
    rng: &mut R,
) -> Result<EphemeralSidecar> {
    let injection_error = |problem| Error::Injection {
        pod: request.pod.to_string(),
        problem,
    };

    let pod = cluster
        .get_pod(request.namespace, request.pod)
        .await?
        .ok_or_else(|| injection_error(InjectionProblem::PodNotFound))?;

    let volume_name = claim_volume_name(&pod, request.claim).ok_or_else(|| {
        injection_error(InjectionProblem::NoMatchingVolume {
            claim: request.claim.to_string(),
        })
    })?;

    let container_name = format!("{}-{}", SIDECAR_PREFIX, random_suffix(rng));
    info!(
        pod = request.pod,
        container = %container_name,
        volume = volume_name,
        "Adding ephemeral container"
    );

    let sidecar = build_sidecar_container(&SidecarSpec {
        name: &container_name,
        image: request.image,
        volume_name,
        private_key: request.private_key,
        public_key: request.public_key,
        proxy_ip: request.proxy_ip,
        needs_root: request.needs_root,
    });

    let mut containers = pod
        .spec
        .as_ref()
        .and_then(|s| s.ephemeral_containers.clone())
        .unwrap_or_default();
    containers.push(sidecar);

    let patch = serde_json::json!({
        "spec": {
            "ephemeralContainers": containers
        }
    });

    cluster
        .patch_ephemeral_containers(request.namespace, request.pod, &patch)
        .await
        .map_err(|e| injection_error(InjectionProblem::Rejected(e.to_string())))?;

    info!(pod = request.pod, container = %container_name, "Ephemeral container added");
    Ok(EphemeralSidecar {
        namespace: request.namespace.to_string(),
        pod: request.pod.to_string(),
        container: container_name,
        state: SidecarState::Injected,
    })
}

/// Locate the sidecar this tool injected into a pod.
///
/// Earlier sessions leave terminated sidecars behind, so a running one is
/// preferred and the most recently added is used otherwise.
pub async fn find_sidecar(
    cluster: &dyn ClusterApi,
    namespace: &str,
    pod: &str,
) -> Result<EphemeralSidecar> {
    let existing = cluster
        .get_pod(namespace, pod)
        .await?
        .ok_or_else(|| Error::provision_not_found("get pod", pod))?;

    let ours: Vec<&str> = existing
        .spec
        .as_ref()
        .and_then(|s| s.ephemeral_containers.as_ref())
        .map(|cs| {
            cs.iter()
                .map(|c| c.name.as_str())
                .filter(|n| n.starts_with(SIDECAR_PREFIX))
                .collect()
        })
        .unwrap_or_default();

    let running: Vec<&str> = existing
        .status
        .as_ref()
        .and_then(|s| s.ephemeral_container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .filter(|s| s.state.as_ref().is_some_and(|st| st.running.is_some()))
                .map(|s| s.name.as_str())
                .collect()
        })
        .unwrap_or_default();

    let container = ours
        .iter()
        .rev()
        .find(|n| running.contains(*n))
        .or_else(|| ours.last())
        .ok_or_else(|| Error::RemoteExec {
            pod: pod.to_string(),
            container: String::new(),
            message: format!("no ephemeral containers found in pod {}", pod),
        })?;

    debug!(pod, container, "found sidecar");
    Ok(EphemeralSidecar {
        namespace: namespace.to_string(),
        pod: pod.to_string(),
        container: container.to_string(),
        state: SidecarState::Injected,
    })
}

/// Kill the sidecar's foreground process, leaving the container inert
pub async fn terminate_sidecar(
    cluster: &dyn ClusterApi,
    sidecar: &mut EphemeralSidecar,
) -> Result<()> {
    let command: Vec<String> = SIDECAR_KILL_COMMAND.iter().map(|s| s.to_string()).collect();
    let output = cluster
        .exec(&sidecar.namespace, &sidecar.pod, &sidecar.container, &command)
        .await?;

    if !output.success {
        return Err(Error::RemoteExec {
            pod: sidecar.pod.clone(),
            container: sidecar.container.clone(),
            message: format!(
                "{}\nstdout: {}\nstderr: {}",
                output
                    .message
                    .as_deref()
                    .unwrap_or("command exited non-zero"),
                output.stdout,
                output.stderr
            ),
        });
    }

    debug!(
        pod = %sidecar.pod,
        container = %sidecar.container,
        stdout = %output.stdout,
        stderr = %output.stderr,
        "kill command output"
    );
    sidecar.state = SidecarState::Inert;
    info!(pod = %sidecar.pod, container = %sidecar.container, "Sidecar process terminated");
    Ok(())
}
