//! Cluster resource provisioning
//!
//! Resolves the claim and its access mode, and creates, discovers and
//! deletes access point pods. Access points are found again by the claim
//! label, which is the only link a separate `clean` invocation has to the
//! pod a `mount` created.

use std::fmt;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::error::ClaimProblem;
use crate::pod::{
    build_access_point_pod, AccessPointPodSpec, LABEL_CLAIM, LABEL_FRONTED_POD, LABEL_PORT,
};
use crate::{Error, Result};

/// Name prefix of standalone access points
pub const STANDALONE_PREFIX: &str = "volume-exposer";
/// Name prefix of proxy access points
pub const PROXY_PREFIX: &str = "volume-exposer-proxy";

const SUFFIX_LEN: usize = 5;
const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Lowest local forward port; the range ends below 65535
const MIN_LOCAL_PORT: u16 = 1024;

/// Access modes that allow only one mounting node or pod
const EXCLUSIVE_ACCESS_MODES: &[&str] = &["ReadWriteOnce", "ReadWriteOncePod"];

/// Random lowercase alphanumeric suffix for generated names
pub fn random_suffix<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

/// Random port from the non-privileged range
pub fn random_local_port<R: Rng + ?Sized>(rng: &mut R) -> u16 {
    rng.gen_range(MIN_LOCAL_PORT..u16::MAX)
}

/// What an access point does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRole {
    /// Mounts the claim itself and serves it
    Standalone,
    /// Mounts nothing; relays to a sidecar in the pod that owns the claim
    Proxy,
}

impl AccessRole {
    /// Value of the `ROLE` environment variable
    pub fn as_str(self) -> &'static str {
        match self {
            AccessRole::Standalone => "standalone",
            AccessRole::Proxy => "proxy",
        }
    }

    fn name_prefix(self) -> &'static str {
        match self {
            AccessRole::Standalone => STANDALONE_PREFIX,
            AccessRole::Proxy => PROXY_PREFIX,
        }
    }
}

impl fmt::Display for AccessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provisioned SSH-reachable access point pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub name: String,
    pub namespace: String,
    pub claim: String,
    pub role: AccessRole,
    /// Local port the tunnel listens on
    pub local_port: u16,
    /// Pod fronted by a proxy access point
    pub fronted_pod: Option<String>,
}

impl AccessPoint {
    /// Rebuild an access point from a pod found by label
    pub fn from_pod(pod: &Pod, namespace: &str) -> Option<Self> {
        let name = pod.metadata.name.clone()?;
        let labels = pod.metadata.labels.as_ref()?;
        let claim = labels.get(LABEL_CLAIM)?.clone();
        let local_port = labels
            .get(LABEL_PORT)
            .and_then(|p| p.parse().ok())
            .unwrap_or_default();
        let fronted_pod = labels
            .get(LABEL_FRONTED_POD)
            .filter(|p| !p.is_empty())
            .cloned();
        let role = if fronted_pod.is_some() {
            AccessRole::Proxy
        } else {
            AccessRole::Standalone
        };
        Some(Self {
            name,
            namespace: namespace.to_string(),
            claim,
            role,
            local_port,
            fronted_pod,
        })
    }
}

/// How the claim can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusivity {
    /// The volume allows concurrent mounters
    Shareable,
    /// The volume is exclusive but nothing mounts it right now
    ExclusiveFree,
    /// The volume is exclusive and already mounted by this pod
    ExclusiveInUse { pod: String },
}

impl Exclusivity {
    /// Pod that must be fronted by a proxy, if any
    pub fn mounting_pod(&self) -> Option<&str> {
        match self {
            Exclusivity::ExclusiveInUse { pod } => Some(pod),
            _ => None,
        }
    }
}

/// Inputs for creating an access point
#[derive(Debug, Clone)]
pub struct AccessPointRequest<'a> {
    pub namespace: &'a str,
    pub claim: &'a str,
    pub role: AccessRole,
    pub ssh_port: u16,
    pub public_key: &'a str,
    pub image: &'a str,
    pub needs_root: bool,
    /// Pod fronted by a proxy access point
    pub fronted_pod: Option<&'a str>,
}

/// Fetch the claim and require it to be bound
pub async fn resolve_claim(
    cluster: &dyn ClusterApi,
    namespace: &str,
    claim: &str,
) -> Result<PersistentVolumeClaim> {
    let pvc = cluster
        .get_claim(namespace, claim)
        .await?
        .ok_or_else(|| Error::ClaimState {
            namespace: namespace.to_string(),
            claim: claim.to_string(),
            problem: ClaimProblem::NotFound,
        })?;

    let phase = pvc.status.as_ref().and_then(|s| s.phase.clone());
    if phase.as_deref() != Some("Bound") {
        return Err(Error::ClaimState {
            namespace: namespace.to_string(),
            claim: claim.to_string(),
            problem: ClaimProblem::NotBound { phase },
        });
    }

    debug!(namespace, claim, "claim is bound");
    Ok(pvc)
}

/// Decide whether the claim can be mounted by a new pod, or must be reached
/// through the pod that already mounts it.
pub async fn resolve_exclusivity(
    cluster: &dyn ClusterApi,
    namespace: &str,
    pvc: &PersistentVolumeClaim,
) -> Result<Exclusivity> {
    let claim = pvc.metadata.name.as_deref().unwrap_or_default();
    let volume_name = pvc
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .unwrap_or_default();

    let pv = cluster
        .get_volume(volume_name)
        .await?
        .ok_or_else(|| Error::provision_not_found("get volume", volume_name))?;

    let exclusive = pv
        .spec
        .as_ref()
        .and_then(|s| s.access_modes.as_ref())
        .is_some_and(|modes| {
            modes
                .iter()
                .any(|m| EXCLUSIVE_ACCESS_MODES.contains(&m.as_str()))
        });

    if !exclusive {
        return Ok(Exclusivity::Shareable);
    }

    let pods = cluster.list_pods(namespace).await?;
    let mounters: Vec<&str> = pods
        .iter()
        .filter(|p| mounts_claim(p, claim))
        .filter_map(|p| p.metadata.name.as_deref())
        .collect();

    match mounters.as_slice() {
        [] => Ok(Exclusivity::ExclusiveFree),
        [first, rest @ ..] => {
            if !rest.is_empty() {
                warn!(
                    namespace,
                    claim,
                    pods = ?mounters,
                    "multiple pods mount an exclusive claim, using the first"
                );
            }
            Ok(Exclusivity::ExclusiveInUse {
                pod: first.to_string(),
            })
        }
    }
}

fn mounts_claim(pod: &Pod, claim: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .is_some_and(|volumes| {
            volumes.iter().any(|v| {
                v.persistent_volume_claim
                    .as_ref()
                    .is_some_and(|pvc| pvc.claim_name == claim)
            })
        })
}

/// Create an access point pod with a generated name and local port
pub async fn create_access_point<R: Rng + ?Sized>(
    cluster: &dyn ClusterApi,
    request: &AccessPointRequest<'_>,
    rng: &mut R,
) -> Result<AccessPoint> {
    let name = format!("{}-{}", request.role.name_prefix(), random_suffix(rng));
    let local_port = random_local_port(rng);

    let pod = build_access_point_pod(&AccessPointPodSpec {
        name: &name,
        role: request.role.as_str(),
        claim: request.claim,
        local_port,
        ssh_port: request.ssh_port,
        public_key: request.public_key,
        image: request.image,
        needs_root: request.needs_root,
        fronted_pod: request.fronted_pod,
        mount_claim: request.role == AccessRole::Standalone,
    });

    cluster.create_pod(request.namespace, &pod).await?;
    info!(
        namespace = request.namespace,
        pod = %name,
        role = %request.role,
        port = local_port,
        "Access point created"
    );

    Ok(AccessPoint {
        name,
        namespace: request.namespace.to_string(),
        claim: request.claim.to_string(),
        role: request.role,
        local_port,
        fronted_pod: request.fronted_pod.map(str::to_string),
    })
}

/// Find the access point created for a claim.
///
/// No match is a hard failure. If several match, the first is used.
pub async fn find_access_point(
    cluster: &dyn ClusterApi,
    namespace: &str,
    claim: &str,
) -> Result<AccessPoint> {
    let selector = format!("{}={}", LABEL_CLAIM, claim);
    let pods = cluster.list_pods_by_label(namespace, &selector).await?;

    if pods.len() > 1 {
        warn!(
            namespace,
            claim,
            count = pods.len(),
            "multiple access points found for claim, using the first"
        );
    }

    pods.iter()
        .find_map(|p| AccessPoint::from_pod(p, namespace))
        .ok_or_else(|| Error::AccessPointNotFound {
            namespace: namespace.to_string(),
            claim: claim.to_string(),
        })
}

/// Delete an access point pod
pub async fn delete_access_point(cluster: &dyn ClusterApi, access_point: &AccessPoint) -> Result<()> {
    cluster
        .delete_pod(&access_point.namespace, &access_point.name)
        .await?;
    info!(
        namespace = %access_point.namespace,
        pod = %access_point.name,
        "Access point deleted"
    );
    Ok(())
}
