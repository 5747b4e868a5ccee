//! Pod and container specifications for access points and sidecars

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar, EphemeralContainer,
    PersistentVolumeClaimVolumeSource, Pod, PodSecurityContext, PodSpec, ResourceRequirements,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::config::{DEFAULT_USER_GROUP, REMOTE_VOLUME_PATH};

/// Container name inside an access point pod
pub const ACCESS_POINT_CONTAINER: &str = "volume-exposer";
/// Name of the claim-backed volume inside a standalone access point
const CLAIM_VOLUME_NAME: &str = "my-pvc";

pub const LABEL_APP: &str = "app";
pub const LABEL_APP_VALUE: &str = "volume-exposer";
/// Label carrying the claim name; the discovery key used by cleanup
pub const LABEL_CLAIM: &str = "pvcName";
/// Label carrying the local forward port
pub const LABEL_PORT: &str = "portNumber";
/// Label carrying the pod fronted by a proxy access point
pub const LABEL_FRONTED_POD: &str = "originalPodName";

/// Environment contract of the access point image
pub const ENV_ROLE: &str = "ROLE";
pub const ENV_SSH_PUBLIC_KEY: &str = "SSH_PUBLIC_KEY";
pub const ENV_SSH_PRIVATE_KEY: &str = "SSH_PRIVATE_KEY";
pub const ENV_PROXY_POD_IP: &str = "PROXY_POD_IP";
pub const ENV_NEEDS_ROOT: &str = "NEEDS_ROOT";
pub const ENV_SSH_PORT: &str = "SSH_PORT";

/// Role value given to the injected sidecar
pub const SIDECAR_ROLE: &str = "ephemeral";

const CPU_REQUEST: &str = "10m";
const MEMORY_REQUEST: &str = "50Mi";
const MEMORY_LIMIT: &str = "100Mi";
const EPHEMERAL_STORAGE_REQUEST: &str = "1Mi";
const EPHEMERAL_STORAGE_LIMIT: &str = "2Mi";

/// Inputs for an access point pod
#[derive(Debug, Clone)]
pub struct AccessPointPodSpec<'a> {
    pub name: &'a str,
    /// `standalone` or `proxy`
    pub role: &'a str,
    pub claim: &'a str,
    pub local_port: u16,
    pub ssh_port: u16,
    pub public_key: &'a str,
    pub image: &'a str,
    pub needs_root: bool,
    /// Pod fronted by a proxy access point
    pub fronted_pod: Option<&'a str>,
    /// Whether the claim is mounted into the pod (standalone role only)
    pub mount_claim: bool,
}

/// Inputs for an ephemeral sidecar container
#[derive(Debug, Clone)]
pub struct SidecarSpec<'a> {
    pub name: &'a str,
    pub image: &'a str,
    /// Name of the pod volume backed by the claim
    pub volume_name: &'a str,
    pub private_key: &'a str,
    pub public_key: &'a str,
    pub proxy_ip: &'a str,
    pub needs_root: bool,
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn quantities(pairs: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect()
}

/// Fixed minimal resource footprint for access points
pub fn access_point_resources() -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(quantities(&[
            ("cpu", CPU_REQUEST),
            ("memory", MEMORY_REQUEST),
            ("ephemeral-storage", EPHEMERAL_STORAGE_REQUEST),
        ])),
        limits: Some(quantities(&[
            ("memory", MEMORY_LIMIT),
            ("ephemeral-storage", EPHEMERAL_STORAGE_LIMIT),
        ])),
        ..Default::default()
    }
}

/// Container security context for the privilege mode.
///
/// Escalation and the mount/chroot capabilities are only granted when root
/// access was requested; otherwise every capability is dropped.
pub fn container_security_context(needs_root: bool) -> SecurityContext {
    if needs_root {
        SecurityContext {
            allow_privilege_escalation: Some(true),
            read_only_root_filesystem: Some(true),
            capabilities: Some(Capabilities {
                add: Some(vec!["SYS_ADMIN".to_string(), "SYS_CHROOT".to_string()]),
                drop: None,
            }),
            ..Default::default()
        }
    } else {
        SecurityContext {
            allow_privilege_escalation: Some(false),
            read_only_root_filesystem: Some(true),
            capabilities: Some(Capabilities {
                add: None,
                drop: Some(vec!["ALL".to_string()]),
            }),
            ..Default::default()
        }
    }
}

fn pod_security_context(needs_root: bool) -> PodSecurityContext {
    let id = if needs_root { 0 } else { DEFAULT_USER_GROUP };
    PodSecurityContext {
        run_as_non_root: Some(!needs_root),
        run_as_user: Some(id),
        run_as_group: Some(id),
        ..Default::default()
    }
}

/// Labels binding an access point to its claim, port and fronted pod
pub fn access_point_labels(
    claim: &str,
    local_port: u16,
    fronted_pod: Option<&str>,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (LABEL_APP.to_string(), LABEL_APP_VALUE.to_string()),
        (LABEL_CLAIM.to_string(), claim.to_string()),
        (LABEL_PORT.to_string(), local_port.to_string()),
    ]);
    if let Some(pod) = fronted_pod {
        labels.insert(LABEL_FRONTED_POD.to_string(), pod.to_string());
    }
    labels
}

/// Build the access point pod
pub fn build_access_point_pod(spec: &AccessPointPodSpec<'_>) -> Pod {
    let mut container = Container {
        name: ACCESS_POINT_CONTAINER.to_string(),
        image: Some(spec.image.to_string()),
        image_pull_policy: Some("Always".to_string()),
        ports: Some(vec![ContainerPort {
            container_port: i32::from(spec.ssh_port),
            ..Default::default()
        }]),
        env: Some(vec![
            env(ENV_SSH_PUBLIC_KEY, spec.public_key),
            env(ENV_SSH_PORT, spec.ssh_port.to_string()),
            env(ENV_NEEDS_ROOT, spec.needs_root.to_string()),
            env(ENV_ROLE, spec.role),
        ]),
        security_context: Some(container_security_context(spec.needs_root)),
        resources: Some(access_point_resources()),
        ..Default::default()
    };

    let mut volumes = None;
    if spec.mount_claim {
        container.volume_mounts = Some(vec![VolumeMount {
            name: CLAIM_VOLUME_NAME.to_string(),
            mount_path: REMOTE_VOLUME_PATH.to_string(),
            ..Default::default()
        }]);
        volumes = Some(vec![Volume {
            name: CLAIM_VOLUME_NAME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: spec.claim.to_string(),
                read_only: None,
            }),
            ..Default::default()
        }]);
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.to_string()),
            labels: Some(access_point_labels(
                spec.claim,
                spec.local_port,
                spec.fronted_pod,
            )),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            volumes,
            security_context: Some(pod_security_context(spec.needs_root)),
            ..Default::default()
        }),
        status: None,
    }
}

/// Build the ephemeral sidecar container
pub fn build_sidecar_container(spec: &SidecarSpec<'_>) -> EphemeralContainer {
    EphemeralContainer {
        name: spec.name.to_string(),
        image: Some(spec.image.to_string()),
        image_pull_policy: Some("Always".to_string()),
        env: Some(vec![
            env(ENV_ROLE, SIDECAR_ROLE),
            env(ENV_SSH_PRIVATE_KEY, spec.private_key),
            env(ENV_PROXY_POD_IP, spec.proxy_ip),
            env(ENV_SSH_PUBLIC_KEY, spec.public_key),
            env(ENV_NEEDS_ROOT, spec.needs_root.to_string()),
        ]),
        security_context: Some(container_security_context(spec.needs_root)),
        volume_mounts: Some(vec![VolumeMount {
            name: spec.volume_name.to_string(),
            mount_path: REMOTE_VOLUME_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Name of the pod volume whose source is the given claim
pub fn claim_volume_name<'a>(pod: &'a Pod, claim: &str) -> Option<&'a str> {
    pod.spec
        .as_ref()?
        .volumes
        .as_ref()?
        .iter()
        .find(|v| {
            v.persistent_volume_claim
                .as_ref()
                .is_some_and(|pvc| pvc.claim_name == claim)
        })
        .map(|v| v.name.as_str())
}

/// Whether the pod reports the `Ready` condition as `True`
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}
