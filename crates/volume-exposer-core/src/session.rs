//! Session orchestration
//!
//! A [`Session`] is one mount or clean invocation. The [`Orchestrator`]
//! drives it through the provisioning steps in a fixed order:
//!
//! ```text
//! Init -> ClaimResolved -> AccessDecided -> AccessPointCreated
//!      -> [SidecarInjected] -> Ready -> TunnelEstablished -> Mounted
//! ```
//!
//! Cleanup is a separate entry point that reverses the steps: unmount, kill
//! the sidecar's process, delete the access point. A failed mount is not
//! cleaned up automatically.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::cluster::ClusterApi;
use crate::config::{ssh_user, SessionConfig, REMOTE_VOLUME_PATH};
use crate::injector::{
    find_sidecar, inject_sidecar, terminate_sidecar, EphemeralSidecar, SidecarRequest,
    SidecarState,
};
use crate::keys::{KeyCurve, KeyPair};
use crate::mount::{validate_mount_point, LocalMounter, MountExit, MountRequest};
use crate::provisioner::{
    create_access_point, delete_access_point, find_access_point, resolve_claim,
    resolve_exclusivity, AccessPoint, AccessPointRequest, AccessRole, Exclusivity,
};
use crate::tunnel::{Forwarder, TunnelHandle};
use crate::wait::wait_for_pod_ready;
use crate::{Error, Result};

/// Where a session is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Init,
    ClaimResolved,
    AccessDecided,
    AccessPointCreated,
    SidecarInjected,
    Ready,
    TunnelEstablished,
    Mounted,
    /// Terminal; `stage` names the state the failing step started from
    Failed {
        stage: &'static str,
    },
    Cleaning,
    Clean,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::ClaimResolved => "claim-resolved",
            SessionState::AccessDecided => "access-decided",
            SessionState::AccessPointCreated => "access-point-created",
            SessionState::SidecarInjected => "sidecar-injected",
            SessionState::Ready => "ready",
            SessionState::TunnelEstablished => "tunnel-established",
            SessionState::Mounted => "mounted",
            SessionState::Failed { .. } => "failed",
            SessionState::Cleaning => "cleaning",
            SessionState::Clean => "clean",
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SessionState::Failed { .. })
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Failed { stage } => write!(f, "failed at {}", stage),
            other => f.write_str(other.name()),
        }
    }
}

/// One mount or clean invocation and the resources it provisioned
#[derive(Debug)]
pub struct Session {
    namespace: String,
    claim: String,
    mount_point: PathBuf,
    needs_root: bool,
    state: SessionState,
    exclusivity: Option<Exclusivity>,
    access_point: Option<AccessPoint>,
    sidecar: Option<EphemeralSidecar>,
    mount_released: bool,
}

impl Session {
    pub fn new(
        namespace: impl Into<String>,
        claim: impl Into<String>,
        mount_point: impl Into<PathBuf>,
        needs_root: bool,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            claim: claim.into(),
            mount_point: mount_point.into(),
            needs_root,
            state: SessionState::Init,
            exclusivity: None,
            access_point: None,
            sidecar: None,
            mount_released: false,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn claim(&self) -> &str {
        &self.claim
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn needs_root(&self) -> bool {
        self.needs_root
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Access strategy decided for the claim, once resolved
    pub fn exclusivity(&self) -> Option<&Exclusivity> {
        self.exclusivity.as_ref()
    }

    /// Access point this session created or discovered, until it is deleted
    pub fn access_point(&self) -> Option<&AccessPoint> {
        self.access_point.as_ref()
    }

    pub fn sidecar(&self) -> Option<&EphemeralSidecar> {
        self.sidecar.as_ref()
    }

    /// Whether the local mount has already been released during cleanup
    pub fn mount_released(&self) -> bool {
        self.mount_released
    }

    fn advance(&mut self, next: SessionState) {
        debug!(
            namespace = %self.namespace,
            claim = %self.claim,
            from = %self.state,
            to = %next,
            "session state change"
        );
        self.state = next;
    }

    fn fail(&mut self) {
        let stage = self.state.name();
        self.advance(SessionState::Failed { stage });
    }
}

/// Drives sessions against a cluster, a port forwarder and a local mounter
pub struct Orchestrator {
    cluster: Arc<dyn ClusterApi>,
    forwarder: Arc<dyn Forwarder>,
    mounter: Arc<dyn LocalMounter>,
    config: SessionConfig,
    rng: StdRng,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// `cancel` is the process-level interrupt; it aborts provisioning and
    /// ends a running mount.
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        forwarder: Arc<dyn Forwarder>,
        mounter: Arc<dyn LocalMounter>,
        config: SessionConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cluster,
            forwarder,
            mounter,
            config,
            rng: StdRng::from_entropy(),
            cancel,
        }
    }

    /// Replace the random source used for names and ports
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Provision an access point for the session's claim and mount it.
    ///
    /// Blocks until the mount ends. On failure the session is left in
    /// `Failed` with whatever was provisioned still in place.
    #[instrument(
        skip(self, session),
        fields(namespace = %session.namespace, claim = %session.claim)
    )]
    pub async fn mount(&mut self, session: &mut Session) -> Result<MountExit> {
        let result = self.run_mount(session).await;
        if let Err(e) = &result {
            session.fail();
            warn!(error = %e, state = %session.state, "Mount failed; run clean to remove partial resources");
        }
        result
    }

    async fn run_mount(&mut self, session: &mut Session) -> Result<MountExit> {
        self.mounter.check_available()?;
        validate_mount_point(&session.mount_point)?;

        let cluster = Arc::clone(&self.cluster);
        let cancel = self.cancel.clone();
        let namespace = session.namespace.clone();
        let claim = session.claim.clone();

        let pvc = cancellable(
            &cancel,
            "resolve claim",
            resolve_claim(cluster.as_ref(), &namespace, &claim),
        )
        .await?;
        session.advance(SessionState::ClaimResolved);

        let exclusivity = cancellable(
            &cancel,
            "resolve access mode",
            resolve_exclusivity(cluster.as_ref(), &namespace, &pvc),
        )
        .await?;
        info!(namespace = %namespace, claim = %claim, access = ?exclusivity, "Access strategy decided");
        session.exclusivity = Some(exclusivity.clone());
        session.advance(SessionState::AccessDecided);

        let keys = KeyPair::generate(KeyCurve::default())?;
        let needs_root = session.needs_root;
        let image = self.config.image_for(needs_root).to_string();

        let (role, ssh_port) = match &exclusivity {
            Exclusivity::ExclusiveInUse { .. } => (AccessRole::Proxy, self.config.proxy_ssh_port),
            Exclusivity::Shareable | Exclusivity::ExclusiveFree => {
                (AccessRole::Standalone, self.config.ssh_port)
            }
        };
        let request = AccessPointRequest {
            namespace: &namespace,
            claim: &claim,
            role,
            ssh_port,
            public_key: keys.public_key(),
            image: &image,
            needs_root,
            fronted_pod: exclusivity.mounting_pod(),
        };
        let access_point = cancellable(
            &cancel,
            "create access point",
            create_access_point(cluster.as_ref(), &request, &mut self.rng),
        )
        .await?;
        session.access_point = Some(access_point.clone());
        session.advance(SessionState::AccessPointCreated);

        cancellable(
            &cancel,
            "wait for access point",
            wait_for_pod_ready(
                cluster.as_ref(),
                &namespace,
                &access_point.name,
                self.config.poll_interval,
                self.config.ready_timeout,
            ),
        )
        .await?;
        info!(pod = %access_point.name, "Access point is ready");

        if let Some(target) = exclusivity.mounting_pod() {
            let proxy_ip = cancellable(
                &cancel,
                "get proxy address",
                pod_ip(cluster.as_ref(), &namespace, &access_point.name),
            )
            .await?;
            let sidecar_request = SidecarRequest {
                namespace: &namespace,
                pod: target,
                claim: &claim,
                image: &image,
                private_key: keys.private_key_pem(),
                public_key: keys.public_key(),
                proxy_ip: &proxy_ip,
                needs_root,
            };
            let sidecar = cancellable(
                &cancel,
                "inject sidecar",
                inject_sidecar(cluster.as_ref(), &sidecar_request, &mut self.rng),
            )
            .await?;
            session.sidecar = Some(sidecar);
            session.advance(SessionState::SidecarInjected);
        }
        session.advance(SessionState::Ready);

        let mut tunnel = self.forwarder.open(
            &namespace,
            &access_point.name,
            access_point.local_port,
            self.config.ssh_port,
        );
        let outcome = self.mount_through(session, &mut tunnel, &keys).await;
        if let Err(e) = tunnel.shutdown().await {
            debug!(error = %e, "tunnel ended with error");
        }
        outcome
    }

    async fn mount_through(
        &self,
        session: &mut Session,
        tunnel: &mut TunnelHandle,
        keys: &KeyPair,
    ) -> Result<MountExit> {
        cancellable(
            &self.cancel,
            "wait for tunnel",
            tunnel.wait_ready(self.config.tunnel_timeout),
        )
        .await?;
        session.advance(SessionState::TunnelEstablished);

        let request = MountRequest {
            user: ssh_user(session.needs_root).to_string(),
            local_port: tunnel.local_port(),
            mount_point: session.mount_point.clone(),
            remote_path: REMOTE_VOLUME_PATH.to_string(),
            private_key: Zeroizing::new(keys.private_key_pem().to_string()),
        };
        let exit = self.mounter.mount(&request, self.cancel.clone()).await?;
        session.advance(SessionState::Mounted);
        info!(
            claim = %session.claim,
            mount_point = %session.mount_point.display(),
            exit = ?exit,
            "Mount session ended"
        );
        Ok(exit)
    }

    /// Tear down what a mount provisioned, in reverse order.
    ///
    /// Uses the access point recorded on the session when there is one and
    /// otherwise finds it by the claim label. Any failing step aborts the
    /// rest.
    #[instrument(
        skip(self, session),
        fields(namespace = %session.namespace, claim = %session.claim)
    )]
    pub async fn clean(&mut self, session: &mut Session) -> Result<()> {
        if session.state != SessionState::Cleaning {
            session.advance(SessionState::Cleaning);
        }
        match self.run_clean(session).await {
            Ok(()) => {
                session.advance(SessionState::Clean);
                Ok(())
            }
            Err(e) => {
                session.fail();
                Err(e)
            }
        }
    }

    async fn run_clean(&mut self, session: &mut Session) -> Result<()> {
        let cluster = self.cluster.as_ref();
        let cancel = &self.cancel;

        if !session.mount_released {
            unmount_local(self.mounter.as_ref(), &session.mount_point, cancel).await?;
            session.mount_released = true;
        }

        let access_point = match session.access_point.clone() {
            Some(ap) => ap,
            None => {
                cancellable(
                    cancel,
                    "find access point",
                    find_access_point(cluster, &session.namespace, &session.claim),
                )
                .await?
            }
        };
        info!(pod = %access_point.name, role = %access_point.role, "Found access point");

        if let Some(fronted) = access_point.fronted_pod.as_deref() {
            let mut sidecar = match session.sidecar.take() {
                Some(sc) => sc,
                None => {
                    cancellable(
                        cancel,
                        "find sidecar",
                        find_sidecar(cluster, &session.namespace, fronted),
                    )
                    .await?
                }
            };
            let outcome = match sidecar.state {
                SidecarState::Injected => {
                    cancellable(
                        cancel,
                        "terminate sidecar",
                        terminate_sidecar(cluster, &mut sidecar),
                    )
                    .await
                }
                SidecarState::Inert => Ok(()),
            };
            session.sidecar = Some(sidecar);
            outcome?;
        }

        cancellable(
            cancel,
            "delete access point",
            delete_access_point(cluster, &access_point),
        )
        .await?;
        session.access_point = None;
        Ok(())
    }
}

/// Release the session's local mount without contacting the cluster.
///
/// Lets a clean unmount before cluster credentials are loaded; a following
/// [`Orchestrator::clean`] on the same session skips its own unmount.
pub async fn release_mount(
    mounter: &dyn LocalMounter,
    session: &mut Session,
    cancel: &CancellationToken,
) -> Result<()> {
    if session.state != SessionState::Cleaning {
        session.advance(SessionState::Cleaning);
    }
    match unmount_local(mounter, &session.mount_point, cancel).await {
        Ok(()) => {
            session.mount_released = true;
            Ok(())
        }
        Err(e) => {
            session.fail();
            Err(e)
        }
    }
}

async fn unmount_local(
    mounter: &dyn LocalMounter,
    mount_point: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    mounter.check_unmount_available()?;
    cancellable(cancel, "unmount", mounter.unmount(mount_point)).await
}

/// Run `fut` unless the process is interrupted first
async fn cancellable<T, F>(cancel: &CancellationToken, stage: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled { stage: stage.to_string() }),
        result = fut => result,
    }
}

/// Address the sidecar dials to reach the proxy access point
async fn pod_ip(cluster: &dyn ClusterApi, namespace: &str, pod: &str) -> Result<String> {
    let found = cluster
        .get_pod(namespace, pod)
        .await?
        .ok_or_else(|| Error::provision_not_found("get pod ip", pod))?;

    found
        .status
        .and_then(|s| s.pod_ip)
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| Error::Provision {
            operation: "get pod ip".to_string(),
            resource: pod.to_string(),
            message: "pod has no IP address".to_string(),
            not_found: false,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ExecOutput, MockClusterApi};
    use crate::mount::MockLocalMounter;
    use crate::pod::{LABEL_CLAIM, LABEL_FRONTED_POD, LABEL_PORT};
    use crate::tunnel::MockForwarder;
    use k8s_openapi::api::core::v1::{
        EphemeralContainer, PersistentVolume, PersistentVolumeClaim,
        PersistentVolumeClaimSpec, PersistentVolumeClaimStatus,
        PersistentVolumeClaimVolumeSource, PersistentVolumeSpec, Pod, PodCondition, PodSpec,
        PodStatus, Volume,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use mockall::Sequence;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    type Events = Arc<Mutex<Vec<String>>>;

    fn record(events: &Events, event: impl Into<String>) {
        events.lock().unwrap().push(event.into());
    }

    fn position(events: &Events, prefix: &str) -> usize {
        events
            .lock()
            .unwrap()
            .iter()
            .position(|e| e.starts_with(prefix))
            .unwrap_or_else(|| panic!("event {} not recorded", prefix))
    }

    fn claim(name: &str, phase: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_name: Some(format!("pv-{}", name)),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    fn volume(mode: &str) -> PersistentVolume {
        PersistentVolume {
            spec: Some(PersistentVolumeSpec {
                access_modes: Some(vec![mode.to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ready_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: Some("10.1.2.3".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn workload_pod(name: &str, claim: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(vec![Volume {
                    name: "data".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim.to_string(),
                        read_only: None,
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ready_tunnel(pod: &str, local_port: u16) -> TunnelHandle {
        TunnelHandle::spawn(pod, local_port, |stop, ready| async move {
            let _ = ready.send(());
            stop.cancelled().await;
            Ok(())
        })
    }

    fn orchestrator(
        cluster: MockClusterApi,
        forwarder: MockForwarder,
        mounter: MockLocalMounter,
        cancel: CancellationToken,
    ) -> Orchestrator {
        Orchestrator::new(
            Arc::new(cluster),
            Arc::new(forwarder),
            Arc::new(mounter),
            SessionConfig::default(),
            cancel,
        )
        .with_rng(StdRng::seed_from_u64(7))
    }

    fn available_mounter() -> MockLocalMounter {
        let mut mounter = MockLocalMounter::new();
        mounter.expect_check_available().returning(|| Ok(()));
        mounter.expect_check_unmount_available().returning(|| Ok(()));
        mounter
    }

    #[tokio::test]
    async fn scenario_shareable_claim_mounts_through_standalone_access_point() {
        let mount_dir = tempfile::tempdir().unwrap();
        let created: Arc<Mutex<Vec<Pod>>> = Arc::new(Mutex::new(Vec::new()));
        let created_clone = created.clone();

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_get_claim()
            .returning(|_, n| Ok(Some(claim(n, "Bound"))));
        cluster
            .expect_get_volume()
            .returning(|_| Ok(Some(volume("ReadWriteMany"))));
        cluster.expect_list_pods().never();
        cluster.expect_create_pod().times(1).returning(move |_, pod| {
            created_clone.lock().unwrap().push(pod.clone());
            Ok(())
        });
        cluster
            .expect_get_pod()
            .returning(|_, name| Ok(Some(ready_pod(name))));
        cluster.expect_patch_ephemeral_containers().never();

        let mut forwarder = MockForwarder::new();
        forwarder
            .expect_open()
            .times(1)
            .withf(|_, _, _, remote| *remote == 2137)
            .returning(|_, pod, local, _| ready_tunnel(pod, local));

        let mut mounter = available_mounter();
        mounter
            .expect_mount()
            .times(1)
            .withf(|req, _| req.user == "ve" && req.remote_path == "/volume")
            .returning(|_, _| Ok(MountExit::Unmounted));

        let mut orch = orchestrator(cluster, forwarder, mounter, CancellationToken::new());
        let mut session = Session::new("default", "data-1", mount_dir.path(), false);

        let exit = orch.mount(&mut session).await.unwrap();
        assert_eq!(exit, MountExit::Unmounted);
        assert_eq!(session.state(), &SessionState::Mounted);
        assert_eq!(session.exclusivity(), Some(&Exclusivity::Shareable));
        assert!(session.sidecar().is_none());

        let ap = session.access_point().unwrap();
        assert_eq!(ap.role, AccessRole::Standalone);
        assert!(ap.name.starts_with("volume-exposer-"));
        assert!(!ap.name.starts_with("volume-exposer-proxy-"));

        let created = created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert!(created[0]
            .spec
            .as_ref()
            .unwrap()
            .ephemeral_containers
            .is_none());
    }

    #[tokio::test]
    async fn scenario_exclusive_claim_in_use_goes_through_proxy_and_sidecar() {
        let mount_dir = tempfile::tempdir().unwrap();
        let events: Events = Arc::new(Mutex::new(Vec::new()));

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_get_claim()
            .returning(|_, n| Ok(Some(claim(n, "Bound"))));
        cluster
            .expect_get_volume()
            .returning(|_| Ok(Some(volume("ReadWriteOnce"))));
        cluster.expect_list_pods().returning(|_| {
            Ok(vec![
                workload_pod("other", "unrelated"),
                workload_pod("app-7", "data-2"),
            ])
        });
        let ev = events.clone();
        cluster.expect_create_pod().times(1).returning(move |_, pod| {
            let name = pod.metadata.name.clone().unwrap();
            record(&ev, format!("create {}", name));
            Ok(())
        });
        let ev = events.clone();
        cluster
            .expect_get_pod()
            .withf(|_, name| name.starts_with("volume-exposer-proxy-"))
            .returning(move |_, name| {
                record(&ev, format!("get {}", name));
                Ok(Some(ready_pod(name)))
            });
        cluster
            .expect_get_pod()
            .withf(|_, name| name == "app-7")
            .times(1)
            .returning(|_, name| Ok(Some(workload_pod(name, "data-2"))));
        let ev = events.clone();
        cluster
            .expect_patch_ephemeral_containers()
            .times(1)
            .withf(|_, name, patch| {
                name == "app-7"
                    && patch["spec"]["ephemeralContainers"][0]["env"]
                        .as_array()
                        .unwrap()
                        .iter()
                        .any(|e| e["name"] == "PROXY_POD_IP" && e["value"] == "10.1.2.3")
            })
            .returning(move |_, name, _| {
                record(&ev, format!("patch {}", name));
                Ok(())
            });

        let ev = events.clone();
        let mut forwarder = MockForwarder::new();
        forwarder
            .expect_open()
            .times(1)
            .withf(|_, pod, _, remote| pod.starts_with("volume-exposer-proxy-") && *remote == 2137)
            .returning(move |_, pod, local, _| {
                record(&ev, "tunnel");
                ready_tunnel(pod, local)
            });

        let ev = events.clone();
        let mut mounter = available_mounter();
        mounter.expect_mount().times(1).returning(move |_, _| {
            record(&ev, "mount");
            Ok(MountExit::Unmounted)
        });

        let mut orch = orchestrator(cluster, forwarder, mounter, CancellationToken::new());
        let mut session = Session::new("default", "data-2", mount_dir.path(), false);
        orch.mount(&mut session).await.unwrap();

        assert_eq!(session.state(), &SessionState::Mounted);
        let ap = session.access_point().unwrap();
        assert_eq!(ap.role, AccessRole::Proxy);
        assert!(ap.name.starts_with("volume-exposer-proxy-"));
        assert_eq!(ap.fronted_pod.as_deref(), Some("app-7"));

        let sidecar = session.sidecar().unwrap();
        assert_eq!(sidecar.pod, "app-7");
        assert!(sidecar.container.starts_with("volume-exposer-ephemeral-"));

        let create = position(&events, "create volume-exposer-proxy-");
        let ready = position(&events, "get volume-exposer-proxy-");
        let patch = position(&events, "patch app-7");
        let tunnel = position(&events, "tunnel");
        let mount = position(&events, "mount");
        assert!(create < ready && ready < patch && patch < tunnel && tunnel < mount);
    }

    fn access_point_pod(name: &str, claim: &str, fronted: Option<&str>) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_CLAIM.to_string(), claim.to_string());
        labels.insert(LABEL_PORT.to_string(), "40100".to_string());
        if let Some(f) = fronted {
            labels.insert(LABEL_FRONTED_POD.to_string(), f.to_string());
        }
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scenario_clean_kills_sidecar_before_deleting_proxy() {
        let mut seq = Sequence::new();
        let mut cluster = MockClusterApi::new();
        let mut mounter = available_mounter();

        mounter
            .expect_unmount()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        cluster
            .expect_list_pods_by_label()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, sel| sel == "pvcName=data-2")
            .returning(|_, _| {
                Ok(vec![access_point_pod(
                    "volume-exposer-proxy-k2x9q",
                    "data-2",
                    Some("app-7"),
                )])
            });
        cluster
            .expect_get_pod()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, name| {
                let mut pod = workload_pod(name, "data-2");
                if let Some(spec) = pod.spec.as_mut() {
                    spec.ephemeral_containers = Some(vec![EphemeralContainer {
                        name: "volume-exposer-ephemeral-ab12c".to_string(),
                        ..Default::default()
                    }]);
                }
                Ok(Some(pod))
            });
        cluster
            .expect_exec()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, pod, container, _| pod == "app-7" && container == "volume-exposer-ephemeral-ab12c")
            .returning(|_, _, _, _| {
                Ok(ExecOutput {
                    success: true,
                    ..Default::default()
                })
            });
        cluster
            .expect_delete_pod()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, name| name == "volume-exposer-proxy-k2x9q")
            .returning(|_, _| Ok(()));

        let mut orch = orchestrator(cluster, MockForwarder::new(), mounter, CancellationToken::new());
        let mut session = Session::new("default", "data-2", "/mnt/data", false);
        orch.clean(&mut session).await.unwrap();

        assert_eq!(session.state(), &SessionState::Clean);
        assert!(session.access_point().is_none());
        assert_eq!(session.sidecar().unwrap().state, SidecarState::Inert);
    }

    #[tokio::test]
    async fn failed_sidecar_kill_keeps_proxy() {
        let mut cluster = MockClusterApi::new();
        let mut mounter = available_mounter();
        mounter.expect_unmount().returning(|_| Ok(()));
        cluster.expect_list_pods_by_label().returning(|_, _| {
            Ok(vec![access_point_pod("volume-exposer-proxy-a", "data-2", Some("app-7"))])
        });
        cluster.expect_get_pod().returning(|_, name| {
            let mut pod = workload_pod(name, "data-2");
            if let Some(spec) = pod.spec.as_mut() {
                spec.ephemeral_containers = Some(vec![EphemeralContainer {
                    name: "volume-exposer-ephemeral-zz".to_string(),
                    ..Default::default()
                }]);
            }
            Ok(Some(pod))
        });
        cluster.expect_exec().returning(|_, _, _, _| {
            Ok(ExecOutput {
                success: false,
                message: Some("exit code 1".to_string()),
                ..Default::default()
            })
        });
        cluster.expect_delete_pod().never();

        let mut orch = orchestrator(cluster, MockForwarder::new(), mounter, CancellationToken::new());
        let mut session = Session::new("default", "data-2", "/mnt/data", false);
        let err = orch.clean(&mut session).await.unwrap_err();

        assert!(matches!(err, Error::RemoteExec { .. }));
        assert!(session.state().is_failed());
    }

    #[tokio::test]
    async fn second_clean_reports_not_found() {
        let mut cluster = MockClusterApi::new();
        let mut mounter = available_mounter();
        mounter.expect_unmount().times(2).returning(|_| Ok(()));

        let mut seq = Sequence::new();
        cluster
            .expect_list_pods_by_label()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(vec![access_point_pod("volume-exposer-abcde", "data-1", None)]));
        cluster
            .expect_delete_pod()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        cluster
            .expect_list_pods_by_label()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(vec![]));
        cluster.expect_exec().never();

        let mut orch = orchestrator(cluster, MockForwarder::new(), mounter, CancellationToken::new());

        let mut first = Session::new("default", "data-1", "/mnt/data", false);
        orch.clean(&mut first).await.unwrap();

        let mut second = Session::new("default", "data-1", "/mnt/data", false);
        let err = orch.clean(&mut second).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(second.state(), &SessionState::Failed { stage: "cleaning" });
    }

    #[tokio::test]
    async fn unmount_failure_aborts_clean() {
        let mut cluster = MockClusterApi::new();
        cluster.expect_list_pods_by_label().never();
        cluster.expect_delete_pod().never();
        let mut mounter = available_mounter();
        mounter.expect_unmount().returning(|p| {
            Err(Error::Unmount {
                path: p.to_path_buf(),
                message: "not mounted".to_string(),
            })
        });

        let mut orch = orchestrator(cluster, MockForwarder::new(), mounter, CancellationToken::new());
        let mut session = Session::new("default", "data-1", "/mnt/data", false);
        let err = orch.clean(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::Unmount { .. }));
    }

    #[tokio::test]
    async fn unbound_claim_fails_without_cluster_writes() {
        let mount_dir = tempfile::tempdir().unwrap();
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_get_claim()
            .returning(|_, n| Ok(Some(claim(n, "Pending"))));
        cluster.expect_create_pod().never();
        cluster.expect_delete_pod().never();
        cluster.expect_patch_ephemeral_containers().never();
        cluster.expect_exec().never();
        let mut forwarder = MockForwarder::new();
        forwarder.expect_open().never();
        let mut mounter = available_mounter();
        mounter.expect_mount().never();

        let mut orch = orchestrator(cluster, forwarder, mounter, CancellationToken::new());
        let mut session = Session::new("default", "data-3", mount_dir.path(), false);
        let err = orch.mount(&mut session).await.unwrap_err();

        assert!(matches!(err, Error::ClaimState { .. }));
        assert_eq!(session.state(), &SessionState::Failed { stage: "init" });
        assert!(session.access_point().is_none());
    }

    #[tokio::test]
    async fn exclusive_claim_without_mounter_uses_standalone_path() {
        let mount_dir = tempfile::tempdir().unwrap();
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_get_claim()
            .returning(|_, n| Ok(Some(claim(n, "Bound"))));
        cluster
            .expect_get_volume()
            .returning(|_| Ok(Some(volume("ReadWriteOnce"))));
        cluster
            .expect_list_pods()
            .returning(|_| Ok(vec![workload_pod("other", "unrelated")]));
        cluster
            .expect_create_pod()
            .times(1)
            .withf(|_, pod| {
                let name = pod.metadata.name.as_deref().unwrap_or_default();
                name.starts_with("volume-exposer-") && !name.starts_with("volume-exposer-proxy-")
            })
            .returning(|_, _| Ok(()));
        cluster
            .expect_get_pod()
            .returning(|_, name| Ok(Some(ready_pod(name))));
        cluster.expect_patch_ephemeral_containers().never();

        let mut forwarder = MockForwarder::new();
        forwarder
            .expect_open()
            .returning(|_, pod, local, _| ready_tunnel(pod, local));
        let mut mounter = available_mounter();
        mounter
            .expect_mount()
            .returning(|_, _| Ok(MountExit::Unmounted));

        let mut orch = orchestrator(cluster, forwarder, mounter, CancellationToken::new());
        let mut session = Session::new("default", "data-4", mount_dir.path(), false);
        orch.mount(&mut session).await.unwrap();

        assert_eq!(session.exclusivity(), Some(&Exclusivity::ExclusiveFree));
        assert_eq!(session.access_point().unwrap().role, AccessRole::Standalone);
        assert!(session.sidecar().is_none());
    }

    #[tokio::test]
    async fn missing_mount_tool_fails_before_cluster_calls() {
        // No expectations: any cluster call panics
        let cluster = MockClusterApi::new();
        let mut mounter = MockLocalMounter::new();
        mounter.expect_check_available().returning(|| {
            Err(Error::LocalToolMissing {
                tool: "sshfs".to_string(),
                hint: "install it".to_string(),
            })
        });

        let mut orch = orchestrator(cluster, MockForwarder::new(), mounter, CancellationToken::new());
        let mut session = Session::new("default", "data-1", "/", false);
        let err = orch.mount(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::LocalToolMissing { .. }));
    }

    #[tokio::test]
    async fn missing_mount_point_fails_before_cluster_calls() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = MockClusterApi::new();
        let mut orch = orchestrator(
            cluster,
            MockForwarder::new(),
            available_mounter(),
            CancellationToken::new(),
        );
        let mut session = Session::new("default", "data-1", dir.path().join("missing"), false);
        let err = orch.mount(&mut session).await.unwrap_err();
        assert!(matches!(err, Error::InvalidMountPoint { .. }));
    }

    #[tokio::test]
    async fn interrupt_before_mount_cancels_session() {
        let mount_dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let cluster = MockClusterApi::new();
        let mut orch = orchestrator(cluster, MockForwarder::new(), available_mounter(), cancel);
        let mut session = Session::new("default", "data-1", mount_dir.path(), false);
        let err = orch.mount(&mut session).await.unwrap_err();

        assert!(matches!(err, Error::Cancelled { ref stage } if stage == "resolve claim"));
        assert!(session.state().is_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn tunnel_timeout_fails_session_and_skips_mount() {
        let mount_dir = tempfile::tempdir().unwrap();
        let stop_seen: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
        let stop_clone = stop_seen.clone();

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_get_claim()
            .returning(|_, n| Ok(Some(claim(n, "Bound"))));
        cluster
            .expect_get_volume()
            .returning(|_| Ok(Some(volume("ReadWriteMany"))));
        cluster.expect_create_pod().returning(|_, _| Ok(()));
        cluster
            .expect_get_pod()
            .returning(|_, name| Ok(Some(ready_pod(name))));

        let mut forwarder = MockForwarder::new();
        forwarder.expect_open().returning(move |_, pod, local, _| {
            let stop_clone = stop_clone.clone();
            TunnelHandle::spawn(pod, local, move |stop, ready| {
                *stop_clone.lock().unwrap() = Some(stop.clone());
                async move {
                    let _never = ready;
                    stop.cancelled().await;
                    Ok(())
                }
            })
        });
        let mut mounter = available_mounter();
        mounter.expect_mount().never();

        let mut orch = orchestrator(cluster, forwarder, mounter, CancellationToken::new());
        let mut session = Session::new("default", "data-1", mount_dir.path(), false);
        let err = orch.mount(&mut session).await.unwrap_err();

        assert!(matches!(err, Error::TunnelTimeout { .. }));
        assert_eq!(session.state(), &SessionState::Failed { stage: "ready" });
        let stop = stop_seen.lock().unwrap().clone().unwrap();
        assert!(stop.is_cancelled());
        // Partial resources are left for an explicit clean
        assert!(session.access_point().is_some());
    }

    #[tokio::test]
    async fn mount_then_clean_reuses_session_access_point() {
        let mount_dir = tempfile::tempdir().unwrap();
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_get_claim()
            .returning(|_, n| Ok(Some(claim(n, "Bound"))));
        cluster
            .expect_get_volume()
            .returning(|_| Ok(Some(volume("ReadWriteMany"))));
        cluster.expect_create_pod().returning(|_, _| Ok(()));
        cluster
            .expect_get_pod()
            .returning(|_, name| Ok(Some(ready_pod(name))));
        cluster.expect_list_pods_by_label().never();
        cluster
            .expect_delete_pod()
            .times(1)
            .withf(|_, name| name.starts_with("volume-exposer-"))
            .returning(|_, _| Ok(()));

        let mut forwarder = MockForwarder::new();
        forwarder
            .expect_open()
            .returning(|_, pod, local, _| ready_tunnel(pod, local));
        let mut mounter = available_mounter();
        mounter
            .expect_mount()
            .returning(|_, _| Ok(MountExit::Interrupted));
        mounter.expect_unmount().times(1).returning(|_| Ok(()));

        let mut orch = orchestrator(cluster, forwarder, mounter, CancellationToken::new());
        let mut session = Session::new("default", "data-1", mount_dir.path(), true);
        assert_eq!(orch.mount(&mut session).await.unwrap(), MountExit::Interrupted);
        orch.clean(&mut session).await.unwrap();
        assert_eq!(session.state(), &SessionState::Clean);
    }

    /// Serves the proxy clean path but never finishes the sidecar exec
    struct StalledExec;

    #[async_trait::async_trait]
    impl ClusterApi for StalledExec {
        async fn get_claim(&self, _: &str, _: &str) -> Result<Option<PersistentVolumeClaim>> {
            unreachable!("clean does not read claims")
        }

        async fn get_volume(&self, _: &str) -> Result<Option<PersistentVolume>> {
            unreachable!("clean does not read volumes")
        }

        async fn list_pods(&self, _: &str) -> Result<Vec<Pod>> {
            unreachable!("clean does not list every pod")
        }

        async fn list_pods_by_label(&self, _: &str, _: &str) -> Result<Vec<Pod>> {
            Ok(vec![access_point_pod("volume-exposer-proxy-q1", "data-2", Some("app-7"))])
        }

        async fn get_pod(&self, _: &str, name: &str) -> Result<Option<Pod>> {
            let mut pod = workload_pod(name, "data-2");
            if let Some(spec) = pod.spec.as_mut() {
                spec.ephemeral_containers = Some(vec![EphemeralContainer {
                    name: "volume-exposer-ephemeral-q1".to_string(),
                    ..Default::default()
                }]);
            }
            Ok(Some(pod))
        }

        async fn create_pod(&self, _: &str, _: &Pod) -> Result<()> {
            unreachable!("clean does not create pods")
        }

        async fn delete_pod(&self, _: &str, name: &str) -> Result<()> {
            panic!("{} deleted while the sidecar exec was still running", name)
        }

        async fn patch_ephemeral_containers(
            &self,
            _: &str,
            _: &str,
            _: &serde_json::Value,
        ) -> Result<()> {
            unreachable!("clean does not patch pods")
        }

        async fn exec(&self, _: &str, _: &str, _: &str, _: &[String]) -> Result<ExecOutput> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_stops_clean_stuck_on_sidecar_exec() {
        let mut mounter = available_mounter();
        mounter.expect_unmount().times(1).returning(|_| Ok(()));

        let cancel = CancellationToken::new();
        let mut orch = Orchestrator::new(
            Arc::new(StalledExec),
            Arc::new(MockForwarder::new()),
            Arc::new(mounter),
            SessionConfig::default(),
            cancel.clone(),
        );
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            cancel.cancel();
        });

        let mut session = Session::new("default", "data-2", "/mnt/data", false);
        let err = tokio::time::timeout(std::time::Duration::from_secs(30), orch.clean(&mut session))
            .await
            .expect("clean must return once interrupted")
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled { ref stage } if stage == "terminate sidecar"));
        assert_eq!(session.state(), &SessionState::Failed { stage: "cleaning" });
        // The sidecar was not confirmed dead, so it stays recorded as injected
        assert_eq!(session.sidecar().unwrap().state, SidecarState::Injected);
    }

    #[tokio::test]
    async fn interrupted_clean_touches_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut cluster = MockClusterApi::new();
        cluster.expect_list_pods_by_label().never();
        cluster.expect_exec().never();
        cluster.expect_delete_pod().never();
        let mut mounter = available_mounter();
        mounter.expect_unmount().never();

        let mut orch = orchestrator(cluster, MockForwarder::new(), mounter, cancel);
        let mut session = Session::new("default", "data-2", "/mnt/data", false);
        let err = orch.clean(&mut session).await.unwrap_err();

        assert!(matches!(err, Error::Cancelled { ref stage } if stage == "unmount"));
        assert!(!session.mount_released());
    }

    #[tokio::test]
    async fn missing_unmount_tool_fails_clean_before_cluster_calls() {
        // No cluster expectations: any call panics
        let cluster = MockClusterApi::new();
        let mut mounter = MockLocalMounter::new();
        mounter.expect_check_unmount_available().returning(|| {
            Err(Error::LocalToolMissing {
                tool: "fusermount".to_string(),
                hint: "install FUSE".to_string(),
            })
        });
        mounter.expect_unmount().never();

        let mut orch = orchestrator(cluster, MockForwarder::new(), mounter, CancellationToken::new());
        let mut session = Session::new("default", "data-1", "/mnt/data", false);
        let err = orch.clean(&mut session).await.unwrap_err();

        assert!(matches!(err, Error::LocalToolMissing { ref tool, .. } if tool == "fusermount"));
        assert_eq!(session.state(), &SessionState::Failed { stage: "cleaning" });
    }

    #[tokio::test]
    async fn released_mount_is_not_unmounted_again() {
        let mut local = available_mounter();
        local.expect_unmount().times(1).returning(|_| Ok(()));

        let mut session = Session::new("default", "data-1", "/mnt/data", false);
        release_mount(&local, &mut session, &CancellationToken::new())
            .await
            .unwrap();
        assert!(session.mount_released());
        assert_eq!(session.state(), &SessionState::Cleaning);

        let mut cluster = MockClusterApi::new();
        cluster
            .expect_list_pods_by_label()
            .times(1)
            .returning(|_, _| Ok(vec![access_point_pod("volume-exposer-abcde", "data-1", None)]));
        cluster.expect_delete_pod().times(1).returning(|_, _| Ok(()));
        let mut mounter = available_mounter();
        mounter.expect_unmount().never();

        let mut orch = orchestrator(cluster, MockForwarder::new(), mounter, CancellationToken::new());
        orch.clean(&mut session).await.unwrap();
        assert_eq!(session.state(), &SessionState::Clean);
    }

    #[tokio::test]
    async fn failed_release_marks_session_failed() {
        let mut mounter = available_mounter();
        mounter.expect_unmount().returning(|p| {
            Err(Error::Unmount {
                path: p.to_path_buf(),
                message: "not mounted".to_string(),
            })
        });

        let mut session = Session::new("default", "data-1", "/mnt/data", false);
        let err = release_mount(&mounter, &mut session, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unmount { .. }));
        assert!(!session.mount_released());
        assert_eq!(session.state(), &SessionState::Failed { stage: "cleaning" });
    }

    #[tokio::test]
    async fn ready_proxy_without_ip_fails_before_injection() {
        let mount_dir = tempfile::tempdir().unwrap();
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_get_claim()
            .returning(|_, n| Ok(Some(claim(n, "Bound"))));
        cluster
            .expect_get_volume()
            .returning(|_| Ok(Some(volume("ReadWriteOnce"))));
        cluster
            .expect_list_pods()
            .returning(|_| Ok(vec![workload_pod("app-7", "data-2")]));
        cluster.expect_create_pod().times(1).returning(|_, _| Ok(()));
        cluster
            .expect_get_pod()
            .withf(|_, name| name.starts_with("volume-exposer-proxy-"))
            .returning(|_, name| {
                let mut pod = ready_pod(name);
                if let Some(status) = pod.status.as_mut() {
                    status.pod_ip = None;
                }
                Ok(Some(pod))
            });
        cluster.expect_patch_ephemeral_containers().never();
        let mut forwarder = MockForwarder::new();
        forwarder.expect_open().never();
        let mut mounter = available_mounter();
        mounter.expect_mount().never();

        let mut orch = orchestrator(cluster, forwarder, mounter, CancellationToken::new());
        let mut session = Session::new("default", "data-2", mount_dir.path(), false);
        let err = orch.mount(&mut session).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Provision { ref message, .. } if message == "pod has no IP address"
        ));
        assert_eq!(
            session.state(),
            &SessionState::Failed { stage: "access-point-created" }
        );
        assert!(session.sidecar().is_none());
        assert!(session.access_point().is_some());
    }

    #[test]
    fn failed_state_names_stage() {
        let state = SessionState::Failed { stage: "ready" };
        assert_eq!(state.to_string(), "failed at ready");
        assert_eq!(SessionState::TunnelEstablished.to_string(), "tunnel-established");
        assert!(state.is_failed());
    }
}
