//! Cluster API seam
//!
//! Every read and write this crate performs against the API server goes
//! through [`ClusterApi`], so the session logic can be driven by mocks in
//! tests and by a real `kube::Client` in production.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Field manager recorded on writes made by this tool
pub const FIELD_MANAGER: &str = "volume-exposer";

/// Captured result of a one-shot remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Whether the API server reported a successful exit
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// Failure message from the exec status channel, if any
    pub message: Option<String>,
}

/// Trait abstracting the Kubernetes operations used by a session
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Get a claim, `None` if it does not exist
    async fn get_claim(&self, namespace: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>>;

    /// Get a cluster-scoped volume, `None` if it does not exist
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    /// List every pod in the namespace
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;

    /// List pods in the namespace matching a label selector
    async fn list_pods_by_label(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// Get a pod, `None` if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Submit a new pod
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<()>;

    /// Delete a pod; a missing pod is reported as a not-found error
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Apply a strategic merge patch to the pod's `ephemeralcontainers` subresource
    async fn patch_ephemeral_containers(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()>;

    /// Run a command to completion in one container of a pod
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput>;
}

/// Real implementation backed by a `kube::Client`
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| Error::provision("get claim", name, &e))
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.get_opt(name)
            .await
            .map_err(|e| Error::provision("get volume", name, &e))
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::provision("list pods", namespace, &e))?;
        trace!(namespace, count = pods.items.len(), "listed pods");
        Ok(pods.items)
    }

    async fn list_pods_by_label(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| Error::provision("list pods", selector, &e))?;
        Ok(pods.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.pods(namespace)
            .get_opt(name)
            .await
            .map_err(|e| Error::provision("get pod", name, &e))
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<()> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let pp = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.pods(namespace)
            .create(&pp, pod)
            .await
            .map_err(|e| Error::provision("create pod", &name, &e))?;
        debug!(namespace, pod = %name, "pod created");
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::provision("delete pod", name, &e))?;
        Ok(())
    }

    async fn patch_ephemeral_containers(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        let pp = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.pods(namespace)
            .patch_ephemeral_containers(name, &pp, &Patch::Strategic(patch))
            .await
            .map_err(|e| Error::provision("patch ephemeral containers", name, &e))?;
        Ok(())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = self
            .pods(namespace)
            .exec(pod, command.to_vec(), &params)
            .await
            .map_err(|e| Error::RemoteExec {
                pod: pod.to_string(),
                container: container.to_string(),
                message: format!("exec failed: {}", e),
            })?;

        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let (stdout, stderr) = tokio::join!(read_stream(stdout_reader), read_stream(stderr_reader));

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };

        if let Err(e) = attached.join().await {
            debug!(pod, container, error = %e, "exec session did not close cleanly");
        }

        let success = status
            .as_ref()
            .and_then(|s| s.status.as_deref())
            .map(|s| s == "Success")
            .unwrap_or(false);

        Ok(ExecOutput {
            success,
            stdout: stdout?,
            stderr: stderr?,
            message: status.and_then(|s| s.message),
        })
    }
}

async fn read_stream<R>(reader: Option<R>) -> Result<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut out = String::new();
    if let Some(mut reader) = reader {
        reader.read_to_string(&mut out).await?;
    }
    Ok(out)
}
