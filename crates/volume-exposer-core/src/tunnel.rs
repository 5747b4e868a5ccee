//! Local port-forward tunnel to an access point
//!
//! A tunnel binds `127.0.0.1:<local_port>` and bridges every accepted
//! connection to the access point's SSH port through the API server. The
//! forwarding work runs on a background task owned by a [`TunnelHandle`].

use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// How long a stopped tunnel may take to wind down before it is aborted
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Owner of a running tunnel.
///
/// Stopping is idempotent: the stop signal is sent at most once no matter how
/// many paths (timeout, error, session end, drop) ask for it.
pub struct TunnelHandle {
    pod: String,
    local_port: u16,
    stop: CancellationToken,
    stopped: bool,
    ready: Option<oneshot::Receiver<()>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl TunnelHandle {
    /// Start `forward` on a background task.
    ///
    /// `forward` must send on the ready channel once traffic can flow and
    /// return when the stop token is cancelled.
    pub fn spawn<F, Fut>(pod: &str, local_port: u16, forward: F) -> Self
    where
        F: FnOnce(CancellationToken, oneshot::Sender<()>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(forward(stop.clone(), ready_tx));
        Self {
            pod: pod.to_string(),
            local_port,
            stop,
            stopped: false,
            ready: Some(ready_rx),
            task: Some(task),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Whether the ready signal has been observed
    pub fn is_ready(&self) -> bool {
        self.ready.is_none() && !self.stopped
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Whether the background task has exited
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the ready signal.
    ///
    /// On timeout the tunnel is stopped and `TunnelTimeout` returned. If the
    /// forwarding task exits first its error is returned instead.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        let Some(ready) = self.ready.as_mut() else {
            return if self.stopped {
                Err(self.closed_error("tunnel already stopped"))
            } else {
                Ok(())
            };
        };

        let outcome = tokio::time::timeout(timeout, ready).await;
        match outcome {
            Ok(Ok(())) => {
                self.ready = None;
                info!(pod = %self.pod, local_port = self.local_port, "Port forwarding is ready");
                Ok(())
            }
            Ok(Err(_)) => {
                // Sender dropped: the task ended without ever becoming ready
                let cause = match self.shutdown().await {
                    Err(e) => e,
                    Ok(()) => self.closed_error("tunnel closed before it became ready"),
                };
                Err(cause)
            }
            Err(_) => {
                warn!(pod = %self.pod, ?timeout, "Timed out waiting for port forwarding");
                // A task stuck on a hung connect is aborted after the grace period
                let _ = self.shutdown().await;
                Err(Error::TunnelTimeout {
                    pod: self.pod.clone(),
                    timeout,
                })
            }
        }
    }

    /// Signal the forwarding task to stop. Returns `false` if already signalled.
    pub fn stop(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        self.stopped = true;
        self.stop.cancel();
        debug!(pod = %self.pod, local_port = self.local_port, "tunnel stop signalled");
        true
    }

    /// Stop and wait for the forwarding task to exit, returning its result
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stop();
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(self.closed_error(&format!("tunnel task failed: {}", join_err))),
            Err(_) => {
                task.abort();
                debug!(pod = %self.pod, "tunnel task aborted after grace period");
                Ok(())
            }
        }
    }

    fn closed_error(&self, message: &str) -> Error {
        Error::Tunnel {
            pod: self.pod.clone(),
            message: message.to_string(),
        }
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("pod", &self.pod)
            .field("local_port", &self.local_port)
            .field("stopped", &self.stopped)
            .finish()
    }
}

/// Opens tunnels to pods
#[cfg_attr(test, automock)]
pub trait Forwarder: Send + Sync {
    /// Start forwarding `127.0.0.1:local_port` to `remote_port` on the pod.
    /// Returns immediately; use [`TunnelHandle::wait_ready`] to confirm.
    fn open(&self, namespace: &str, pod: &str, local_port: u16, remote_port: u16) -> TunnelHandle;
}

/// Port-forward through the API server's `portforward` subresource
#[derive(Clone)]
pub struct KubeForwarder {
    client: Client,
}

impl KubeForwarder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Forwarder for KubeForwarder {
    fn open(&self, namespace: &str, pod: &str, local_port: u16, remote_port: u16) -> TunnelHandle {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod_name = pod.to_string();
        TunnelHandle::spawn(pod, local_port, move |stop, ready| {
            run_forwarder(pods, pod_name, local_port, remote_port, stop, ready)
        })
    }
}

async fn run_forwarder(
    pods: Api<Pod>,
    pod: String,
    local_port: u16,
    remote_port: u16,
    stop: CancellationToken,
    ready: oneshot::Sender<()>,
) -> Result<()> {
    let tunnel_error = |message: String| Error::Tunnel {
        pod: pod.clone(),
        message,
    };

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, local_port))
        .await
        .map_err(|e| tunnel_error(format!("failed to bind 127.0.0.1:{}: {}", local_port, e)))?;

    // Confirm the pod accepts port-forward before reporting ready
    let probe = pods
        .portforward(&pod, &[remote_port])
        .await
        .map_err(|e| tunnel_error(format!("port-forward failed: {}", e)))?;
    probe.abort();
    let _ = probe.join().await;

    debug!(pod = %pod, local_port, remote_port, "Forwarding from 127.0.0.1");
    let _ = ready.send(());

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!(pod = %pod, "port forwarding stopped");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (conn, peer) = accepted
                    .map_err(|e| tunnel_error(format!("accept failed: {}", e)))?;
                debug!(pod = %pod, %peer, "handling connection");
                let pods = pods.clone();
                let pod = pod.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    if let Err(e) = forward_connection(&pods, &pod, remote_port, conn, stop).await {
                        debug!(pod = %pod, error = %e, "connection forwarding ended with error");
                    }
                });
            }
        }
    }
}

async fn forward_connection(
    pods: &Api<Pod>,
    pod: &str,
    remote_port: u16,
    mut conn: TcpStream,
    stop: CancellationToken,
) -> Result<()> {
    let mut pf = pods.portforward(pod, &[remote_port]).await?;
    let mut upstream = pf.take_stream(remote_port).ok_or_else(|| Error::Tunnel {
        pod: pod.to_string(),
        message: format!("no stream for port {}", remote_port),
    })?;

    tokio::select! {
        _ = stop.cancelled() => {}
        copied = tokio::io::copy_bidirectional(&mut conn, &mut upstream) => {
            let (from_client, from_pod) = copied?;
            debug!(pod, from_client, from_pod, "connection closed");
        }
    }

    drop(upstream);
    pf.abort();
    let _ = pf.join().await;
    Ok(())
}
