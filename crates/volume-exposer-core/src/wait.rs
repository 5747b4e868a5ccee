//! Readiness polling for access points
//!
//! This is the only retry loop in a session: every other cluster operation
//! is attempted once.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::cluster::ClusterApi;
use crate::pod::is_pod_ready;
use crate::{Error, Result};

/// Result type for polling check functions.
///
/// - `Ok(Some(value))` - condition met
/// - `Ok(None)` - not yet, keep polling
/// - `Err(e)` - fatal, stop polling immediately
pub type PollResult<T> = Result<Option<T>>;

/// Poll `check_fn` immediately and then every `interval` until it yields a
/// value, fails, or `timeout` elapses.
///
/// Returns `Ok(None)` on timeout. The deadline bounds the whole loop,
/// including a check that is still in flight when it expires.
pub async fn poll_with_deadline<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    description: &str,
    mut check_fn: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    let poll = async {
        loop {
            if let Some(value) = check_fn().await? {
                return Ok(value);
            }
            debug!("Waiting for {}...", description);
            tokio::time::sleep(interval).await;
        }
    };

    match tokio::time::timeout(timeout, poll).await {
        Ok(result) => result.map(Some),
        Err(_) => Ok(None),
    }
}

/// Wait until the pod reports `Ready`, failing with `ReadinessTimeout` once
/// the deadline passes. A pod that disappears while waiting is a
/// provisioning failure.
pub async fn wait_for_pod_ready(
    cluster: &dyn ClusterApi,
    namespace: &str,
    pod: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let description = format!("pod {} to become ready", pod);
    let ready = poll_with_deadline(timeout, interval, &description, move || async move {
        match cluster.get_pod(namespace, pod).await? {
            Some(p) if is_pod_ready(&p) => Ok(Some(())),
            Some(_) => Ok(None),
            None => Err(Error::provision_not_found("wait for pod", pod)),
        }
    })
    .await?;

    ready.ok_or_else(|| Error::ReadinessTimeout {
        pod: pod.to_string(),
        timeout,
    })
}
