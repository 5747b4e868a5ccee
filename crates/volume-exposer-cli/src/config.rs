//! Cluster connection settings and CLI value parsing
//!
//! The kubeconfig resolution chain (highest priority first):
//! 1. Explicit `--kubeconfig` flag
//! 2. `KUBECONFIG` environment variable
//! 3. `~/.kube/config`
//! 4. In-cluster service account, when running inside a pod

use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::{Error, Result};

/// Timeout for establishing a connection to the API server
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for reading an API server response
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolve the client configuration for the given kubeconfig path and context.
///
/// Without an explicit path kube's own inference applies, which reads
/// `KUBECONFIG` and then `~/.kube/config`.
pub async fn kube_config(kubeconfig: Option<&str>, context: Option<&str>) -> Result<Config> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };

    let mut config = match (kubeconfig, context) {
        (Some(path), _) => {
            debug!(path, "using explicit kubeconfig");
            let kc = Kubeconfig::read_from(path).map_err(|e| {
                Error::kubeconfig(format!("failed to read kubeconfig {}: {}", path, e))
            })?;
            Config::from_custom_kubeconfig(kc, &options)
                .await
                .map_err(|e| Error::kubeconfig(e.to_string()))?
        }
        (None, Some(_)) => Config::from_kubeconfig(&options)
            .await
            .map_err(|e| Error::kubeconfig(e.to_string()))?,
        (None, None) => Config::infer()
            .await
            .map_err(|e| Error::kubeconfig(e.to_string()))?,
    };

    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);
    Ok(config)
}

/// Build a kube [`Client`] using the resolution chain
pub async fn kube_client(kubeconfig: Option<&str>, context: Option<&str>) -> Result<Client> {
    let config = kube_config(kubeconfig, context).await?;
    debug!(cluster_url = %config.cluster_url, "connecting to cluster");
    Client::try_from(config).map_err(|e| Error::kubeconfig(e.to_string()))
}

/// Parse a duration such as `10s`, `5m`, `1h` or a bare number of seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let invalid = || {
        Error::validation(format!(
            "invalid duration '{}', expected e.g. 1h, 5m, 30s",
            s
        ))
    };

    let (digits, multiplier) = if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else if let Some(minutes) = s.strip_suffix('m') {
        (minutes, 60)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else {
        (s, 1)
    };

    let n: u64 = digits.parse().map_err(|_| invalid())?;
    if n == 0 {
        return Err(Error::validation(format!("duration must be positive: {}", s)));
    }
    Ok(Duration::from_secs(n * multiplier))
}
