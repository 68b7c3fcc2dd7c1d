//! Controller configuration
//!
//! Everything is read from environment variables at startup. Render defaults
//! are carried in an explicit struct handed to the Configuration stage so
//! tests can override them.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ControllerError;

/// Values filled into a rendered machine configuration when a Configuration
/// spec leaves them empty
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderDefaults {
    /// Cluster name
    pub cluster_name: String,
    /// Control plane endpoint URL
    pub cluster_endpoint: String,
    /// Talos version, selects the installer image tag
    pub talos_version: String,
    /// Kubernetes version, selects the kubelet image tag
    pub kubernetes_version: String,
    /// Install disk
    pub install_disk: String,
    /// Installer image repository
    pub installer_image: String,
    /// Kubelet image repository
    pub kubelet_image: String,
    /// Cluster DNS domain
    pub dns_domain: String,
    /// Pod CIDRs
    pub pod_subnets: Vec<String>,
    /// Service CIDRs
    pub service_subnets: Vec<String>,
}

impl Default for RenderDefaults {
    fn default() -> Self {
        Self {
            cluster_name: "talos-cluster".to_string(),
            cluster_endpoint: "https://talos-cluster:6443".to_string(),
            talos_version: "v1.9.5".to_string(),
            kubernetes_version: "v1.32.3".to_string(),
            install_disk: "/dev/sda".to_string(),
            installer_image: "ghcr.io/siderolabs/installer".to_string(),
            kubelet_image: "ghcr.io/siderolabs/kubelet".to_string(),
            dns_domain: "cluster.local".to_string(),
            pod_subnets: vec!["10.244.0.0/16".to_string()],
            service_subnets: vec!["10.96.0.0/12".to_string()],
        }
    }
}

/// Runtime settings for the controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Requeue interval for converged records
    pub poll_interval: Duration,
    /// Requeue interval right after a create or update
    pub short_requeue: Duration,
    /// Deadline for one reconciliation pass
    pub reconcile_timeout: Duration,
    /// Deadline for one machine API call
    pub rpc_timeout: Duration,
    /// Concurrent reconciliations per kind
    pub max_concurrent_reconciles: u16,
    /// Quiet period before a burst of events is reconciled
    pub debounce: Duration,
    /// Reconciliations per second across all records
    pub global_rate_limit: u32,
    /// First retry delay for a failing record
    pub backoff_base: Duration,
    /// Retry delay cap for a failing record
    pub backoff_max: Duration,
    /// Address for `/metrics`, `/healthz` and `/readyz`
    pub metrics_addr: SocketAddr,
    /// Namespace for connection secrets that do not name one
    pub connection_secret_namespace: String,
    /// Render defaults
    pub render: RenderDefaults,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            short_requeue: Duration::from_secs(5),
            reconcile_timeout: Duration::from_secs(120),
            rpc_timeout: Duration::from_secs(30),
            max_concurrent_reconciles: 3,
            debounce: Duration::from_secs(1),
            global_rate_limit: 10,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            connection_secret_namespace: "talos-system".to_string(),
            render: RenderDefaults::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let seconds = |key: &str, default: Duration| -> Result<Duration, ControllerError> {
            parse_or(&lookup, key, default.as_secs()).map(Duration::from_secs)
        };
        let text = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let render = RenderDefaults {
            cluster_name: text("DEFAULT_CLUSTER_NAME", &defaults.render.cluster_name),
            cluster_endpoint: text("DEFAULT_CLUSTER_ENDPOINT", &defaults.render.cluster_endpoint),
            talos_version: text("DEFAULT_TALOS_VERSION", &defaults.render.talos_version),
            kubernetes_version: text("DEFAULT_KUBERNETES_VERSION", &defaults.render.kubernetes_version),
            install_disk: text("DEFAULT_INSTALL_DISK", &defaults.render.install_disk),
            ..defaults.render.clone()
        };

        let config = Self {
            poll_interval: seconds("POLL_INTERVAL_SECONDS", defaults.poll_interval)?,
            short_requeue: seconds("SHORT_REQUEUE_SECONDS", defaults.short_requeue)?,
            reconcile_timeout: seconds("RECONCILE_TIMEOUT_SECONDS", defaults.reconcile_timeout)?,
            rpc_timeout: seconds("RPC_TIMEOUT_SECONDS", defaults.rpc_timeout)?,
            max_concurrent_reconciles: parse_or(&lookup, "MAX_CONCURRENT_RECONCILES", defaults.max_concurrent_reconciles)?,
            debounce: seconds("DEBOUNCE_SECONDS", defaults.debounce)?,
            global_rate_limit: parse_or(&lookup, "GLOBAL_RATE_LIMIT_PER_SECOND", defaults.global_rate_limit)?,
            backoff_base: seconds("BACKOFF_BASE_SECONDS", defaults.backoff_base)?,
            backoff_max: seconds("BACKOFF_MAX_SECONDS", defaults.backoff_max)?,
            metrics_addr: parse_or(&lookup, "METRICS_ADDR", defaults.metrics_addr)?,
            connection_secret_namespace: text("CONNECTION_SECRET_NAMESPACE", &defaults.connection_secret_namespace),
            render,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ControllerError> {
        if self.poll_interval.is_zero() {
            return Err(ControllerError::InvalidConfig("POLL_INTERVAL_SECONDS must be positive".to_string()));
        }
        if self.backoff_base.is_zero() || self.backoff_base > self.backoff_max {
            return Err(ControllerError::InvalidConfig(
                "BACKOFF_BASE_SECONDS must be positive and not exceed BACKOFF_MAX_SECONDS".to_string(),
            ));
        }
        if self.global_rate_limit == 0 || self.max_concurrent_reconciles == 0 {
            return Err(ControllerError::InvalidConfig(
                "rate limit and concurrency must be positive".to_string(),
            ));
        }
        if !self.render.cluster_endpoint.starts_with("https://") {
            return Err(ControllerError::InvalidConfig(format!(
                "DEFAULT_CLUSTER_ENDPOINT must be an https URL, got {}",
                self.render.cluster_endpoint
            )));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{key}={raw}: {e}"))),
        _ => Ok(default),
    }
}
