//! Talos Controller
//!
//! Provisions Talos Linux clusters from five CRDs:
//! - Secrets: generates the cluster PKI once
//! - Configuration: renders a machine configuration document
//! - ConfigurationApply: pushes a document to a node
//! - Bootstrap: bootstraps etcd on the first control-plane node, exactly once
//! - Kubeconfig: retrieves the admin kubeconfig

mod backoff;
mod config;
mod controller;
mod error;
mod machinery;
mod managed;
mod metrics;
mod reconciler;
mod store;
#[cfg(test)]
mod test_utils;
mod watcher;

use anyhow::{Context, Result};
use config::ControllerConfig;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Talos Controller");

    let config = ControllerConfig::from_env().context("loading controller configuration")?;
    info!("Configuration:");
    info!("  Poll interval: {:?}", config.poll_interval);
    info!("  Reconcile timeout: {:?}", config.reconcile_timeout);
    info!("  RPC timeout: {:?}", config.rpc_timeout);
    info!("  Concurrency per kind: {}", config.max_concurrent_reconciles);
    info!("  Rate limit: {}/s", config.global_rate_limit);
    info!("  Metrics address: {}", config.metrics_addr);
    info!("  Connection secret namespace: {}", config.connection_secret_namespace);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
