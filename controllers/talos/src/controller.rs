//! Main controller implementation.
//!
//! `Controller` wires the Kubernetes client, the machine API connector, the
//! metrics endpoint and one watcher per provisioning kind:
//! - Secrets: cluster PKI
//! - Configuration: rendered machine configuration
//! - ConfigurationApply: configuration pushed to a node
//! - Bootstrap: one-time etcd bootstrap
//! - Kubeconfig: admin kubeconfig retrieval

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use kube::Client;
use talos_client::{MachineConnector, TalosConnector};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::metrics::{self, Metrics};
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;

type WatcherHandle = JoinHandle<Result<(), ControllerError>>;

fn watcher_result(kind: &str, result: Result<Result<(), ControllerError>, tokio::task::JoinError>) -> Result<(), ControllerError> {
    result
        .map_err(|e| ControllerError::Watch(format!("{kind} watcher panicked: {e}")))?
        .map_err(|e| ControllerError::Watch(format!("{kind} watcher error: {e}")))
}

/// Main controller for Talos provisioning.
pub struct Controller {
    secrets_watcher: WatcherHandle,
    configuration_watcher: WatcherHandle,
    configuration_apply_watcher: WatcherHandle,
    bootstrap_watcher: WatcherHandle,
    kubeconfig_watcher: WatcherHandle,
    metrics_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its watchers.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Talos Controller");

        let kube_client = Client::try_default().await?;

        let metrics = Arc::new(
            Metrics::new().map_err(|e| ControllerError::InvalidConfig(format!("metrics registry: {e}")))?,
        );
        let ready = Arc::new(AtomicBool::new(false));
        let metrics_server = tokio::spawn(metrics::serve(
            config.metrics_addr,
            Arc::clone(&metrics),
            Arc::clone(&ready),
        ));

        let connector: Arc<dyn MachineConnector> = Arc::new(TalosConnector::new(config.rpc_timeout));
        let reconciler = Arc::new(Reconciler::new(kube_client.clone(), &config, connector, metrics));
        let watcher = Arc::new(Watcher::new(reconciler, kube_client, &config));

        let secrets_watcher = {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { watcher.watch_secrets().await })
        };
        let configuration_watcher = {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { watcher.watch_configurations().await })
        };
        let configuration_apply_watcher = {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { watcher.watch_configuration_applies().await })
        };
        let bootstrap_watcher = {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { watcher.watch_bootstraps().await })
        };
        let kubeconfig_watcher = tokio::spawn(async move { watcher.watch_kubeconfigs().await });

        ready.store(true, Ordering::SeqCst);
        info!("All watchers started");

        Ok(Self {
            secrets_watcher,
            configuration_watcher,
            configuration_apply_watcher,
            bootstrap_watcher,
            kubeconfig_watcher,
            metrics_server,
        })
    }

    /// Runs the controller until shutdown.
    ///
    /// Watchers stop on SIGTERM/SIGINT; the first one to exit ends the run.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Talos Controller running");

        let result = tokio::select! {
            result = &mut self.secrets_watcher => watcher_result("Secrets", result),
            result = &mut self.configuration_watcher => watcher_result("Configuration", result),
            result = &mut self.configuration_apply_watcher => watcher_result("ConfigurationApply", result),
            result = &mut self.bootstrap_watcher => watcher_result("Bootstrap", result),
            result = &mut self.kubeconfig_watcher => watcher_result("Kubeconfig", result),
            result = &mut self.metrics_server => watcher_result("Metrics server", result),
        };

        if let Err(e) = &result {
            error!("Controller stopping: {}", e);
        }
        self.metrics_server.abort();
        info!("Talos Controller stopped");
        result
    }
}
