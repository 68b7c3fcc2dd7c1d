//! Kubernetes resource watchers.
//!
//! Every provisioning kind is watched through the generic `watch_resource()`
//! helper, which runs a `kube_runtime::Controller` until shutdown.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crds::{Bootstrap, Configuration, ConfigurationApply, Kubeconfig, Secrets};
use futures::StreamExt;
use kube::{Api, ResourceExt};
use kube_runtime::controller::{Action, Config as RuntimeConfig};
use kube_runtime::{Controller, watcher};
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::managed::StageKind;
use crate::reconciler::Reconciler;

type ReconcileFuture = Pin<Box<dyn Future<Output = Result<Action, ControllerError>> + Send>>;

/// Runs a controller for one kind until the process is asked to stop.
///
/// Requeue timing after a failure comes from `Reconciler::error_action`, so
/// a record waiting on an upstream dependency is polled rather than backed
/// off.
async fn watch_resource<K, F>(
    api: Api<K>,
    reconciler: Arc<Reconciler>,
    reconcile_fn: F,
    kind: StageKind,
    runtime_config: RuntimeConfig,
) -> Result<(), ControllerError>
where
    K: kube::Resource + Clone + Send + Sync + 'static + std::fmt::Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default + std::cmp::Eq + std::hash::Hash + Clone + std::fmt::Debug + Unpin,
    F: Fn(Arc<Reconciler>, Arc<K>) -> ReconcileFuture + Send + Sync + Clone + 'static,
{
    info!("Starting {} watcher", kind);

    let error_policy = move |obj: Arc<K>, error: &ControllerError, ctx: Arc<Reconciler>| {
        let name = obj.name_any();
        if error.is_dependency_wait() {
            info!("{} {} is waiting: {}", kind, name, error);
        } else {
            warn!("Reconciliation error for {} {}: {}", kind, name, error);
        }
        ctx.error_action(kind, &name, error)
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        let reconcile_fn = reconcile_fn.clone();
        async move {
            debug!("Reconciling {} {}", kind, obj.name_any());
            reconcile_fn(ctx, obj).await
        }
    };

    Controller::new(api, watcher::Config::default())
        .with_config(runtime_config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled {} {}", kind, obj.name),
                Err(kube_runtime::controller::Error::ReconcilerFailed(_, obj)) => {
                    debug!("Reconcile of {} {} failed; requeued", kind, obj.name)
                }
                Err(e) => error!("Controller error for {}: {}", kind, e),
            }
        })
        .await;

    info!("{} watcher stopped", kind);
    Ok(())
}

/// Watches the provisioning CRDs.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    runtime_config: RuntimeConfig,
    secrets_api: Api<Secrets>,
    configuration_api: Api<Configuration>,
    configuration_apply_api: Api<ConfigurationApply>,
    bootstrap_api: Api<Bootstrap>,
    kubeconfig_api: Api<Kubeconfig>,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(reconciler: Arc<Reconciler>, client: kube::Client, config: &ControllerConfig) -> Self {
        let runtime_config = RuntimeConfig::default()
            .debounce(config.debounce)
            .concurrency(config.max_concurrent_reconciles);
        Self {
            reconciler,
            runtime_config,
            secrets_api: Api::all(client.clone()),
            configuration_api: Api::all(client.clone()),
            configuration_apply_api: Api::all(client.clone()),
            bootstrap_api: Api::all(client.clone()),
            kubeconfig_api: Api::all(client),
        }
    }

    /// Starts watching Secrets resources.
    pub async fn watch_secrets(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.secrets_api.clone(),
            Arc::clone(&self.reconciler),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_secrets(resource).await }),
            StageKind::Secrets,
            self.runtime_config.clone(),
        )
        .await
    }

    /// Starts watching Configuration resources.
    pub async fn watch_configurations(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.configuration_api.clone(),
            Arc::clone(&self.reconciler),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_configuration(resource).await }),
            StageKind::Configuration,
            self.runtime_config.clone(),
        )
        .await
    }

    /// Starts watching ConfigurationApply resources.
    pub async fn watch_configuration_applies(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.configuration_apply_api.clone(),
            Arc::clone(&self.reconciler),
            |reconciler, resource| {
                Box::pin(async move { reconciler.reconcile_configuration_apply(resource).await })
            },
            StageKind::ConfigurationApply,
            self.runtime_config.clone(),
        )
        .await
    }

    /// Starts watching Bootstrap resources.
    pub async fn watch_bootstraps(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.bootstrap_api.clone(),
            Arc::clone(&self.reconciler),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_bootstrap(resource).await }),
            StageKind::Bootstrap,
            self.runtime_config.clone(),
        )
        .await
    }

    /// Starts watching Kubeconfig resources.
    pub async fn watch_kubeconfigs(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.kubeconfig_api.clone(),
            Arc::clone(&self.reconciler),
            |reconciler, resource| Box::pin(async move { reconciler.reconcile_kubeconfig(resource).await }),
            StageKind::Kubeconfig,
            self.runtime_config.clone(),
        )
        .await
    }
}
