//! Reconciliation logic for the Talos provisioning CRDs.
//!
//! One stage per kind, each plugged into the generic driver in
//! `crate::managed`:
//! - `secrets`: cluster PKI generation
//! - `configuration`: machine configuration rendering
//! - `configuration_apply`: pushing a document to a node
//! - `bootstrap`: one-time etcd bootstrap
//! - `kubeconfig`: admin kubeconfig retrieval
//!
//! `Reconciler` wraps every pass in the finalizer protocol, a deadline, the
//! shared rate limiter, per-record backoff and metrics.

pub mod bootstrap;
#[cfg(test)]
mod bootstrap_test;
pub mod configuration;
pub mod configuration_apply;
#[cfg(test)]
mod configuration_apply_test;
pub mod credentials;
pub mod kubeconfig;
#[cfg(test)]
mod pipeline_test;
pub mod secrets;
#[cfg(test)]
mod secrets_test;
pub mod session;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crds::{Bootstrap, Configuration, ConfigurationApply, Kubeconfig, Secrets};
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::Action;
use kube_runtime::finalizer::{Error as FinalizerError, Event as FinalizerEvent, finalizer};
use serde::Serialize;
use serde::de::DeserializeOwned;
use talos_client::MachineConnector;
use tracing::{debug, error, info};

use crate::backoff::{ExponentialBackoff, RateLimiter};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::managed::{ManagedReconciler, Stage, StageKind};
use crate::metrics::Metrics;
use crate::store::{ConnectionPublisher, KubeConnectionPublisher, KubeCredentialResolver, KubeStore, StatusStore};

use bootstrap::BootstrapStage;
use configuration::ConfigurationStage;
use configuration_apply::ConfigurationApplyStage;
use credentials::CredentialContext;
use kubeconfig::KubeconfigStage;
use secrets::SecretsStage;

/// Finalizer placed on every provisioning record
pub const FINALIZER: &str = "talos.microscaler.io/finalizer";

/// Backoff state for a record
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: ExponentialBackoff,
    error_count: u32,
}

impl BackoffState {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            backoff: ExponentialBackoff::new(base, max),
            error_count: 0,
        }
    }

    fn increment_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
    }
}

/// Backoff state per record, keyed by `Kind/name`
///
/// Only failing records have an entry; it is dropped on the next successful
/// pass, including the cleanup pass that removes the finalizer.
#[derive(Debug)]
struct BackoffStates {
    base: Duration,
    max: Duration,
    states: Mutex<HashMap<String, BackoffState>>,
}

impl BackoffStates {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BackoffState>> {
        match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Count a failed pass, returning the consecutive failures so far
    fn record_failure(&self, key: &str) -> u32 {
        let mut states = self.lock();
        let state = states
            .entry(key.to_string())
            .or_insert_with(|| BackoffState::new(self.base, self.max));
        state.increment_error();
        state.error_count
    }

    fn next_backoff(&self, key: &str) -> Duration {
        let mut states = self.lock();
        states
            .entry(key.to_string())
            .or_insert_with(|| BackoffState::new(self.base, self.max))
            .backoff
            .next_backoff()
    }

    /// Drop the record's state, returning its failure count if it had one
    fn clear(&self, key: &str) -> Option<u32> {
        self.lock().remove(key).map(|state| state.error_count)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Requeue delay after a failed pass
///
/// Waiting on an upstream record is not a failure of this one: it is polled
/// at the normal interval without escalating. Errors that need an operator
/// wait the longest backoff. Everything else backs off per record.
pub fn requeue_delay(
    error: &ControllerError,
    poll_interval: Duration,
    backoff_max: Duration,
    next_backoff: impl FnOnce() -> Duration,
) -> Duration {
    if error.is_dependency_wait() {
        poll_interval
    } else if error.is_fatal() {
        backoff_max
    } else {
        next_backoff()
    }
}

fn managed<S: Stage>(
    stage: S,
    store: Arc<dyn StatusStore<S::Resource>>,
    publisher: &Arc<dyn ConnectionPublisher>,
    config: &ControllerConfig,
) -> ManagedReconciler<S> {
    ManagedReconciler::new(
        stage,
        store,
        Arc::clone(publisher),
        config.poll_interval,
        config.short_requeue,
    )
}

/// Reconciles the Talos provisioning kinds.
pub struct Reconciler {
    secrets: ManagedReconciler<SecretsStage>,
    configurations: ManagedReconciler<ConfigurationStage>,
    applies: ManagedReconciler<ConfigurationApplyStage>,
    bootstraps: ManagedReconciler<BootstrapStage>,
    kubeconfigs: ManagedReconciler<KubeconfigStage>,
    secrets_api: Api<Secrets>,
    configuration_api: Api<Configuration>,
    configuration_apply_api: Api<ConfigurationApply>,
    bootstrap_api: Api<Bootstrap>,
    kubeconfig_api: Api<Kubeconfig>,
    metrics: Arc<Metrics>,
    rate_limiter: RateLimiter,
    poll_interval: Duration,
    reconcile_timeout: Duration,
    backoff_max: Duration,
    backoff_states: BackoffStates,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("poll_interval", &self.poll_interval)
            .field("reconcile_timeout", &self.reconcile_timeout)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        client: Client,
        config: &ControllerConfig,
        connector: Arc<dyn MachineConnector>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let secrets_api: Api<Secrets> = Api::all(client.clone());
        let configuration_api: Api<Configuration> = Api::all(client.clone());
        let configuration_apply_api: Api<ConfigurationApply> = Api::all(client.clone());
        let bootstrap_api: Api<Bootstrap> = Api::all(client.clone());
        let kubeconfig_api: Api<Kubeconfig> = Api::all(client.clone());

        let secrets_store = Arc::new(KubeStore::new(secrets_api.clone()));
        let configuration_store = Arc::new(KubeStore::new(configuration_api.clone()));
        let bootstrap_store = Arc::new(KubeStore::new(bootstrap_api.clone()));
        let publisher: Arc<dyn ConnectionPublisher> = Arc::new(KubeConnectionPublisher::new(
            client.clone(),
            config.connection_secret_namespace.clone(),
        ));
        let credentials = CredentialContext::new(
            Arc::clone(&secrets_store) as _,
            Arc::new(KubeCredentialResolver::new(client)),
        );

        Self {
            secrets: managed(SecretsStage, Arc::clone(&secrets_store) as _, &publisher, config),
            configurations: managed(
                ConfigurationStage::new(secrets_store, config.render.clone()),
                Arc::clone(&configuration_store) as _,
                &publisher,
                config,
            ),
            applies: managed(
                ConfigurationApplyStage::new(configuration_store, credentials.clone(), Arc::clone(&connector)),
                Arc::new(KubeStore::new(configuration_apply_api.clone())),
                &publisher,
                config,
            ),
            bootstraps: managed(
                BootstrapStage::new(credentials.clone(), Arc::clone(&connector)),
                Arc::clone(&bootstrap_store) as _,
                &publisher,
                config,
            ),
            kubeconfigs: managed(
                KubeconfigStage::new(bootstrap_store, credentials, connector),
                Arc::new(KubeStore::new(kubeconfig_api.clone())),
                &publisher,
                config,
            ),
            secrets_api,
            configuration_api,
            configuration_apply_api,
            bootstrap_api,
            kubeconfig_api,
            metrics,
            rate_limiter: RateLimiter::new(config.global_rate_limit),
            poll_interval: config.poll_interval,
            reconcile_timeout: config.reconcile_timeout,
            backoff_max: config.backoff_max,
            backoff_states: BackoffStates::new(config.backoff_base, config.backoff_max),
        }
    }

    /// Reconciles a Secrets record.
    pub async fn reconcile_secrets(&self, record: Arc<Secrets>) -> Result<Action, ControllerError> {
        self.run(&self.secrets_api, &self.secrets, record).await
    }

    /// Reconciles a Configuration record.
    pub async fn reconcile_configuration(&self, record: Arc<Configuration>) -> Result<Action, ControllerError> {
        self.run(&self.configuration_api, &self.configurations, record).await
    }

    /// Reconciles a ConfigurationApply record.
    pub async fn reconcile_configuration_apply(&self, record: Arc<ConfigurationApply>) -> Result<Action, ControllerError> {
        self.run(&self.configuration_apply_api, &self.applies, record).await
    }

    /// Reconciles a Bootstrap record.
    pub async fn reconcile_bootstrap(&self, record: Arc<Bootstrap>) -> Result<Action, ControllerError> {
        self.run(&self.bootstrap_api, &self.bootstraps, record).await
    }

    /// Reconciles a Kubeconfig record.
    pub async fn reconcile_kubeconfig(&self, record: Arc<Kubeconfig>) -> Result<Action, ControllerError> {
        self.run(&self.kubeconfig_api, &self.kubeconfigs, record).await
    }

    async fn run<S>(
        &self,
        api: &Api<S::Resource>,
        driver: &ManagedReconciler<S>,
        record: Arc<S::Resource>,
    ) -> Result<Action, ControllerError>
    where
        S: Stage,
        S::Resource: Serialize + DeserializeOwned,
    {
        let key = format!("{}/{}", S::KIND, record.name_any());
        if let Some(wait) = self.rate_limiter.acquire() {
            debug!("Rate limited {}; retrying in {:?}", key, wait);
            return Ok(Action::requeue(wait));
        }

        let started = Instant::now();
        let pass = finalizer(api, FINALIZER, record, |event| async move {
            match event {
                FinalizerEvent::Apply(resource) => driver.reconcile(&resource).await,
                FinalizerEvent::Cleanup(resource) => driver.cleanup(&resource).await,
            }
        });
        let result = match tokio::time::timeout(self.reconcile_timeout, pass).await {
            Ok(Ok(action)) => Ok(action),
            Ok(Err(FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e))) => Err(e),
            Ok(Err(e)) => Err(ControllerError::Finalizer(e.to_string())),
            Err(_) => Err(ControllerError::Timeout(self.reconcile_timeout)),
        };

        let elapsed = started.elapsed();
        match &result {
            Ok(_) => {
                self.metrics.record_success(S::KIND.as_str(), elapsed);
                if let Some(failures) = self.backoff_states.clear(&key) {
                    info!("{} recovered after {} failure(s)", key, failures);
                }
            }
            Err(e) => {
                self.metrics.record_error(S::KIND.as_str(), e, elapsed);
                if !e.is_dependency_wait() {
                    let failures = self.backoff_states.record_failure(&key);
                    debug!("{} has failed {} time(s) in a row", key, failures);
                }
            }
        }
        result
    }

    /// Requeue action for a record whose pass failed
    pub fn error_action(&self, kind: StageKind, name: &str, error: &ControllerError) -> Action {
        let key = format!("{kind}/{name}");
        let delay = requeue_delay(error, self.poll_interval, self.backoff_max, || {
            self.backoff_states.next_backoff(&key)
        });
        if error.is_fatal() {
            error!("{} needs operator attention: {}", key, error);
        }
        Action::requeue(delay)
    }
}
