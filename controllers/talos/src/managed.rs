//! Generic managed-resource reconciliation driver
//!
//! Every provisioning kind plugs into the same four-operation contract
//! (connect, observe, create/update, delete) through the `Stage` trait. The
//! driver owns everything around it: conditions, status persistence,
//! connection secret publication and the rule that `create` is only ever
//! called when `observe` reports the resource absent.
//!
//! Each stage names its own connection type, so a stage can only ever be
//! handed the service it built in `connect`. The connection is dropped at the
//! end of the pass, closing any machine API channel it opened.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crds::{Condition, ConditionType, DeletionPolicy, ManagedResourceSpec, ManagedSpec, ManagedStatus};
use kube::core::object::{HasSpec, HasStatus};
use kube::{Resource, ResourceExt};
use kube_runtime::controller::Action;
use tracing::{debug, info, warn};

use crate::error::ControllerError;
use crate::store::{ConnectionDetails, ConnectionPublisher, StatusStore};

/// The provisioning kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Cluster PKI generation
    Secrets,
    /// Machine configuration rendering
    Configuration,
    /// Configuration push to a node
    ConfigurationApply,
    /// One-time etcd bootstrap
    Bootstrap,
    /// Admin kubeconfig retrieval
    Kubeconfig,
}

impl StageKind {
    /// Kind name, as used in logs and metric labels
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Secrets => "Secrets",
            Self::Configuration => "Configuration",
            Self::ConfigurationApply => "ConfigurationApply",
            Self::Bootstrap => "Bootstrap",
            Self::Kubeconfig => "Kubeconfig",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What `observe` found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// The remote or generated resource exists
    pub resource_exists: bool,
    /// It matches the desired state
    pub resource_up_to_date: bool,
    /// Connection details to (re)publish for a converged record
    pub connection_details: Option<ConnectionDetails>,
}

impl Observation {
    /// Nothing exists yet
    pub fn absent() -> Self {
        Self::default()
    }

    /// Exists but differs from the desired state
    pub fn stale() -> Self {
        Self {
            resource_exists: true,
            ..Self::default()
        }
    }

    /// Exists and matches the desired state
    pub fn up_to_date() -> Self {
        Self {
            resource_exists: true,
            resource_up_to_date: true,
            connection_details: None,
        }
    }

    /// Attach connection details
    #[must_use]
    pub fn with_details(mut self, details: ConnectionDetails) -> Self {
        self.connection_details = Some(details);
        self
    }
}

/// A provisioning record the driver can manage
pub trait ManagedResource: Resource<DynamicType = ()> + HasStatus + Clone + std::fmt::Debug + Send + Sync + 'static {
    /// The managed-resource envelope of the spec
    fn managed(&self) -> &ManagedResourceSpec;
}

impl<K> ManagedResource for K
where
    K: Resource<DynamicType = ()> + HasSpec + HasStatus + Clone + std::fmt::Debug + Send + Sync + 'static,
    K::Spec: ManagedSpec,
{
    fn managed(&self) -> &ManagedResourceSpec {
        self.spec().managed()
    }
}

/// One provisioning kind's operations
///
/// Stages mutate only the status they are handed; the driver decides what is
/// persisted and when.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    /// Record type
    type Resource: ManagedResource<Status = Self::Status>;
    /// Status type of the record
    type Status: ManagedStatus + Send + Sync + 'static;
    /// Per-pass service built by `connect`
    type Connection: Send + Sync;

    /// Which kind this is
    const KIND: StageKind;

    /// `create` must reach the remote side at most once. The driver checks
    /// the live status before issuing it, since the record it was handed may
    /// come from a lagging cache.
    const SINGLE_FIRE: bool = false;

    /// Resolve credentials and upstream artifacts
    async fn connect(&self, resource: &Self::Resource) -> Result<Self::Connection, ControllerError>;

    /// Report whether the resource exists and is up to date
    async fn observe(
        &self,
        connection: &Self::Connection,
        resource: &Self::Resource,
        status: &mut Self::Status,
    ) -> Result<Observation, ControllerError>;

    /// Bring the resource into existence
    async fn create(
        &self,
        connection: &Self::Connection,
        resource: &Self::Resource,
        status: &mut Self::Status,
    ) -> Result<Option<ConnectionDetails>, ControllerError>;

    /// Bring an existing resource up to date
    async fn update(
        &self,
        connection: &Self::Connection,
        resource: &Self::Resource,
        status: &mut Self::Status,
    ) -> Result<Option<ConnectionDetails>, ControllerError>;

    /// Remove the resource
    async fn delete(
        &self,
        connection: &Self::Connection,
        resource: &Self::Resource,
        status: &mut Self::Status,
    ) -> Result<(), ControllerError>;

    /// Mark that a single-fire `create` is about to be issued
    ///
    /// Returning true makes the driver persist the status before calling
    /// `create`.
    fn record_intent(&self, _status: &mut Self::Status, _now: DateTime<Utc>) -> bool {
        false
    }
}

/// Drives one stage's records toward their desired state
pub struct ManagedReconciler<S: Stage> {
    stage: S,
    store: Arc<dyn StatusStore<S::Resource>>,
    publisher: Arc<dyn ConnectionPublisher>,
    poll_interval: Duration,
    short_requeue: Duration,
}

impl<S: Stage> std::fmt::Debug for ManagedReconciler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedReconciler")
            .field("kind", &S::KIND)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl<S: Stage> ManagedReconciler<S> {
    /// Driver for `stage`
    pub fn new(
        stage: S,
        store: Arc<dyn StatusStore<S::Resource>>,
        publisher: Arc<dyn ConnectionPublisher>,
        poll_interval: Duration,
        short_requeue: Duration,
    ) -> Self {
        Self {
            stage,
            store,
            publisher,
            poll_interval,
            short_requeue,
        }
    }

    /// One reconciliation pass for a live record
    pub async fn reconcile(&self, resource: &S::Resource) -> Result<Action, ControllerError> {
        let name = resource.name_any();
        let mut persisted = resource.status().cloned().unwrap_or_default();
        let mut status = persisted.clone();

        let result = self.converge(resource, &name, &mut status, &mut persisted).await;
        let now = Utc::now();
        match result {
            Ok((action, details)) => {
                let resource_status = status.resource_mut();
                resource_status.observed_generation = resource.meta().generation;
                resource_status.set_condition(Condition::reconcile_success(), now);
                self.write_status(&name, &mut persisted, &status).await?;
                if let Some(details) = details {
                    self.publish(resource, &name, &details).await?;
                }
                Ok(action)
            }
            Err(error) => {
                let resource_status = status.resource_mut();
                resource_status.set_condition(Condition::reconcile_error(error.to_string()), now);
                if resource_status.condition(ConditionType::Ready).is_none() {
                    resource_status.set_condition(Condition::unavailable(None), now);
                }
                if let Err(write_error) = self.write_status(&name, &mut persisted, &status).await {
                    warn!("Failed to record error on {} {}: {}", S::KIND, name, write_error);
                }
                Err(error)
            }
        }
    }

    async fn converge(
        &self,
        resource: &S::Resource,
        name: &str,
        status: &mut S::Status,
        persisted: &mut S::Status,
    ) -> Result<(Action, Option<ConnectionDetails>), ControllerError> {
        let connection = self.stage.connect(resource).await?;
        let mut observation = self.stage.observe(&connection, resource, status).await?;
        if !observation.resource_exists && S::SINGLE_FIRE {
            if let Some(live) = self.store.current_status(name).await? {
                if live != *persisted {
                    debug!("{} {}: cached status is behind the API server; observing live status", S::KIND, name);
                    *status = live.clone();
                    *persisted = live;
                    observation = self.stage.observe(&connection, resource, status).await?;
                }
            }
        }
        debug!(
            "{} {}: exists={} up_to_date={}",
            S::KIND,
            name,
            observation.resource_exists,
            observation.resource_up_to_date
        );

        if !observation.resource_exists {
            let now = Utc::now();
            if self.stage.record_intent(status, now) {
                // Must be durable before the call goes out
                self.write_status(name, persisted, status).await?;
            }
            info!("Creating {} {}", S::KIND, name);
            let details = self.stage.create(&connection, resource, status).await?;
            status.resource_mut().set_condition(Condition::creating(), now);
            return Ok((Action::requeue(self.short_requeue), details));
        }

        if !observation.resource_up_to_date {
            info!("Updating {} {}", S::KIND, name);
            let details = self.stage.update(&connection, resource, status).await?;
            status.resource_mut().set_condition(Condition::available(), Utc::now());
            return Ok((Action::requeue(self.short_requeue), details));
        }

        status.resource_mut().set_condition(Condition::available(), Utc::now());
        Ok((Action::requeue(self.poll_interval), observation.connection_details))
    }

    /// Deletion pass: runs the stage's delete unless orphaned, then removes
    /// the connection secret
    pub async fn cleanup(&self, resource: &S::Resource) -> Result<Action, ControllerError> {
        let name = resource.name_any();
        let mut persisted = resource.status().cloned().unwrap_or_default();
        let mut status = persisted.clone();
        status.resource_mut().set_condition(Condition::deleting(), Utc::now());
        self.write_status(&name, &mut persisted, &status).await?;

        match resource.managed().deletion_policy {
            DeletionPolicy::Orphan => info!("Orphaning {} {}", S::KIND, name),
            DeletionPolicy::Delete => match self.stage.connect(resource).await {
                Ok(connection) => {
                    let observation = self.stage.observe(&connection, resource, &mut status).await?;
                    if observation.resource_exists {
                        info!("Deleting {} {}", S::KIND, name);
                        self.stage.delete(&connection, resource, &mut status).await?;
                    }
                }
                Err(e) if e.is_dependency_wait() || e.is_fatal() => {
                    warn!("Skipping delete of {} {}: {}", S::KIND, name, e);
                }
                Err(e) => return Err(e),
            },
        }

        if let Some(target) = &resource.managed().write_connection_secret_to_ref {
            self.publisher.unpublish(target).await?;
        }
        self.write_status(&name, &mut persisted, &status).await?;
        Ok(Action::await_change())
    }

    async fn write_status(&self, name: &str, persisted: &mut S::Status, status: &S::Status) -> Result<(), ControllerError> {
        if status == persisted {
            return Ok(());
        }
        self.store.patch_status(name, status).await?;
        *persisted = status.clone();
        Ok(())
    }

    async fn publish(&self, resource: &S::Resource, name: &str, details: &ConnectionDetails) -> Result<(), ControllerError> {
        match &resource.managed().write_connection_secret_to_ref {
            Some(target) => {
                self.publisher
                    .publish(target, &format!("{}/{}", S::KIND, name), details)
                    .await
            }
            None => Ok(()),
        }
    }
}
