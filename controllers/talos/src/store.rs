//! Kubernetes-facing collaborators of the reconciliation driver
//!
//! The driver and the stages never hold an `Api` directly. They go through
//! these traits so every reconciler can run against in-memory fakes in unit
//! tests:
//!
//! - `StatusStore`: writes a record's status subresource
//! - `ResourceLookup`: reads an upstream record by name
//! - `ConnectionPublisher`: writes or removes a connection secret
//! - `CredentialResolver`: reads raw credential bytes from a Secret key

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use crds::{SecretKeySelector, SecretReference};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams};
use kube::core::object::HasStatus;
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::ControllerError;

/// Field manager for every server-side apply issued by the controller
pub const FIELD_MANAGER: &str = "talos-controller";

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const OWNER_ANNOTATION: &str = "talos.microscaler.io/owner";

/// Named byte values published into a connection secret
pub type ConnectionDetails = BTreeMap<String, Vec<u8>>;

/// Writes the status of records of kind `K`
#[async_trait]
pub trait StatusStore<K: HasStatus>: Send + Sync {
    /// Replace the status of record `name`
    async fn patch_status(&self, name: &str, status: &K::Status) -> Result<(), ControllerError>;

    /// Status of record `name` as the API server holds it now
    async fn current_status(&self, name: &str) -> Result<Option<K::Status>, ControllerError>;
}

/// Reads records of kind `K`
#[async_trait]
pub trait ResourceLookup<K>: Send + Sync {
    /// Fetch record `name`, `None` when it does not exist
    async fn get(&self, name: &str) -> Result<Option<K>, ControllerError>;
}

/// Publishes connection details into Kubernetes Secrets
#[async_trait]
pub trait ConnectionPublisher: Send + Sync {
    /// Create or replace the secret `target` with `details`
    async fn publish(&self, target: &SecretReference, owner: &str, details: &ConnectionDetails) -> Result<(), ControllerError>;

    /// Delete the secret `target` if it exists
    async fn unpublish(&self, target: &SecretReference) -> Result<(), ControllerError>;
}

/// Resolves a credential reference to raw bytes
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Bytes stored under the selected key
    async fn resolve(&self, selector: &SecretKeySelector) -> Result<Vec<u8>, ControllerError>;
}

/// `StatusStore` and `ResourceLookup` over a cluster-scoped `Api`
#[derive(Clone)]
pub struct KubeStore<K> {
    api: Api<K>,
}

impl<K> KubeStore<K> {
    /// Wrap an API handle
    pub fn new(api: Api<K>) -> Self {
        Self { api }
    }
}

impl<K> std::fmt::Debug for KubeStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl<K> StatusStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()> + HasStatus + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::Status: Serialize + Clone + Send + Sync,
{
    async fn patch_status(&self, name: &str, status: &K::Status) -> Result<(), ControllerError> {
        // Server-side apply drops fields the controller stopped setting
        let patch = serde_json::json!({
            "apiVersion": K::api_version(&()),
            "kind": K::kind(&()),
            "status": status,
        });
        self.api
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&patch))
            .await?;
        debug!("Patched status of {} {}", K::kind(&()), name);
        Ok(())
    }

    async fn current_status(&self, name: &str) -> Result<Option<K::Status>, ControllerError> {
        let live = self.api.get_status(name).await?;
        Ok(live.status().cloned())
    }
}

#[async_trait]
impl<K> ResourceLookup<K> for KubeStore<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>, ControllerError> {
        Ok(self.api.get_opt(name).await?)
    }
}

/// Publishes connection details as Opaque Secrets
#[derive(Clone)]
pub struct KubeConnectionPublisher {
    client: Client,
    default_namespace: String,
}

impl KubeConnectionPublisher {
    /// Publisher writing into `default_namespace` unless a reference names one
    pub fn new(client: Client, default_namespace: impl Into<String>) -> Self {
        Self {
            client,
            default_namespace: default_namespace.into(),
        }
    }

    fn api(&self, target: &SecretReference) -> Api<Secret> {
        let namespace = target.namespace.as_deref().unwrap_or(&self.default_namespace);
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl std::fmt::Debug for KubeConnectionPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeConnectionPublisher")
            .field("default_namespace", &self.default_namespace)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ConnectionPublisher for KubeConnectionPublisher {
    async fn publish(&self, target: &SecretReference, owner: &str, details: &ConnectionDetails) -> Result<(), ControllerError> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(target.name.clone()),
                labels: Some(BTreeMap::from([(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string())])),
                annotations: Some(BTreeMap::from([(OWNER_ANNOTATION.to_string(), owner.to_string())])),
                ..Default::default()
            },
            data: Some(
                details
                    .iter()
                    .map(|(key, value)| (key.clone(), ByteString(value.clone())))
                    .collect(),
            ),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        self.api(target)
            .patch(&target.name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
            .await?;
        info!("Published connection secret {} for {}", target.name, owner);
        Ok(())
    }

    async fn unpublish(&self, target: &SecretReference) -> Result<(), ControllerError> {
        match self.api(target).delete(&target.name, &Default::default()).await {
            Ok(_) => {
                info!("Removed connection secret {}", target.name);
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reads credential bundles from Kubernetes Secrets
#[derive(Clone)]
pub struct KubeCredentialResolver {
    client: Client,
}

impl KubeCredentialResolver {
    /// Resolver using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl std::fmt::Debug for KubeCredentialResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCredentialResolver").finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialResolver for KubeCredentialResolver {
    async fn resolve(&self, selector: &SecretKeySelector) -> Result<Vec<u8>, ControllerError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &selector.namespace);
        let secret = api.get_opt(&selector.name).await?.ok_or_else(|| {
            ControllerError::DependencyNotReady(format!(
                "credentials secret {}/{} not found",
                selector.namespace, selector.name
            ))
        })?;
        secret
            .data
            .and_then(|mut data| data.remove(&selector.key))
            .map(|bytes| bytes.0)
            .ok_or_else(|| {
                ControllerError::Credential(format!(
                    "secret {}/{} has no key {}",
                    selector.namespace, selector.name, selector.key
                ))
            })
    }
}
