//! Kubeconfig CRD
//!
//! Retrieves Kubernetes admin credentials from a bootstrapped cluster.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::common::{CredentialSource, ManagedResourceSpec, ManagedSpec, ManagedStatus, ResourceStatus};
use crate::references::ResourceReference;

/// KubeconfigSpec names the control plane node to read credentials from
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "talos.microscaler.io",
    version = "v1alpha1",
    kind = "Kubeconfig",
    status = "KubeconfigStatus",
    category = "talos",
    printcolumn = r#"{"name":"READY","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"SYNCED","type":"string","jsonPath":".status.conditions[?(@.type=='Synced')].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigSpec {
    /// Control plane node
    pub node: String,

    /// Endpoint to dial instead of the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Bootstrap record that must report `bootstrapped` first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_ref: Option<ResourceReference>,

    /// Credentials for the machine API
    #[serde(flatten)]
    pub credentials: CredentialSource,

    /// Deletion policy and connection secret target
    #[serde(flatten)]
    pub managed: ManagedResourceSpec,
}

/// Kubernetes client credentials extracted from the kubeconfig
#[derive(Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesClientConfiguration {
    /// API server URL
    pub host: String,

    /// Cluster CA certificate (PEM)
    pub ca_certificate: String,

    /// Admin client certificate (PEM)
    pub client_certificate: String,

    /// Admin client key (PEM)
    pub client_key: String,
}

impl std::fmt::Debug for KubernetesClientConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesClientConfiguration")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// KubeconfigStatus holds the retrieved credentials
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigStatus {
    /// Retrieved credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_client_configuration: Option<KubernetesClientConfiguration>,

    /// When the credentials were retrieved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieved_time: Option<DateTime<Utc>>,

    /// Conditions and observed generation
    #[serde(flatten)]
    pub resource: ResourceStatus,
}

impl ManagedSpec for KubeconfigSpec {
    fn managed(&self) -> &ManagedResourceSpec {
        &self.managed
    }
}

impl ManagedStatus for KubeconfigStatus {
    fn resource(&self) -> &ResourceStatus {
        &self.resource
    }
    fn resource_mut(&mut self) -> &mut ResourceStatus {
        &mut self.resource
    }
}
