//! Secrets CRD
//!
//! Generates the cluster-wide PKI material, tokens and the admin client
//! bundle. Once generated the material never changes.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::common::{ClientConfiguration, ManagedResourceSpec, ManagedSpec, ManagedStatus, ResourceStatus};

/// SecretsSpec defines the desired state of generated cluster secrets
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "talos.microscaler.io",
    version = "v1alpha1",
    kind = "Secrets",
    plural = "secrets",
    status = "SecretsStatus",
    category = "talos",
    printcolumn = r#"{"name":"READY","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"SYNCED","type":"string","jsonPath":".status.conditions[?(@.type=='Synced')].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SecretsSpec {
    /// Node the secrets are intended for (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    /// Talos version the secrets must be compatible with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub talos_version: Option<String>,

    /// Deletion policy and connection secret target
    #[serde(flatten)]
    pub managed: ManagedResourceSpec,
}

/// Generated secrets, each group serialized as a JSON document
#[derive(Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSecretsData {
    /// Cluster id/secret, bootstrap token and secretbox secret
    #[serde(default)]
    pub cluster_secrets: String,

    /// Kubernetes, aggregator and etcd CAs plus the service account key
    #[serde(default)]
    pub kubernetes_secrets: String,

    /// OS CA and trustd token
    #[serde(default)]
    pub trustd_info: String,
}

impl std::fmt::Debug for MachineSecretsData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineSecretsData").finish_non_exhaustive()
    }
}

/// SecretsStatus defines the observed state of generated cluster secrets
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretsStatus {
    /// Generated secrets bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_secrets: Option<MachineSecretsData>,

    /// Admin client bundle signed by the OS CA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_configuration: Option<ClientConfiguration>,

    /// When the secrets were generated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_time: Option<DateTime<Utc>>,

    /// Digest of the spec fields the secrets were generated for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_hash: Option<String>,

    /// Conditions and observed generation
    #[serde(flatten)]
    pub resource: ResourceStatus,
}

impl SecretsStatus {
    /// Both halves of the generated artifact are present
    pub fn is_generated(&self) -> bool {
        self.machine_secrets.is_some() && self.client_configuration.is_some()
    }
}

impl ManagedSpec for SecretsSpec {
    fn managed(&self) -> &ManagedResourceSpec {
        &self.managed
    }
}

impl ManagedStatus for SecretsStatus {
    fn resource(&self) -> &ResourceStatus {
        &self.resource
    }
    fn resource_mut(&mut self) -> &mut ResourceStatus {
        &mut self.resource
    }
}
